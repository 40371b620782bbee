//! End-to-end scenarios: grant a layout, resolve the device, do DS I/O

use crate::harness::{TestEnv, EXPORT_ID};

use gannetfs_fsal::ErrorKind;
use gannetfs_pnfs::{
    IoMode, LayoutState, PnfsError, Stability, XdrDecoder,
};

const TEN_MIB: usize = 10 * 1024 * 1024;

#[test]
fn scenario_whole_file_layout_grant_and_device_resolution() {
    // Create a 10 MiB file, request a whole-file READ_WRITE layout, and
    // chase the device id all the way to an (address, port) pair.
    let env = TestEnv::new();
    let file = env.create_file("ten-mib", TEN_MIB);

    let segment = env
        .engine
        .layout_get(&file, 1, 1, 0, u64::MAX, IoMode::ReadWrite)
        .unwrap();

    assert!(segment.last_segment);
    assert!(segment.return_on_close);
    assert_eq!(segment.offset, 0);
    assert_eq!(segment.length, u64::MAX);
    assert!(!segment.ds_handles.is_empty());

    let key = file.handle_to_key();
    assert_eq!(env.engine.state(&key, 1, 1), LayoutState::Granted);

    // The device id must be resolvable to at least one address tuple.
    let body = env.devices.getdeviceinfo(&segment.device_id).unwrap();
    let mut dec = XdrDecoder::new(body);
    let stripe_count = dec.decode_u32().unwrap();
    assert!(stripe_count >= 1);
    for _ in 0..stripe_count {
        dec.decode_u32().unwrap();
    }
    let ds_count = dec.decode_u32().unwrap();
    assert!(ds_count >= 1);
    let family = dec.decode_u32().unwrap();
    let addr = dec.decode_u32().unwrap();
    let port = dec.decode_u32().unwrap();
    assert_eq!(family, 2);
    assert_ne!(addr, 0);
    assert_eq!(port, 2049);
}

#[test]
fn scenario_truncated_wire_handle_is_bad_handle() {
    // from_wire on a byte string one byte shorter than the expected size
    // must report BadHandle, not crash.
    let env = TestEnv::new();
    let file = env.create_file("victim", 64);
    let wire = file.handle_to_wire(true).unwrap();
    let short = &wire.as_bytes()[..wire.len() - 1];

    let err = env.data_server.make_ds_handle(short, true).unwrap_err();
    match err {
        PnfsError::Io(e) => assert_eq!(e.kind, ErrorKind::BadHandle),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn scenario_file_sync_write_verifier_matches_commit() {
    // A FILE_SYNC write against a commit-through-MDS backend: stability
    // is honored and the commit verifier matches the write's.
    let env = TestEnv::new();
    let file = env.create_file("syncfile", 1024);
    let wire = file.handle_to_wire(true).unwrap();
    let handle = env
        .data_server
        .make_ds_handle(wire.as_bytes(), true)
        .unwrap();

    let (written, got, write_verifier) =
        handle.write(0, b"stable data", Stability::FileSync).unwrap();
    assert_eq!(written, 11);
    assert_eq!(got, Stability::FileSync);

    let commit_verifier = handle.commit(0, 11).unwrap();
    assert_eq!(write_verifier, commit_verifier);
    handle.release();
}

#[test]
fn scenario_ds_write_visible_through_mds_read() {
    let env = TestEnv::new();
    let file = env.create_file("shared", 32);
    let wire = file.handle_to_wire(true).unwrap();
    let handle = env
        .data_server
        .make_ds_handle(wire.as_bytes(), true)
        .unwrap();

    handle.write(0, b"DSWROTE", Stability::DataSync).unwrap();
    handle.release();

    let (data, _) = file.read(0, 7).unwrap();
    assert_eq!(&data, b"DSWROTE");
}

#[test]
fn scenario_layout_return_is_idempotent() {
    let env = TestEnv::new();
    let file = env.create_file("returnable", 128);
    env.engine
        .layout_get(&file, 3, 1, 0, u64::MAX, IoMode::Read)
        .unwrap();

    let key = file.handle_to_key();
    env.engine
        .layout_return(&key, 3, 1, 0, u64::MAX, false)
        .unwrap();
    let after_first = env.engine.state(&key, 3, 1);
    env.engine
        .layout_return(&key, 3, 1, 0, u64::MAX, false)
        .unwrap();
    let after_second = env.engine.state(&key, 3, 1);

    assert_eq!(after_first, LayoutState::Returned);
    assert_eq!(after_first, after_second);
}

#[test]
fn scenario_regrant_of_covered_range_succeeds() {
    let env = TestEnv::new();
    let file = env.create_file("regrant", 128);
    let first = env
        .engine
        .layout_get(&file, 4, 1, 0, 4096, IoMode::ReadWrite)
        .unwrap();
    let second = env
        .engine
        .layout_get(&file, 4, 1, 0, 4096, IoMode::ReadWrite)
        .unwrap();
    assert_eq!(first.device_id, second.device_id);
    assert!(second.covers(0, 4096));
}

#[test]
fn scenario_incompatible_overlap_refused() {
    let env = TestEnv::new();
    let file = env.create_file("conflict", 128);
    env.engine
        .layout_get(&file, 5, 1, 0, u64::MAX, IoMode::ReadWrite)
        .unwrap();
    let err = env
        .engine
        .layout_get(&file, 5, 1, 0, 4096, IoMode::Read)
        .unwrap_err();
    assert_eq!(err, PnfsError::ConflictingLayout);
    assert!(err.is_layout_protocol_error());
}

#[test]
fn scenario_unsupported_layout_type_distinct_from_io_error() {
    let env = TestEnv::new();
    let file = env.create_file("wrongtype", 16);
    let err = env
        .engine
        .layout_get(&file, 6, 99, 0, u64::MAX, IoMode::Read)
        .unwrap_err();
    assert!(matches!(
        err,
        PnfsError::UnsupportedLayoutType { layout_type: 99 }
    ));
    assert!(err.is_layout_protocol_error());
}

#[test]
fn scenario_commit_grows_size_monotonically() {
    let env = TestEnv::new();
    let file = env.create_file("growing", 10);

    let result = env
        .engine
        .layout_commit(&file, 7, 1, Some(100), None)
        .unwrap();
    assert_eq!(result.new_size, Some(100));

    // A stale commit with a smaller size regresses nothing.
    let result = env
        .engine
        .layout_commit(&file, 7, 1, Some(50), None)
        .unwrap();
    assert_eq!(result.new_size, None);
    assert_eq!(file.attributes().unwrap().size, 100);
}

#[test]
fn scenario_commit_advances_mtime_only_forward() {
    use gannetfs_fsal::Timespec;

    let env = TestEnv::new();
    let file = env.create_file("timed", 10);

    let future = Timespec::new(4_000_000_000, 0);
    env.engine
        .layout_commit(&file, 8, 1, None, Some(future))
        .unwrap();
    assert_eq!(file.attributes().unwrap().mtime, future);

    let past = Timespec::new(1_000_000_000, 0);
    env.engine
        .layout_commit(&file, 8, 1, None, Some(past))
        .unwrap();
    assert_eq!(file.attributes().unwrap().mtime, future);
}

#[test]
fn scenario_stripe_overflow_still_encodes_completely() {
    use gannetfs_pnfs::{LayoutEngine, LayoutEngineConfig, DeviceRegistry, DsAddr};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    // More data servers than the pattern width: the encoding is complete
    // and every named stripe resolves.
    let env = TestEnv::with_data_servers(0);
    let devices = Arc::new(DeviceRegistry::new());
    let engine = LayoutEngine::new(
        LayoutEngineConfig {
            stripe_width: 4,
            ..Default::default()
        },
        devices.clone(),
    )
    .unwrap();
    for n in 0..24usize {
        engine.add_data_server(DsAddr::tcp(Ipv4Addr::new(10, 2, 0, (n + 1) as u8), 2049));
    }

    let file = env.create_file("wide", 256);
    let segment = engine
        .layout_get(&file, 9, 1, 0, u64::MAX, IoMode::Read)
        .unwrap();
    assert_eq!(segment.ds_handles.len(), 4);

    let body = devices.getdeviceinfo(&segment.device_id).unwrap();
    let mut dec = XdrDecoder::new(body);
    assert_eq!(dec.decode_u32().unwrap(), 4);

    // The loc_body encoding round-trips its handle list.
    let loc = segment.encode_loc_body();
    let mut dec = XdrDecoder::new(loc);
    let device_bytes = dec.decode_opaque_fixed(16).unwrap();
    assert_eq!(device_bytes, segment.device_id.to_bytes());
    let _nfl_util = dec.decode_u32().unwrap();
    let _first_stripe = dec.decode_u32().unwrap();
    let _pattern_offset = dec.decode_u64().unwrap();
    let fh_count = dec.decode_u32().unwrap();
    assert_eq!(fh_count, 4);
    for fh in &segment.ds_handles {
        assert_eq!(&dec.decode_opaque_variable().unwrap(), fh);
    }
}

#[test]
fn scenario_export_quota_passthrough() {
    use gannetfs_fsal::{QuotaKind, QuotaLimits};

    let env = TestEnv::new();
    let limits = QuotaLimits {
        hard_limit: 1 << 20,
        soft_limit: 1 << 19,
        grace_seconds: 3600,
        usage: 0,
    };
    env.export
        .set_quota("/mem/projects", QuotaKind::Block, 1000, &limits)
        .unwrap();
    let got = env
        .export
        .get_quota("/mem/projects", QuotaKind::Block, 1000)
        .unwrap();
    assert_eq!(got, limits);

    // A path outside the export's filesystem is rejected by the core.
    let err = env
        .export
        .get_quota("/other/fs", QuotaKind::Block, 1000)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}

#[test]
fn scenario_wire_handle_round_trip_through_export() {
    let env = TestEnv::new();
    let file = env.create_file("round", 8);

    let wire = file.handle_to_wire(true).unwrap();
    let host = env.export.wire_to_host(wire.as_bytes(), true).unwrap();
    let key_direct = file.handle_to_key();
    let key_round = env.export.host_to_key(&host);
    assert_eq!(key_direct, key_round);

    let rebuilt = env.export.create_handle_from_host(&host).unwrap();
    assert_eq!(rebuilt.attributes().unwrap().size, 8);
}

#[test]
fn scenario_foreign_export_handle_rejected() {
    let env = TestEnv::new();
    let file = env.create_file("foreign", 8);
    let host = file.host_handle();
    let wire = gannetfs_fsal::handle::encode_wire(EXPORT_ID + 1, &host, true).unwrap();
    let err = env.export.wire_to_host(wire.as_bytes(), true).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadHandle);
}

#[test]
fn scenario_unexport_releases_claims_and_module() {
    let env = TestEnv::new();
    let module = env.registry.lookup("MEM").unwrap();
    assert_eq!(module.module().export_ids(), vec![EXPORT_ID]);
    drop(module);

    env.exports.remove(EXPORT_ID).unwrap();
    let module = env.registry.lookup("MEM").unwrap();
    assert!(module.module().export_ids().is_empty());
}
