//! Cross-subsystem concurrency scenarios

use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::harness::TestEnv;

use gannetfs_pnfs::{DataServer, Stability};
use gannetfs_upcall::{ObjectKey, UpcallEvent};

#[test]
fn racing_commits_resolve_to_largest_size() {
    // Two concurrent layout_commit calls with new_size 100 and 50 against
    // a file of size 10: the final recorded size is 100 regardless of
    // arrival order.
    for _ in 0..16 {
        let env = Arc::new(TestEnv::new());
        let file = env.create_file("raced", 10);

        let mut threads = Vec::new();
        for size in [100u64, 50u64] {
            let env = env.clone();
            let file = file.clone();
            threads.push(std::thread::spawn(move || {
                env.engine
                    .layout_commit(&file, 1, 1, Some(size), None)
                    .unwrap();
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(file.attributes().unwrap().size, 100);
    }
}

#[test]
fn concurrent_commits_from_many_clients_never_regress() {
    let env = Arc::new(TestEnv::new());
    let file = env.create_file("stampede", 0);

    let mut threads = Vec::new();
    for client in 0..8u64 {
        let env = env.clone();
        let file = file.clone();
        threads.push(std::thread::spawn(move || {
            for step in 1..=50u64 {
                let size = client * 1000 + step;
                env.engine
                    .layout_commit(&file, client, 1, Some(size), None)
                    .unwrap();
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    // Max submitted size was client 7's last step.
    assert_eq!(file.attributes().unwrap().size, 7 * 1000 + 50);
}

#[test]
fn every_accepted_upcall_is_delivered_exactly_once() {
    let env = TestEnv::new();
    let (tx, rx) = mpsc::channel();

    let mut accepted = 0usize;
    for i in 0..200u32 {
        let tx = tx.clone();
        let event = UpcallEvent::RecallAny {
            export_id: 1,
            keep: i,
        };
        let outcome = env
            .dispatcher
            .submit_with_completion(event, Some(Box::new(move |res| {
                tx.send(res).unwrap();
            })));
        if outcome.is_ok() {
            accepted += 1;
        }
    }
    drop(tx);

    let mut completions = 0usize;
    while let Ok(res) = rx.recv_timeout(Duration::from_secs(5)) {
        assert!(res.is_ok());
        completions += 1;
        if completions == accepted {
            break;
        }
    }
    assert_eq!(completions, accepted);

    env.dispatcher.shutdown();
    assert_eq!(env.handler.total.load(Ordering::SeqCst), accepted);
    assert_eq!(env.dispatcher.stats().delivered as usize, accepted);
}

#[test]
fn submissions_after_shutdown_fail_fast() {
    let env = TestEnv::new();
    env.dispatcher.shutdown();
    let err = env
        .dispatcher
        .submit(UpcallEvent::DelegationRecall {
            export_id: 1,
            key: ObjectKey::from_bytes(b"k"),
        })
        .unwrap_err();
    assert_eq!(err, gannetfs_upcall::UpcallError::ShutDown);
}

#[test]
fn concurrent_ds_io_keeps_descriptor_population_bounded() {
    use gannetfs_fsal::HandleCacheConfig;

    let env = Arc::new(TestEnv::new());
    let data_server = Arc::new(DataServer::new(
        env.exports.clone(),
        HandleCacheConfig {
            capacity: 4,
            min_dwell: Duration::from_millis(5),
        },
        env.dispatcher.clone(),
    ));

    let mut wires = Vec::new();
    for n in 0..16 {
        let file = env.create_file(&format!("ds-{n}"), 512);
        wires.push(file.handle_to_wire(true).unwrap().as_bytes().to_vec());
    }

    let mut threads = Vec::new();
    for chunk in wires.chunks(4) {
        let ds = data_server.clone();
        let chunk = chunk.to_vec();
        threads.push(std::thread::spawn(move || {
            for wire in &chunk {
                let handle = ds.make_ds_handle(wire, true).unwrap();
                let (data, _) = handle.read(0, 64).unwrap();
                assert_eq!(data.len(), 64);
                handle
                    .write(0, b"overwrite", Stability::Unstable)
                    .unwrap();
                handle.release();
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    // Let survivors age past the dwell time, then drain through one more
    // handle's release path.
    std::thread::sleep(Duration::from_millis(25));
    let handle = data_server.make_ds_handle(&wires[0], true).unwrap();
    handle.read(0, 1).unwrap();
    handle.release();
    for _ in 0..32 {
        let h = data_server.make_ds_handle(&wires[1], true).unwrap();
        h.release();
    }
    assert!(data_server.cached_descriptors() <= 5);
}

#[test]
fn ds_writes_raise_invalidations_for_each_object() {
    let env = TestEnv::new();
    let file_a = env.create_file("inv-a", 16);
    let file_b = env.create_file("inv-b", 16);

    for file in [&file_a, &file_b] {
        let wire = file.handle_to_wire(true).unwrap();
        let handle = env
            .data_server
            .make_ds_handle(wire.as_bytes(), true)
            .unwrap();
        handle.write(0, b"dirty", Stability::Unstable).unwrap();
        handle.release();
    }

    env.dispatcher.shutdown();
    assert_eq!(env.handler.invalidations.load(Ordering::SeqCst), 2);
}
