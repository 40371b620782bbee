//! Server-shaped test fixture
//!
//! Wires every subsystem together the way a running server would: the
//! module registry loads the in-memory backend through the normal
//! handshake, an export is created over it, and the pNFS engine and data
//! server share its device registry and upcall dispatcher.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gannetfs_fsal::mem::MemBackendInit;
use gannetfs_fsal::{
    Export, ExportConfig, ExportRegistry, FilesystemRegistry, HandleCacheConfig, ModuleRegistry,
    ObjectHandle,
};
use gannetfs_pnfs::{DataServer, DeviceRegistry, DsAddr, LayoutEngine, LayoutEngineConfig};
use gannetfs_upcall::{
    DispatcherConfig, InvalidateFlags, ObjectKey, UpcallDispatcher, UpcallHandler,
};

/// Upcall handler that counts deliveries per family.
#[derive(Default)]
pub struct CountingHandler {
    /// Invalidate deliveries.
    pub invalidations: AtomicUsize,
    /// Deliveries of any kind.
    pub total: AtomicUsize,
}

impl UpcallHandler for CountingHandler {
    fn invalidate(
        &self,
        _export_id: u16,
        _key: &ObjectKey,
        _flags: InvalidateFlags,
    ) -> gannetfs_upcall::Result<()> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn recall_any(&self, _export_id: u16, _keep: u32) -> gannetfs_upcall::Result<()> {
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Everything a scenario needs, assembled.
pub struct TestEnv {
    /// Module registry with the in-memory backend loaded.
    pub registry: ModuleRegistry,
    /// Export table.
    pub exports: Arc<ExportRegistry>,
    /// The one export scenarios run against.
    pub export: Arc<Export>,
    /// Device registry shared by the engine and GETDEVICEINFO.
    pub devices: Arc<DeviceRegistry>,
    /// MDS-side layout engine.
    pub engine: LayoutEngine,
    /// DS-side handle factory.
    pub data_server: DataServer,
    /// Upcall dispatcher feeding `handler`.
    pub dispatcher: Arc<UpcallDispatcher>,
    /// Counting upcall handler.
    pub handler: Arc<CountingHandler>,
}

/// Export id the harness uses.
pub const EXPORT_ID: u16 = 77;

impl TestEnv {
    /// Builds the fixture with `ds_count` data servers registered.
    pub fn with_data_servers(ds_count: usize) -> Self {
        let handler = Arc::new(CountingHandler::default());
        let dispatcher = UpcallDispatcher::start(DispatcherConfig::default(), handler.clone());

        let registry = ModuleRegistry::new();
        let module = registry
            .load(&MemBackendInit, false)
            .expect("mem backend load");

        let exports = Arc::new(ExportRegistry::new(
            Arc::new(FilesystemRegistry::new()),
            dispatcher.clone(),
        ));
        let export = exports
            .create_export(
                module,
                EXPORT_ID,
                ExportConfig::new("/mem", "/export/mem").read_write(),
            )
            .expect("create export");

        let devices = Arc::new(DeviceRegistry::new());
        let engine = LayoutEngine::new(LayoutEngineConfig::default(), devices.clone())
            .expect("layout engine");
        for n in 0..ds_count {
            engine.add_data_server(DsAddr::tcp(Ipv4Addr::new(10, 1, 0, (n + 1) as u8), 2049));
        }

        let data_server = DataServer::new(
            exports.clone(),
            HandleCacheConfig::default(),
            dispatcher.clone(),
        );

        Self {
            registry,
            exports,
            export,
            devices,
            engine,
            data_server,
            dispatcher,
            handler,
        }
    }

    /// The default single-DS fixture.
    pub fn new() -> Self {
        Self::with_data_servers(1)
    }

    /// Creates a regular file of `size` bytes filled with a repeating
    /// pattern, under the export root.
    pub fn create_file(&self, name: &str, size: usize) -> Arc<dyn ObjectHandle> {
        let root = self.export.root_handle().expect("root");
        let file = root.create_file(name, 0o644).expect("create");
        if size > 0 {
            let chunk: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
            let mut written = 0usize;
            while written < size {
                let take = chunk.len().min(size - written);
                file.write(written as u64, &chunk[..take]).expect("write");
                written += take;
            }
        }
        file
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
