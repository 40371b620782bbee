//! The backend operation surface
//!
//! Where the original design filled a table of function pointers, a
//! backend here implements [`Backend`] and hands the trait object to the
//! registry during its load handshake.

use std::sync::Arc;

use crate::error::Result;
use crate::export::{ExportConfig, ExportOps};
use crate::registry::{ModuleRegistry, RegistryError};

/// Operations a backend module provides to the core.
///
/// One implementation per backend. Everything beyond `create_export` has a
/// default suitable for a backend with no pNFS support.
pub trait Backend: Send + Sync {
    /// Backend name as registered (used in logs; the registry holds the
    /// authoritative registered name).
    fn name(&self) -> &str;

    /// Instantiates one export of this backend bound to a mount path.
    ///
    /// Failing to reach the underlying storage here is fatal to this call
    /// only; it must leave no trace of the export behind.
    fn create_export(&self, export_id: u16, config: &ExportConfig) -> Result<Arc<dyn ExportOps>>;

    /// pNFS layout types this backend can grant, empty when none.
    fn supported_layout_types(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Buffer-size hint for device-address encoding.
    fn da_addr_size_hint(&self) -> usize {
        0x1400
    }
}

/// The load-time hook through which a backend registers itself.
///
/// `ModuleRegistry::load` drives the handshake: it moves the registry into
/// its loading state, invokes `init`, and expects exactly one successful
/// `register` call to have happened as a side effect. This mirrors the
/// original constructor-runs-during-load protocol while keeping it behind
/// one narrow trait; backends are statically linked and selected at
/// configuration time.
pub trait BackendInit {
    /// Called with the registry in loading state; must call
    /// `registry.register(...)` exactly once on success.
    fn init(&self, registry: &ModuleRegistry) -> std::result::Result<(), RegistryError>;
}
