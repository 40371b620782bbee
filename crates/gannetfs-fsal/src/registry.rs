//! Backend module registry and load state machine
//!
//! Loading is single-threaded at any instant, serialized by a global load
//! state machine (idle → loading → registered | error → idle) so the
//! "module registers itself as a side effect of being loaded" handshake is
//! race-free. A version mismatch or duplicate name aborts the load and is
//! reported to the caller; the registry is left idle, never
//! half-registered.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::module::{Backend, BackendInit};

/// Core API major version. A module's major version must equal this.
pub const FSAL_MAJOR_VERSION: u32 = 2;

/// Core API minor version. A module's minor version must not exceed this
/// (a module may be older than the core, never newer).
pub const FSAL_MINOR_VERSION: u32 = 1;

/// Errors from module registration and lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Module was built against an incompatible core API version.
    #[error("module {name} version {major}.{minor} incompatible with core {core_major}.{core_minor}")]
    VersionMismatch {
        /// Module name.
        name: String,
        /// Module major version.
        major: u32,
        /// Module minor version.
        minor: u32,
        /// Core major version.
        core_major: u32,
        /// Core minor version.
        core_minor: u32,
    },
    /// A module with this name is already registered.
    #[error("module name already registered: {name}")]
    NameConflict {
        /// The conflicting name.
        name: String,
    },
    /// Registration happened outside a load handshake.
    #[error("module registration outside load state")]
    NotLoading,
    /// Another load is in progress.
    #[error("module loader busy")]
    LoaderBusy,
    /// The init hook completed without registering anything.
    #[error("module init registered nothing")]
    NothingRegistered,
    /// The module still has references or live exports.
    #[error("module busy: {name}")]
    Busy {
        /// Module name.
        name: String,
    },
    /// Statically linked modules cannot be unloaded.
    #[error("module statically linked: {name}")]
    StaticallyLinked {
        /// Module name.
        name: String,
    },
    /// No module with this name is registered.
    #[error("module not found: {name}")]
    NotFound {
        /// The name looked up.
        name: String,
    },
}

/// Load state, private to the registry but observable for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// No load in progress.
    Idle,
    /// A load handshake is in flight.
    Loading,
    /// The in-flight load registered successfully.
    Registered,
    /// The in-flight load failed to register.
    Error,
}

/// One registered backend module.
pub struct ModuleHandle {
    name: String,
    major: u32,
    minor: u32,
    backend: Arc<dyn Backend>,
    refcount: AtomicI32,
    exports: Mutex<Vec<u16>>,
    dynamic: AtomicBool,
}

impl ModuleHandle {
    /// Registered module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module (major, minor) API version.
    pub fn version(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    /// The backend operations.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Current reference count.
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Ids of live exports created from this module.
    pub fn export_ids(&self) -> Vec<u16> {
        self.exports.lock().clone()
    }

    /// Records a new export of this module.
    pub fn attach_export(&self, export_id: u16) {
        self.exports.lock().push(export_id);
    }

    /// Removes an export of this module.
    pub fn detach_export(&self, export_id: u16) {
        self.exports.lock().retain(|id| *id != export_id);
    }
}

/// A counted reference to a module; the count drops when the ref does.
///
/// Scope-based lifetime replaces the original's manually paired get/put
/// calls; the count itself stays observable so `unload` can refuse while
/// holders remain.
pub struct ModuleRef {
    handle: Arc<ModuleHandle>,
}

impl std::fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRef")
            .field("name", &self.handle.name)
            .field("refcount", &self.handle.refcount.load(Ordering::SeqCst))
            .finish()
    }
}

impl ModuleRef {
    fn acquire(handle: Arc<ModuleHandle>) -> Self {
        handle.refcount.fetch_add(1, Ordering::SeqCst);
        Self { handle }
    }

    /// The referenced module.
    pub fn module(&self) -> &ModuleHandle {
        &self.handle
    }

    /// Shorthand for the module's backend operations.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.handle.backend()
    }
}

impl Clone for ModuleRef {
    fn clone(&self) -> Self {
        Self::acquire(self.handle.clone())
    }
}

impl Drop for ModuleRef {
    fn drop(&mut self) {
        let prev = self.handle.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "module refcount underflow");
    }
}

struct RegistryInner {
    modules: Vec<Arc<ModuleHandle>>,
    load_state: LoadState,
    pending: Option<Arc<ModuleHandle>>,
    load_error: Option<RegistryError>,
}

/// Process-wide registry of backend modules.
pub struct ModuleRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    /// An empty registry in idle state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                modules: Vec::new(),
                load_state: LoadState::Idle,
                pending: None,
                load_error: None,
            }),
        }
    }

    /// Drives one load handshake.
    ///
    /// `dynamic` records whether the module may later be unloaded; builtin
    /// modules pass false and refuse unload forever.
    pub fn load(
        &self,
        init: &dyn BackendInit,
        dynamic: bool,
    ) -> std::result::Result<ModuleRef, RegistryError> {
        {
            let mut inner = self.inner.lock();
            if inner.load_state != LoadState::Idle {
                return Err(RegistryError::LoaderBusy);
            }
            inner.load_state = LoadState::Loading;
            inner.load_error = None;
        }

        // The module's turn to register itself. The lock is not held
        // across this call; register() re-takes it.
        let init_result = init.init(self);

        let mut inner = self.inner.lock();
        let outcome = match inner.load_state {
            LoadState::Registered => {
                let handle = inner
                    .pending
                    .take()
                    .expect("registered state without pending module");
                handle.dynamic.store(dynamic, Ordering::SeqCst);
                inner.modules.push(handle.clone());
                tracing::info!(module = handle.name(), dynamic, "backend module loaded");
                Ok(ModuleRef::acquire(handle))
            }
            LoadState::Error => {
                let err = inner
                    .load_error
                    .take()
                    .unwrap_or(RegistryError::NothingRegistered);
                tracing::warn!(error = %err, "backend module load failed");
                Err(err)
            }
            _ => match init_result {
                Err(err) => Err(err),
                Ok(()) => Err(RegistryError::NothingRegistered),
            },
        };
        inner.load_state = LoadState::Idle;
        inner.pending = None;
        outcome
    }

    /// Registers a module; called by a backend's init hook during `load`.
    ///
    /// The version gate runs before any other initialization: major must
    /// equal the core's, minor must not exceed it.
    pub fn register(
        &self,
        backend: Arc<dyn Backend>,
        name: &str,
        major: u32,
        minor: u32,
    ) -> std::result::Result<(), RegistryError> {
        let mut inner = self.inner.lock();

        if major != FSAL_MAJOR_VERSION || minor > FSAL_MINOR_VERSION {
            let err = RegistryError::VersionMismatch {
                name: name.to_string(),
                major,
                minor,
                core_major: FSAL_MAJOR_VERSION,
                core_minor: FSAL_MINOR_VERSION,
            };
            tracing::warn!(
                module = name,
                module_version = format!("{}.{}", major, minor),
                core_version = format!("{}.{}", FSAL_MAJOR_VERSION, FSAL_MINOR_VERSION),
                "module rejected: version mismatch"
            );
            if inner.load_state == LoadState::Loading {
                inner.load_state = LoadState::Error;
                inner.load_error = Some(err.clone());
            }
            return Err(err);
        }

        if inner.load_state != LoadState::Loading {
            return Err(RegistryError::NotLoading);
        }

        if inner
            .modules
            .iter()
            .any(|m| m.name().eq_ignore_ascii_case(name))
        {
            let err = RegistryError::NameConflict {
                name: name.to_string(),
            };
            inner.load_state = LoadState::Error;
            inner.load_error = Some(err.clone());
            return Err(err);
        }

        inner.pending = Some(Arc::new(ModuleHandle {
            name: name.to_string(),
            major,
            minor,
            backend,
            refcount: AtomicI32::new(0),
            exports: Mutex::new(Vec::new()),
            dynamic: AtomicBool::new(false),
        }));
        inner.load_state = LoadState::Registered;
        Ok(())
    }

    /// Looks up a module by name (case-insensitive) and takes a reference.
    pub fn lookup(&self, name: &str) -> Option<ModuleRef> {
        let inner = self.inner.lock();
        inner
            .modules
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .map(|m| ModuleRef::acquire(m.clone()))
    }

    /// Unloads a module.
    ///
    /// Fails `Busy` while references or exports remain, and
    /// `StaticallyLinked` for builtin modules. Reaching refcount zero never
    /// unloads by itself; this call re-checks the count under the lock.
    pub fn unload(&self, name: &str) -> std::result::Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let pos = inner
            .modules
            .iter()
            .position(|m| m.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })?;

        let module = &inner.modules[pos];
        if !module.dynamic.load(Ordering::SeqCst) {
            return Err(RegistryError::StaticallyLinked {
                name: name.to_string(),
            });
        }
        if module.refcount() != 0 || !module.export_ids().is_empty() {
            return Err(RegistryError::Busy {
                name: name.to_string(),
            });
        }
        let module = inner.modules.remove(pos);
        tracing::info!(module = module.name(), "backend module unloaded");
        Ok(())
    }

    /// Names of all registered modules, in registration order.
    pub fn module_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .modules
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Tears the registry down in reverse registration order.
    ///
    /// Modules still referenced are logged and left behind; shutdown does
    /// not force them out.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        let mut kept = Vec::new();
        while let Some(module) = inner.modules.pop() {
            if module.refcount() != 0 || !module.export_ids().is_empty() {
                tracing::warn!(
                    module = module.name(),
                    refcount = module.refcount(),
                    "module busy at shutdown"
                );
                kept.push(module);
            } else {
                tracing::debug!(module = module.name(), "module released at shutdown");
            }
        }
        kept.reverse();
        inner.modules = kept;
    }

    /// Current load state, for tests and diagnostics.
    pub fn load_state(&self) -> LoadState {
        self.inner.lock().load_state
    }
}
