#![warn(missing_docs)]

//! GannetFS backend-abstraction subsystem: module registry, exports, object
//! handles, and the bounded descriptor cache
//!
//! One server process fronts many storage backends behind a uniform
//! object-handle contract. A backend registers a [`module::Backend`] with
//! the [`registry::ModuleRegistry`]; an [`export::Export`] binds one backend
//! instance to a mount path and claims the underlying filesystems it spans;
//! every filesystem object is reached through the [`handle::ObjectHandle`]
//! contract, whose wire/host/key representations must round-trip.

pub mod attr;
pub mod error;
pub mod export;
pub mod fd_cache;
pub mod filesystem;
pub mod handle;
pub mod mem;
pub mod module;
pub mod quota;
pub mod registry;

pub use attr::{Attributes, FsId, ObjectType, Timespec};
pub use error::{ErrorKind, FsalError, Result};
pub use export::{DynamicInfo, Export, ExportConfig, ExportOps, ExportRegistry};
pub use fd_cache::{CacheEntry, HandleCache, HandleCacheConfig};
pub use filesystem::{ClaimType, FilesystemInfo, FilesystemRegistry};
pub use handle::{CacheKey, DsDataPlane, DsDescriptor, HostHandle, ObjectHandle, WireHandle};
pub use module::{Backend, BackendInit};
pub use quota::{QuotaKind, QuotaLimits};
pub use registry::{ModuleRef, ModuleRegistry, RegistryError, FSAL_MAJOR_VERSION, FSAL_MINOR_VERSION};
