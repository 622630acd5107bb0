//! Handle registry and object lifecycle for the Keywarden daemon.
//!
//! Every externally referenceable daemon object is registered here under an
//! opaque integer handle. Objects form a parent/child tree through handle
//! links (never raw pointers), and teardown cascades parent-to-child through
//! the registry.

mod error;
mod handle;
mod node;
mod registry;

pub use error::{RegistryError, RegistryResult};
pub use handle::Handle;
pub use node::{DaemonObject, ObjectCore};
pub use registry::Registry;
