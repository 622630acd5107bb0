//! Sessions, client processes, and the daemon's object-graph root.
//!
//! A session is one authentication scope (login or bootstrap namespace). It
//! owns the shared credential pool and the per-session agent hosts, and it
//! parents the client processes created within it. The [`Server`] is the
//! nexus of the object mesh: it owns every session and carries the shared
//! collaborators (registry, timer wheel, authority, keychain pool).

mod agent;
mod attributes;
mod error;
mod map;
mod process;
mod server;
mod session;
#[cfg(test)]
mod testutil;

pub use agent::{AgentInstance, AgentKind, AgentLauncher, CommandAgentLauncher};
pub use attributes::SessionAttributes;
pub use error::{SessionError, SessionResult};
pub use map::{Port, SessionMap};
pub use process::{
    ClientIdent, ClientSetupInfo, CodeSigner, Connection, FileDigestSigner, Process, TaskRef,
    PROTOCOL_VERSION,
};
pub use server::Server;
pub use session::{DynamicSession, ExternalForm, RootSession, SessionBase, SessionRole};
