//! Request-port protocol definitions.

use crate::StatusCode;
use daemon_sessions::{ClientSetupInfo, Port, TaskRef};
use serde::{Deserialize, Serialize};

/// Request methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    // Daemon
    Health,
    Shutdown,

    // Sessions
    #[serde(rename = "session.create")]
    SessionCreate,
    #[serde(rename = "session.setup")]
    SessionSetup,
    #[serde(rename = "session.set_originator_uid")]
    SessionSetOriginatorUid,
    #[serde(rename = "session.originator_uid")]
    SessionOriginatorUid,
    #[serde(rename = "session.set_user_prefs")]
    SessionSetUserPrefs,
    #[serde(rename = "session.user_prefs")]
    SessionUserPrefs,
    #[serde(rename = "session.lock_all")]
    SessionLockAll,

    // Authorizations
    #[serde(rename = "auth.create")]
    AuthCreate,
    #[serde(rename = "auth.free")]
    AuthFree,
    #[serde(rename = "auth.get_rights")]
    AuthGetRights,
    #[serde(rename = "auth.get_info")]
    AuthGetInfo,
    #[serde(rename = "auth.externalize")]
    AuthExternalize,
    #[serde(rename = "auth.internalize")]
    AuthInternalize,

    // Authorization database
    #[serde(rename = "authorizationdb.get")]
    AuthorizationDbGet,
    #[serde(rename = "authorizationdb.set")]
    AuthorizationDbSet,
    #[serde(rename = "authorizationdb.remove")]
    AuthorizationDbRemove,

    // Keychains
    #[serde(rename = "keychain.create")]
    KeychainCreate,
    #[serde(rename = "keychain.open")]
    KeychainOpen,
    #[serde(rename = "keychain.unlock")]
    KeychainUnlock,
    #[serde(rename = "keychain.lock")]
    KeychainLock,
    #[serde(rename = "keychain.is_locked")]
    KeychainIsLocked,
    #[serde(rename = "keychain.encode")]
    KeychainEncode,
    #[serde(rename = "keychain.change_passphrase")]
    KeychainChangePassphrase,
    #[serde(rename = "keychain.set_parameters")]
    KeychainSetParameters,
    #[serde(rename = "keychain.release")]
    KeychainRelease,
}

/// The handshake frame: first line of every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version sentinel (byte-order probe).
    pub setup: ClientSetupInfo,
    /// The service port of the session to attach to.
    pub service_port: Port,
    /// The client's task identity.
    pub task: TaskRef,
    /// Code identity string (executable path); empty for anonymous clients.
    pub identity: String,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// One request on an attached connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation.
    pub id: String,
    /// Method to invoke.
    pub method: Method,
    /// Method parameters (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: impl Into<String>, method: Method) -> Self {
        Self {
            id: id.into(),
            method,
            params: None,
        }
    }

    pub fn with_params(
        id: impl Into<String>,
        method: Method,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            method,
            params: Some(params),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The daemon's reply to one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Request ID for correlation.
    pub id: String,
    /// Status of the operation.
    pub status: StatusCode,
    /// Human-readable tag accompanying a failure status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Result data (if successful).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Response {
    pub fn success(id: &str, result: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            status: StatusCode::Ok,
            tag: None,
            result: Some(result),
        }
    }

    pub fn failure(id: &str, status: StatusCode, tag: &str) -> Self {
        Self {
            id: id.to_string(),
            status,
            tag: Some(tag.to_string()),
            result: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
