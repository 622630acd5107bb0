//! Request dispatch: binds the wire protocol to the object graph.

use crate::state::DaemonState;
use base64::Engine;
use daemon_auth::{AuthFlags, AuthItem, AuthRule};
use daemon_ipc::{Hello, Method, Request, RequestHandler, Response, StatusCode};
use daemon_registry::Handle;
use daemon_sessions::{
    ExternalForm, Port, Process, SessionAttributes, SessionError, SessionResult, SessionRole,
};
use keychain_db::{AclEntry, DbParameters, KeychainDatabase};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Deserialize)]
struct SessionCreateParams {
    port: u32,
}

#[derive(Deserialize)]
struct SessionSetupParams {
    #[serde(default)]
    flags: u32,
    attrs: u32,
}

#[derive(Deserialize)]
struct SetOriginatorUidParams {
    uid: u32,
}

#[derive(Deserialize)]
struct SetUserPrefsParams {
    prefs_b64: String,
}

#[derive(Deserialize)]
struct AuthCreateParams {
    rights: Vec<String>,
    #[serde(default)]
    environment: Vec<AuthItem>,
    #[serde(default)]
    flags: u32,
}

#[derive(Deserialize)]
struct AuthFreeParams {
    token: Handle,
    #[serde(default)]
    flags: u32,
}

#[derive(Deserialize)]
struct AuthGetRightsParams {
    token: Handle,
    rights: Vec<String>,
    #[serde(default)]
    environment: Vec<AuthItem>,
    #[serde(default)]
    flags: u32,
}

#[derive(Deserialize)]
struct AuthGetInfoParams {
    token: Handle,
    #[serde(default)]
    tag: Option<String>,
}

#[derive(Deserialize)]
struct AuthTokenParams {
    token: Handle,
}

#[derive(Deserialize)]
struct AuthInternalizeParams {
    form: ExternalForm,
}

#[derive(Deserialize)]
struct RuleNameParams {
    name: String,
}

#[derive(Deserialize)]
struct RuleSetParams {
    token: Handle,
    name: String,
    rule: AuthRule,
}

#[derive(Deserialize)]
struct RuleRemoveParams {
    token: Handle,
    name: String,
}

#[derive(Deserialize)]
struct KeychainCreateParams {
    name: String,
    #[serde(default)]
    params: Option<DbParameters>,
    passphrase: String,
    #[serde(default)]
    acl: Option<Vec<AclEntry>>,
}

#[derive(Deserialize)]
struct KeychainOpenParams {
    blob_b64: String,
}

#[derive(Deserialize)]
struct KeychainUnlockParams {
    handle: Handle,
    passphrase: String,
}

#[derive(Deserialize)]
struct KeychainHandleParams {
    handle: Handle,
}

#[derive(Deserialize)]
struct ChangePassphraseParams {
    handle: Handle,
    new_passphrase: String,
}

#[derive(Deserialize)]
struct SetParametersParams {
    handle: Handle,
    params: DbParameters,
}

fn fail_session(id: &str, error: &SessionError) -> Response {
    Response::failure(id, StatusCode::from(error), &error.to_string())
}

fn fail_db(id: &str, error: &keychain_db::DbError) -> Response {
    Response::failure(id, StatusCode::from(error), &error.to_string())
}

fn parse_params<T: for<'de> Deserialize<'de>>(request: &Request) -> Result<T, Response> {
    let params = request.params.clone().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(params).map_err(|e| {
        Response::failure(
            &request.id,
            StatusCode::InvalidRequest,
            &format!("bad parameters: {e}"),
        )
    })
}

impl DaemonState {
    fn caller(&self, process: Handle) -> SessionResult<Arc<Process>> {
        Ok(self.server.registry().lookup::<Process>(process)?)
    }

    fn caller_session(
        &self,
        caller: &Arc<Process>,
    ) -> SessionResult<Arc<dyn SessionRole>> {
        self.server.session_by_handle(caller.session_handle()?)
    }

    fn keychain(&self, handle: Handle) -> SessionResult<Arc<KeychainDatabase>> {
        Ok(self.server.registry().lookup::<KeychainDatabase>(handle)?)
    }

    fn dispatch(&self, process: Handle, request: Request) -> SessionResult<Response> {
        let id = request.id.clone();
        let caller = self.caller(process)?;
        let session = self.caller_session(&caller)?;

        let response = match request.method {
            Method::Health => Response::success(
                &id,
                json!({
                    "status": "ok",
                    "version": env!("CARGO_PKG_VERSION"),
                    "objects": self.server.registry().len(),
                }),
            ),

            Method::Shutdown => {
                if let Some(shutdown) = self.shutdown.get() {
                    let _ = shutdown.send(());
                }
                Response::success(&id, json!({}))
            }

            Method::SessionCreate => {
                let params: SessionCreateParams =
                    match parse_params(&request) {
                        Ok(params) => params,
                        Err(response) => return Ok(response),
                    };
                let port = Port::from_raw(params.port);
                let created = self.server.create_dynamic_session(&caller, port)?;
                caller.change_session(&self.server, port)?;
                Response::success(
                    &id,
                    json!({ "session": created.base().handle(), "port": params.port }),
                )
            }

            Method::SessionSetup => {
                let params: SessionSetupParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                session.setup_attributes(
                    caller.handle(),
                    params.flags,
                    SessionAttributes::from_bits(params.attrs),
                )?;
                Response::success(&id, json!({ "attrs": session.base().attributes().bits() }))
            }

            Method::SessionSetOriginatorUid => {
                let params: SetOriginatorUidParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                session.set_originator_uid(caller.handle(), params.uid)?;
                Response::success(&id, json!({}))
            }

            Method::SessionOriginatorUid => {
                let uid = session.originator_uid()?;
                Response::success(&id, json!({ "uid": uid }))
            }

            Method::SessionSetUserPrefs => {
                let params: SetUserPrefsParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let prefs = match BASE64.decode(&params.prefs_b64) {
                    Ok(prefs) => prefs,
                    Err(e) => {
                        return Ok(Response::failure(
                            &id,
                            StatusCode::InvalidRequest,
                            &format!("bad prefs encoding: {e}"),
                        ))
                    }
                };
                session.set_user_prefs(caller.handle(), prefs)?;
                Response::success(&id, json!({}))
            }

            Method::SessionUserPrefs => {
                let prefs = session
                    .copy_user_prefs()
                    .map(|prefs| BASE64.encode(prefs));
                Response::success(&id, json!({ "prefs_b64": prefs }))
            }

            Method::SessionLockAll => {
                self.server.process_lock_all(session.base().handle());
                Response::success(&id, json!({}))
            }

            Method::AuthCreate => {
                let params: AuthCreateParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let (token, granted) = session.base().authorize(
                    &self.server,
                    &caller,
                    &params.rights,
                    &params.environment,
                    AuthFlags::from_bits(params.flags),
                )?;
                Response::success(&id, json!({ "token": token, "granted": granted }))
            }

            Method::AuthFree => {
                let params: AuthFreeParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                session.base().auth_free(
                    &self.server,
                    &caller,
                    params.token,
                    AuthFlags::from_bits(params.flags),
                )?;
                Response::success(&id, json!({}))
            }

            Method::AuthGetRights => {
                let params: AuthGetRightsParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let granted = session.base().auth_get_rights(
                    &self.server,
                    &caller,
                    params.token,
                    &params.rights,
                    &params.environment,
                    AuthFlags::from_bits(params.flags),
                )?;
                Response::success(&id, json!({ "granted": granted }))
            }

            Method::AuthGetInfo => {
                let params: AuthGetInfoParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let items = session.base().auth_get_info(
                    &self.server,
                    &caller,
                    params.token,
                    params.tag.as_deref(),
                )?;
                Response::success(&id, json!({ "items": items }))
            }

            Method::AuthExternalize => {
                let params: AuthTokenParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let form =
                    session
                        .base()
                        .auth_externalize(&self.server, &caller, params.token)?;
                Response::success(&id, json!({ "form": form }))
            }

            Method::AuthInternalize => {
                let params: AuthInternalizeParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let token =
                    session
                        .base()
                        .auth_internalize(&self.server, &caller, &params.form)?;
                Response::success(&id, json!({ "token": token }))
            }

            Method::AuthorizationDbGet => {
                let params: RuleNameParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let rule = session.base().authorizationdb_get(&self.server, &params.name)?;
                Response::success(&id, json!({ "rule": rule }))
            }

            Method::AuthorizationDbSet => {
                let params: RuleSetParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                session.base().authorizationdb_set(
                    &self.server,
                    &caller,
                    params.token,
                    &params.name,
                    params.rule,
                )?;
                Response::success(&id, json!({}))
            }

            Method::AuthorizationDbRemove => {
                let params: RuleRemoveParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                session.base().authorizationdb_remove(
                    &self.server,
                    &caller,
                    params.token,
                    &params.name,
                )?;
                Response::success(&id, json!({}))
            }

            Method::KeychainCreate => {
                let params: KeychainCreateParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let acl = params.acl.unwrap_or_else(|| {
                    vec![AclEntry {
                        uid: caller.uid(),
                        operations: vec![
                            "decrypt".into(),
                            "extract".into(),
                            "change_passphrase".into(),
                        ],
                    }]
                });
                let db = KeychainDatabase::create_new(
                    self.server.registry(),
                    self.server.pool(),
                    self.server.wheel(),
                    session.base().handle(),
                    caller.handle(),
                    &params.name,
                    params.params.unwrap_or_default(),
                    params.passphrase.as_bytes(),
                    acl,
                )?;
                Response::success(&id, json!({ "handle": db.handle() }))
            }

            Method::KeychainOpen => {
                let params: KeychainOpenParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let bytes = match BASE64.decode(&params.blob_b64) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return Ok(Response::failure(
                            &id,
                            StatusCode::InvalidRequest,
                            &format!("bad blob encoding: {e}"),
                        ))
                    }
                };
                let db = KeychainDatabase::from_blob(
                    self.server.registry(),
                    self.server.pool(),
                    self.server.wheel(),
                    session.base().handle(),
                    caller.handle(),
                    &bytes,
                )?;
                Response::success(
                    &id,
                    json!({ "handle": db.handle(), "locked": db.is_locked() }),
                )
            }

            Method::KeychainUnlock => {
                let params: KeychainUnlockParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let db = self.keychain(params.handle)?;
                match db.unlock_with_passphrase(params.passphrase.as_bytes()) {
                    Ok(()) => Response::success(&id, json!({ "locked": false })),
                    Err(error) => fail_db(&id, &error),
                }
            }

            Method::KeychainLock => {
                let params: KeychainHandleParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                self.keychain(params.handle)?.lock();
                Response::success(&id, json!({ "locked": true }))
            }

            Method::KeychainIsLocked => {
                let params: KeychainHandleParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let locked = self.keychain(params.handle)?.is_locked();
                Response::success(&id, json!({ "locked": locked }))
            }

            Method::KeychainEncode => {
                let params: KeychainHandleParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let db = self.keychain(params.handle)?;
                match db.encode() {
                    Ok(bytes) => {
                        Response::success(&id, json!({ "blob_b64": BASE64.encode(bytes) }))
                    }
                    Err(error) => fail_db(&id, &error),
                }
            }

            Method::KeychainChangePassphrase => {
                let params: ChangePassphraseParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let db = self.keychain(params.handle)?;
                match db.change_passphrase(params.new_passphrase.as_bytes()) {
                    Ok(()) => Response::success(&id, json!({})),
                    Err(error) => fail_db(&id, &error),
                }
            }

            Method::KeychainSetParameters => {
                let params: SetParametersParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                let db = self.keychain(params.handle)?;
                match db.set_parameters(params.params) {
                    Ok(()) => Response::success(&id, json!({})),
                    Err(error) => fail_db(&id, &error),
                }
            }

            Method::KeychainRelease => {
                let params: KeychainHandleParams = match parse_params(&request) {
                    Ok(params) => params,
                    Err(response) => return Ok(response),
                };
                // Verify it exists and is a keychain before killing.
                let db = self.keychain(params.handle)?;
                self.server.registry().kill(db.handle());
                Response::success(&id, json!({}))
            }
        };
        Ok(response)
    }
}

impl RequestHandler for DaemonState {
    fn attach(&self, hello: &Hello) -> Result<Handle, StatusCode> {
        match Process::create(
            &self.server,
            hello.service_port,
            hello.task,
            &hello.setup,
            &hello.identity,
            hello.pid,
            hello.uid,
            hello.gid,
        ) {
            Ok(process) => Ok(process.handle()),
            Err(error) => Err(StatusCode::from(&error)),
        }
    }

    fn handle(&self, process: Handle, request: Request) -> Response {
        let id = request.id.clone();
        debug!(process = %process, method = ?request.method, "dispatching request");
        match self.dispatch(process, request) {
            Ok(response) => response,
            Err(error) => fail_session(&id, &error),
        }
    }

    fn detach(&self, process: Handle) {
        self.server.registry().kill(process);
    }
}
