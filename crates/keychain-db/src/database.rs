//! Client handles onto keychain containers.

use crate::blob::{AclEntry, DbBlob, DbPlain};
use crate::common::{CommonPool, DbCommon};
use crate::{DbError, DbIdentifier, DbParameters, DbResult};
use daemon_registry::{DaemonObject, Handle, ObjectCore, Registry, RegistryError};
use keychain_crypto::{random_salt, BlobSignature, MasterSecrets, SealedPayload};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use timer_wheel::TimerWheel;
use tracing::{debug, info, warn};

/// Maximum passphrase attempts per logical unlock request.
pub const MAX_UNLOCK_TRY_COUNT: u32 = 3;

/// Supplies passphrases on demand (normally the session's UI agent).
///
/// Returning `None` cancels the unlock request.
pub trait PassphraseSource: Send + Sync {
    fn obtain(&self, db_name: &str, retry: bool) -> Option<Vec<u8>>;
}

/// A fixed passphrase; serves non-interactive unlock paths and tests.
pub struct StaticPassphrase(pub Vec<u8>);

impl PassphraseSource for StaticPassphrase {
    fn obtain(&self, _db_name: &str, retry: bool) -> Option<Vec<u8>> {
        // A wrong fixed passphrase stays wrong; don't loop on it.
        if retry {
            None
        } else {
            Some(self.0.clone())
        }
    }
}

struct DbState {
    blob: Option<DbBlob>,
    contents: Option<DbPlain>,
    version_snapshot: u32,
    decoded: bool,
    unlock_tries: u32,
}

/// One client handle onto a keychain container.
///
/// Holds the encoded blob image, the decode state of this handle, and a
/// strong reference pinning the shared [`DbCommon`]. Lives in the registry
/// as a child of its owning process.
pub struct KeychainDatabase {
    core: ObjectCore,
    common: Arc<DbCommon>,
    state: Mutex<DbState>,
}

impl KeychainDatabase {
    /// Create a brand-new container: mints a lineage signature, derives the
    /// master secrets from `passphrase`, seals the initial blob, and leaves
    /// the container unlocked.
    #[allow(clippy::too_many_arguments)]
    pub fn create_new(
        registry: &Registry,
        pool: &CommonPool,
        wheel: &Arc<TimerWheel>,
        session: Handle,
        owner: Handle,
        name: &str,
        params: DbParameters,
        passphrase: &[u8],
        acl: Vec<AclEntry>,
    ) -> DbResult<Arc<Self>> {
        let signature = BlobSignature::random();
        let identifier = DbIdentifier::new(name, signature);
        let (common, _) = pool.get_or_create(session, &identifier, params, wheel);

        let salt = random_salt();
        let secrets = MasterSecrets::derive(passphrase, &salt);
        let plain = DbPlain { params, acl };
        let blob = DbBlob::seal(name, signature, salt, &secrets, &plain)?;

        common.adopt_params(params);
        common.unlock_with(secrets)?;
        let version = common.version();

        let db = registry.register(|handle| {
            Arc::new(Self {
                core: ObjectCore::new(handle),
                common,
                state: Mutex::new(DbState {
                    blob: Some(blob),
                    contents: Some(plain),
                    version_snapshot: version,
                    decoded: true,
                    unlock_tries: 0,
                }),
            })
        });
        registry.adopt(owner, db.handle())?;
        info!(db = name, handle = %db.handle(), "keychain created");
        Ok(db)
    }

    /// Open a handle onto an existing container image. The shared state is
    /// joined (or created, locked) through the pool; nothing is decoded yet.
    pub fn from_blob(
        registry: &Registry,
        pool: &CommonPool,
        wheel: &Arc<TimerWheel>,
        session: Handle,
        owner: Handle,
        bytes: &[u8],
    ) -> DbResult<Arc<Self>> {
        let blob = DbBlob::from_bytes(bytes)?;
        let identifier = DbIdentifier::new(&blob.name, blob.signature);
        let (common, created) = pool.get_or_create(session, &identifier, blob.params, wheel);
        common.adopt_params(blob.params);

        let db = registry.register(|handle| {
            Arc::new(Self {
                core: ObjectCore::new(handle),
                common,
                state: Mutex::new(DbState {
                    blob: Some(blob),
                    contents: None,
                    version_snapshot: 0,
                    decoded: false,
                    unlock_tries: 0,
                }),
            })
        });
        registry.adopt(owner, db.handle())?;
        debug!(handle = %db.handle(), joined_existing = !created, "keychain opened from blob");
        Ok(db)
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    /// The shared state this handle pins.
    pub fn common(&self) -> &Arc<DbCommon> {
        &self.common
    }

    pub fn identifier(&self) -> &DbIdentifier {
        self.common.identifier()
    }

    pub fn name(&self) -> &str {
        self.common.identifier().name()
    }

    pub fn is_locked(&self) -> bool {
        self.common.is_locked()
    }

    /// Slide the container's idle-lock window.
    pub fn activity(&self) {
        self.common.activity();
    }

    /// Unconditional lock.
    pub fn lock(&self) {
        self.common.lock(false);
    }

    fn check_alive(&self) -> DbResult<()> {
        if self.core.is_dead() {
            Err(DbError::Registry(RegistryError::InvalidHandle(
                self.handle(),
            )))
        } else {
            Ok(())
        }
    }

    /// Whether this handle's decoded data is current with the shared state.
    pub fn valid_data(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.decoded && state.version_snapshot == self.common.version()
    }

    /// Attempt one passphrase against the container.
    ///
    /// Wrong passphrases fail with `InvalidPassphrase` and count against the
    /// request budget; once [`MAX_UNLOCK_TRY_COUNT`] attempts have failed,
    /// the next attempt fails with `AuthenticationFailed` and resets the
    /// budget for a fresh request.
    pub fn unlock_with_passphrase(&self, passphrase: &[u8]) -> DbResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();

        if !self.common.is_locked() {
            state.unlock_tries = 0;
            self.common.activity();
            return Ok(());
        }

        if state.unlock_tries >= MAX_UNLOCK_TRY_COUNT {
            state.unlock_tries = 0;
            warn!(db = %self.common.identifier(), "unlock attempts exhausted");
            return Err(DbError::AuthenticationFailed);
        }

        let blob = state
            .blob
            .as_ref()
            .ok_or_else(|| DbError::MalformedBlob("no encoded image".into()))?;

        if !blob.validates(passphrase) {
            state.unlock_tries += 1;
            debug!(
                db = %self.common.identifier(),
                tries = state.unlock_tries,
                "passphrase rejected"
            );
            return Err(DbError::InvalidPassphrase);
        }

        let secrets = MasterSecrets::derive(passphrase, &blob.salt);
        state.unlock_tries = 0;
        self.common.unlock_with(secrets)?;
        self.decode_into(&mut state)
    }

    /// Full-feature unlock: pull passphrases from `source` until one
    /// validates, the source cancels, or the attempt budget is exhausted.
    pub fn unlock(&self, source: &dyn PassphraseSource) -> DbResult<()> {
        self.check_alive()?;
        if !self.common.is_locked() {
            self.common.activity();
            return Ok(());
        }

        for attempt in 0..MAX_UNLOCK_TRY_COUNT {
            let passphrase = match source.obtain(self.name(), attempt > 0) {
                Some(passphrase) => passphrase,
                None => break, // cancelled
            };
            match self.unlock_with_passphrase(&passphrase) {
                Ok(()) => return Ok(()),
                Err(DbError::InvalidPassphrase) => continue,
                Err(other) => return Err(other),
            }
        }

        self.state.lock().unwrap().unlock_tries = 0;
        Err(DbError::AuthenticationFailed)
    }

    fn decode_into(&self, state: &mut MutexGuard<'_, DbState>) -> DbResult<()> {
        let blob = state
            .blob
            .as_ref()
            .ok_or_else(|| DbError::MalformedBlob("no encoded image".into()))?;
        let plain = self.common.with_secrets(|secrets| blob.open(secrets))?;
        self.common.adopt_params(plain.params);
        state.contents = Some(plain);
        state.decoded = true;
        state.version_snapshot = self.common.version();
        Ok(())
    }

    /// Decode the blob with the established master key: parses parameters
    /// and ACL, marks this handle's data valid, captures the version stamp.
    pub fn decode(&self) -> DbResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        self.decode_into(&mut state)
    }

    /// Produce the container image, re-serializing only when this handle's
    /// cached blob is stale. Decoding the result yields equivalent contents.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();

        if state.decoded && state.version_snapshot == self.common.version() {
            if let Some(blob) = state.blob.as_ref() {
                return blob.to_bytes();
            }
        }

        if !state.decoded {
            self.decode_into(&mut state)?;
            // A fresh decode is current by definition.
            if let Some(blob) = state.blob.as_ref() {
                return blob.to_bytes();
            }
        }

        let old_blob = state
            .blob
            .as_ref()
            .ok_or_else(|| DbError::MalformedBlob("no encoded image".into()))?;
        let contents = state
            .contents
            .as_ref()
            .ok_or_else(|| DbError::MalformedBlob("no decoded contents".into()))?;

        let plain = DbPlain {
            params: self.common.params(),
            acl: contents.acl.clone(),
        };
        let blob = self.common.with_secrets(|secrets| {
            DbBlob::seal(
                &old_blob.name,
                old_blob.signature,
                old_blob.salt,
                secrets,
                &plain,
            )
        })?;

        let bytes = blob.to_bytes()?;
        state.version_snapshot = self.common.bump_version();
        state.blob = Some(blob);
        state.contents = Some(plain);
        state.decoded = true;
        Ok(bytes)
    }

    /// Re-encrypt the container under a new passphrase.
    ///
    /// Atomic: on any failure the old passphrase, secrets, and blob remain
    /// in force.
    pub fn change_passphrase(&self, new_passphrase: &[u8]) -> DbResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        if self.common.is_locked() {
            return Err(DbError::Locked);
        }
        if !state.decoded {
            self.decode_into(&mut state)?;
        }

        let old_blob = state
            .blob
            .as_ref()
            .ok_or_else(|| DbError::MalformedBlob("no encoded image".into()))?;
        let contents = state
            .contents
            .as_ref()
            .ok_or_else(|| DbError::MalformedBlob("no decoded contents".into()))?;

        let salt = random_salt();
        let secrets = MasterSecrets::derive(new_passphrase, &salt);
        let plain = DbPlain {
            params: self.common.params(),
            acl: contents.acl.clone(),
        };
        let blob = DbBlob::seal(&old_blob.name, old_blob.signature, salt, &secrets, &plain)?;

        // Everything that can fail has; commit.
        self.common.swap_secrets(secrets)?;
        state.version_snapshot = self.common.bump_version();
        state.blob = Some(blob);
        state.contents = Some(plain);
        info!(db = %self.common.identifier(), "passphrase changed");
        Ok(())
    }

    /// Hand out the master secret, subject to ACL approval.
    pub fn extract_master_key(&self, caller_uid: u32) -> DbResult<MasterSecrets> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        if !state.decoded {
            self.decode_into(&mut state)?;
        }
        let contents = state
            .contents
            .as_ref()
            .ok_or_else(|| DbError::MalformedBlob("no decoded contents".into()))?;
        if !contents.acl_allows(caller_uid, "extract") {
            return Err(DbError::AclDenied);
        }
        self.common.with_secrets(|secrets| Ok(secrets.clone()))
    }

    /// Wrap an individual key blob under the container's master key.
    pub fn encode_key(&self, key_bytes: &[u8]) -> DbResult<SealedPayload> {
        self.check_alive()?;
        let payload = self
            .common
            .with_secrets(|secrets| Ok(keychain_crypto::seal(secrets, key_bytes)?))?;
        self.common.activity();
        Ok(payload)
    }

    /// Unwrap an individual key blob with the container's master key.
    pub fn decode_key(&self, payload: &SealedPayload) -> DbResult<Vec<u8>> {
        self.check_alive()?;
        let key = self
            .common
            .with_secrets(|secrets| Ok(keychain_crypto::open(secrets, payload)?))?;
        self.common.activity();
        Ok(key)
    }

    /// Non-failing passphrase check against the current image.
    pub fn validate_passphrase(&self, passphrase: &[u8]) -> bool {
        let state = self.state.lock().unwrap();
        state
            .blob
            .as_ref()
            .map(|blob| blob.validates(passphrase))
            .unwrap_or(false)
    }

    pub fn get_parameters(&self) -> DbParameters {
        self.common.params()
    }

    /// Update container parameters through the shared state.
    pub fn set_parameters(&self, params: DbParameters) -> DbResult<()> {
        self.check_alive()?;
        self.common.set_parameters(params)
    }
}

impl DaemonObject for KeychainDatabase {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn on_kill(&self) {
        // Drop decode state eagerly; the blob image is the owner's business.
        let mut state = self.state.lock().unwrap();
        state.contents = None;
        state.decoded = false;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
