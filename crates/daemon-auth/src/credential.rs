//! Credentials and credential sets.

use chrono::{DateTime, Utc};
use std::collections::btree_map::{BTreeMap, Values};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One authenticated fact: "user `uid` authenticated at `issued_at`".
///
/// A credential may be *shared* (visible to every authorization in its
/// session) or *private* (visible only through the token that acquired it).
/// Credentials are referenced from multiple sets at once, so invalidation
/// and merge mutate in place behind an `Arc`.
#[derive(Debug)]
pub struct Credential {
    uid: u32,
    name: String,
    shared: bool,
    valid: AtomicBool,
    issued_at: Mutex<DateTime<Utc>>,
}

impl Credential {
    /// Create a credential for `uid`, stamped now.
    pub fn new(uid: u32, name: impl Into<String>, shared: bool) -> Arc<Self> {
        Arc::new(Self {
            uid,
            name: name.into(),
            shared,
            valid: AtomicBool::new(true),
            issued_at: Mutex::new(Utc::now()),
        })
    }

    /// The authenticated subject.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// The subject's account name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this credential is visible session-wide.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether this credential is still usable.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Invalidated credentials stay in their sets but are ignored by the
    /// authority.
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            debug!(uid = self.uid, "credential invalidated");
        }
    }

    /// When this credential was (last) established.
    pub fn issued_at(&self) -> DateTime<Utc> {
        *self.issued_at.lock().unwrap()
    }

    /// Merge another credential for the same subject: keep the later
    /// issuance stamp.
    pub fn merge(&self, other: &Credential) {
        debug_assert_eq!(self.uid, other.uid);
        let other_stamp = other.issued_at();
        let mut stamp = self.issued_at.lock().unwrap();
        if other_stamp > *stamp {
            *stamp = other_stamp;
        }
    }
}

/// An ordered set of credentials, keyed by subject.
///
/// Cloning a set clones the *membership*, not the credentials: both sets
/// keep pointing at the same shared credential objects.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    creds: BTreeMap<u32, Arc<Credential>>,
}

impl CredentialSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a credential, replacing any existing entry for the subject.
    pub fn insert(&mut self, cred: Arc<Credential>) {
        self.creds.insert(cred.uid(), cred);
    }

    /// Look up the credential for a subject.
    pub fn get(&self, uid: u32) -> Option<&Arc<Credential>> {
        self.creds.get(&uid)
    }

    /// Whether a still-valid credential for `uid` is present.
    pub fn has_valid(&self, uid: u32) -> bool {
        self.creds.get(&uid).is_some_and(|c| c.is_valid())
    }

    pub fn iter(&self) -> Values<'_, u32, Arc<Credential>> {
        self.creds.values()
    }

    pub fn len(&self) -> usize {
        self.creds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creds.is_empty()
    }

    /// Invalidate every member.
    pub fn invalidate_all(&self) {
        for cred in self.creds.values() {
            cred.invalidate();
        }
    }

    /// Merge `incoming` into this set (token semantics).
    ///
    /// An incoming credential whose subject is already present as a shared,
    /// valid member merges in place; anything else is inserted. Merging the
    /// same set twice is a no-op the second time.
    pub fn merge(&mut self, incoming: &CredentialSet) {
        for cred in incoming.iter() {
            match self.creds.get(&cred.uid()) {
                Some(existing)
                    if Arc::ptr_eq(existing, cred)
                        || (existing.is_shared()
                            && existing.is_valid()
                            && cred.is_shared()
                            && cred.is_valid()) =>
                {
                    existing.merge(cred);
                }
                _ => {
                    self.creds.insert(cred.uid(), cred.clone());
                }
            }
        }
    }

    /// Merge `incoming` into a session's shared pool.
    ///
    /// Only shared, valid credentials enter the pool. When the pool already
    /// holds a credential for the subject, the pool member absorbs the new
    /// stamp and **replaces** the entry in `incoming`, so that later merges
    /// into a token reference the pool's object and stay synchronized with
    /// future invalidations.
    pub fn merge_shared(&mut self, incoming: &mut CredentialSet) {
        let mut replacements: Vec<Arc<Credential>> = Vec::new();
        for cred in incoming.iter() {
            if !(cred.is_shared() && cred.is_valid()) {
                continue;
            }
            match self.creds.get(&cred.uid()) {
                Some(existing) => {
                    existing.merge(cred);
                    replacements.push(existing.clone());
                }
                None => {
                    self.creds.insert(cred.uid(), cred.clone());
                }
            }
        }
        for replacement in replacements {
            incoming.insert(replacement);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_credential_is_valid() {
        let cred = Credential::new(501, "alice", true);
        assert!(cred.is_valid());
        assert!(cred.is_shared());
        assert_eq!(cred.uid(), 501);
    }

    #[test]
    fn test_invalidate_sticks() {
        let cred = Credential::new(501, "alice", true);
        cred.invalidate();
        assert!(!cred.is_valid());
        cred.invalidate();
        assert!(!cred.is_valid());
    }

    #[test]
    fn test_merge_keeps_later_stamp() {
        let older = Credential::new(501, "alice", true);
        let newer = Credential::new(501, "alice", true);
        {
            let mut stamp = newer.issued_at.lock().unwrap();
            *stamp = *stamp + chrono::Duration::seconds(30);
        }
        let target = newer.issued_at();

        older.merge(&newer);
        assert_eq!(older.issued_at(), target);

        // Merging an older stamp back does not regress.
        newer.merge(&Credential::new(501, "alice", true));
        assert_eq!(newer.issued_at(), target);
    }

    #[test]
    fn test_set_merge_is_idempotent() {
        let mut set = CredentialSet::new();
        let mut incoming = CredentialSet::new();
        incoming.insert(Credential::new(501, "alice", true));
        incoming.insert(Credential::new(0, "root", false));

        set.merge(&incoming);
        let first_len = set.len();
        let first_stamp = set.get(501).unwrap().issued_at();

        set.merge(&incoming);
        assert_eq!(set.len(), first_len);
        assert_eq!(set.get(501).unwrap().issued_at(), first_stamp);
    }

    #[test]
    fn test_merge_shared_filters_private_and_invalid() {
        let mut pool = CredentialSet::new();
        let mut incoming = CredentialSet::new();
        incoming.insert(Credential::new(501, "alice", true));
        incoming.insert(Credential::new(502, "bob", false));
        let stale = Credential::new(503, "carol", true);
        stale.invalidate();
        incoming.insert(stale);

        pool.merge_shared(&mut incoming);

        assert_eq!(pool.len(), 1);
        assert!(pool.get(501).is_some());
        assert!(pool.get(502).is_none());
        assert!(pool.get(503).is_none());
    }

    #[test]
    fn test_merge_shared_rewrites_incoming_to_pool_member() {
        let mut pool = CredentialSet::new();
        let pooled = Credential::new(501, "alice", true);
        pool.insert(pooled.clone());

        let mut incoming = CredentialSet::new();
        incoming.insert(Credential::new(501, "alice", true));

        pool.merge_shared(&mut incoming);

        // The incoming set now references the pool's object, so a later
        // pool-wide invalidation reaches tokens that merged it.
        assert!(Arc::ptr_eq(incoming.get(501).unwrap(), &pooled));
        pooled.invalidate();
        assert!(!incoming.get(501).unwrap().is_valid());
    }

    #[test]
    fn test_invalidate_all_reaches_shared_members() {
        let mut pool = CredentialSet::new();
        let cred = Credential::new(501, "alice", true);
        pool.insert(cred.clone());

        let snapshot = pool.clone();
        pool.invalidate_all();

        // The snapshot shares the credential objects.
        assert!(!snapshot.get(501).unwrap().is_valid());
        assert!(!cred.is_valid());
    }
}
