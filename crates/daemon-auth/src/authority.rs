//! The rights authority seam.
//!
//! The daemon never decides rights itself; it hands the requested rights,
//! the caller's environment, and a snapshot of the available credentials to
//! an [`Authority`] and acts on the decision. [`LocalAuthority`] is the
//! built-in rule-table implementation.

use crate::{AuthError, AuthResult, Credential, CredentialSet};
use crate::token::{AuditInfo, AuthFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// One name/value pair from the caller's authorization environment
/// (a username, a passphrase prompt answer, and the like).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthItem {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl AuthItem {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Outcome of a rights computation.
#[derive(Debug, Default)]
pub struct AuthorityDecision {
    /// The rights actually granted (subset of those requested).
    pub granted: Vec<String>,
    /// Credentials the authority established along the way.
    pub new_creds: CredentialSet,
}

/// Rights decisions and rule management, independent of daemon state.
///
/// Implementations must be pure with respect to the object graph: every
/// daemon-side effect is driven by the returned decision.
pub trait Authority: Send + Sync {
    /// Decide the requested rights given the available credentials.
    fn authorize(
        &self,
        rights: &[String],
        environment: &[AuthItem],
        flags: AuthFlags,
        creds: &CredentialSet,
        audit: &AuditInfo,
    ) -> AuthResult<AuthorityDecision>;

    /// Fetch a rule definition.
    fn get_rule(&self, name: &str) -> AuthResult<AuthRule>;

    /// Install or replace a rule definition.
    fn set_rule(
        &self,
        name: &str,
        rule: AuthRule,
        creds: &CredentialSet,
    ) -> AuthResult<AuthorityDecision>;

    /// Remove a rule definition.
    fn remove_rule(&self, name: &str, creds: &CredentialSet) -> AuthResult<AuthorityDecision>;
}

/// A rule in the authorization database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class")]
pub enum AuthRule {
    /// Grant to anyone.
    Allow,
    /// Grant to no one.
    Deny,
    /// Grant if a valid credential for this uid is available, or one can be
    /// established from the environment.
    AuthenticateAs { uid: u32 },
    /// Grant only with a valid root credential.
    RequireRoot,
}

/// The name of the rule applied to rights with no explicit entry.
const DEFAULT_RULE: &str = "default";

/// Rule-table authority.
///
/// Rights map to [`AuthRule`]s by longest-prefix match on dot-separated
/// right names; administration of the table itself requires a valid root
/// credential.
pub struct LocalAuthority {
    rules: Mutex<BTreeMap<String, AuthRule>>,
}

impl LocalAuthority {
    /// An authority whose default rule denies everything.
    pub fn new() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(DEFAULT_RULE.to_string(), AuthRule::Deny);
        Self {
            rules: Mutex::new(rules),
        }
    }

    /// An authority preloaded with rules (tests, canned setups).
    pub fn with_rules(entries: impl IntoIterator<Item = (String, AuthRule)>) -> Self {
        let authority = Self::new();
        {
            let mut rules = authority.rules.lock().unwrap();
            rules.extend(entries);
        }
        authority
    }

    fn rule_for(&self, right: &str) -> AuthRule {
        let rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.get(right) {
            return rule.clone();
        }
        // Longest dotted prefix: "system.keychain.modify" falls back to
        // "system.keychain." then "system." entries.
        let mut prefix = right;
        while let Some(dot) = prefix.rfind('.') {
            prefix = &right[..dot];
            let key = format!("{prefix}.");
            if let Some(rule) = rules.get(&key) {
                return rule.clone();
            }
        }
        rules
            .get(DEFAULT_RULE)
            .cloned()
            .unwrap_or(AuthRule::Deny)
    }

    /// Establish a credential from the environment, if it carries a
    /// username/uid pair the rule accepts.
    fn credential_from_environment(
        environment: &[AuthItem],
        uid: u32,
    ) -> Option<std::sync::Arc<Credential>> {
        let name = environment
            .iter()
            .find(|item| item.name == "username")
            .and_then(|item| item.value.clone())?;
        let env_uid: u32 = environment
            .iter()
            .find(|item| item.name == "uid")
            .and_then(|item| item.value.as_deref())
            .and_then(|value| value.parse().ok())?;
        if env_uid != uid {
            return None;
        }
        Some(Credential::new(uid, name, true))
    }

    fn check_admin(creds: &CredentialSet) -> AuthResult<()> {
        if creds.has_valid(0) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

impl Default for LocalAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl Authority for LocalAuthority {
    fn authorize(
        &self,
        rights: &[String],
        environment: &[AuthItem],
        flags: AuthFlags,
        creds: &CredentialSet,
        audit: &AuditInfo,
    ) -> AuthResult<AuthorityDecision> {
        let mut decision = AuthorityDecision::default();

        for right in rights {
            let rule = self.rule_for(right);
            let granted = match rule {
                AuthRule::Allow => true,
                AuthRule::Deny => false,
                AuthRule::RequireRoot => creds.has_valid(0),
                AuthRule::AuthenticateAs { uid } => {
                    if creds.has_valid(uid) {
                        true
                    } else if let Some(cred) =
                        Self::credential_from_environment(environment, uid)
                    {
                        decision.new_creds.insert(cred);
                        true
                    } else {
                        false
                    }
                }
            };

            debug!(right = %right, granted, pid = audit.pid, "right evaluated");
            if granted {
                decision.granted.push(right.clone());
            } else if !flags.contains(AuthFlags::PARTIAL_RIGHTS) {
                return Err(AuthError::InvalidCredentials);
            }
        }

        Ok(decision)
    }

    fn get_rule(&self, name: &str) -> AuthResult<AuthRule> {
        self.rules
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::UnknownRule(name.to_string()))
    }

    fn set_rule(
        &self,
        name: &str,
        rule: AuthRule,
        creds: &CredentialSet,
    ) -> AuthResult<AuthorityDecision> {
        Self::check_admin(creds)?;
        self.rules
            .lock()
            .unwrap()
            .insert(name.to_string(), rule);
        debug!(rule = %name, "authorization rule installed");
        Ok(AuthorityDecision::default())
    }

    fn remove_rule(&self, name: &str, creds: &CredentialSet) -> AuthResult<AuthorityDecision> {
        Self::check_admin(creds)?;
        let removed = self.rules.lock().unwrap().remove(name);
        if removed.is_none() {
            return Err(AuthError::UnknownRule(name.to_string()));
        }
        debug!(rule = %name, "authorization rule removed");
        Ok(AuthorityDecision::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit() -> AuditInfo {
        AuditInfo { pid: 42, uid: 501 }
    }

    fn rights(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_allow_rule_grants() {
        let authority = LocalAuthority::with_rules([(
            "com.example.read".to_string(),
            AuthRule::Allow,
        )]);
        let decision = authority
            .authorize(
                &rights(&["com.example.read"]),
                &[],
                AuthFlags::NONE,
                &CredentialSet::new(),
                &audit(),
            )
            .unwrap();
        assert_eq!(decision.granted, rights(&["com.example.read"]));
        assert!(decision.new_creds.is_empty());
    }

    #[test]
    fn test_default_rule_denies() {
        let authority = LocalAuthority::new();
        let err = authority
            .authorize(
                &rights(&["com.example.anything"]),
                &[],
                AuthFlags::NONE,
                &CredentialSet::new(),
                &audit(),
            )
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    #[test]
    fn test_partial_rights_returns_subset() {
        let authority = LocalAuthority::with_rules([(
            "com.example.read".to_string(),
            AuthRule::Allow,
        )]);
        let decision = authority
            .authorize(
                &rights(&["com.example.read", "com.example.write"]),
                &[],
                AuthFlags::PARTIAL_RIGHTS,
                &CredentialSet::new(),
                &audit(),
            )
            .unwrap();
        assert_eq!(decision.granted, rights(&["com.example.read"]));
    }

    #[test]
    fn test_authenticate_rule_uses_pool_credential() {
        let authority = LocalAuthority::with_rules([(
            "com.example.modify".to_string(),
            AuthRule::AuthenticateAs { uid: 501 },
        )]);
        let mut creds = CredentialSet::new();
        creds.insert(Credential::new(501, "alice", true));

        let decision = authority
            .authorize(
                &rights(&["com.example.modify"]),
                &[],
                AuthFlags::NONE,
                &creds,
                &audit(),
            )
            .unwrap();
        assert_eq!(decision.granted.len(), 1);
        // Nothing newly established: the pool credential sufficed.
        assert!(decision.new_creds.is_empty());
    }

    #[test]
    fn test_authenticate_rule_mints_credential_from_environment() {
        let authority = LocalAuthority::with_rules([(
            "com.example.modify".to_string(),
            AuthRule::AuthenticateAs { uid: 501 },
        )]);
        let environment = vec![
            AuthItem::new("username", Some("alice".into())),
            AuthItem::new("uid", Some("501".into())),
        ];

        let decision = authority
            .authorize(
                &rights(&["com.example.modify"]),
                &environment,
                AuthFlags::EXTEND_RIGHTS,
                &CredentialSet::new(),
                &audit(),
            )
            .unwrap();
        assert_eq!(decision.granted.len(), 1);
        let cred = decision.new_creds.get(501).unwrap();
        assert!(cred.is_shared());
        assert!(cred.is_valid());
    }

    #[test]
    fn test_invalidated_credential_is_ignored() {
        let authority = LocalAuthority::with_rules([(
            "com.example.modify".to_string(),
            AuthRule::AuthenticateAs { uid: 501 },
        )]);
        let mut creds = CredentialSet::new();
        let cred = Credential::new(501, "alice", true);
        cred.invalidate();
        creds.insert(cred);

        assert!(authority
            .authorize(
                &rights(&["com.example.modify"]),
                &[],
                AuthFlags::NONE,
                &creds,
                &audit(),
            )
            .is_err());
    }

    #[test]
    fn test_prefix_rule_match() {
        let authority = LocalAuthority::with_rules([(
            "com.example.".to_string(),
            AuthRule::Allow,
        )]);
        let decision = authority
            .authorize(
                &rights(&["com.example.sub.right"]),
                &[],
                AuthFlags::NONE,
                &CredentialSet::new(),
                &audit(),
            )
            .unwrap();
        assert_eq!(decision.granted.len(), 1);
    }

    #[test]
    fn test_rule_administration_requires_root() {
        let authority = LocalAuthority::new();
        let no_creds = CredentialSet::new();
        assert!(authority
            .set_rule("com.example.read", AuthRule::Allow, &no_creds)
            .is_err());

        let mut root_creds = CredentialSet::new();
        root_creds.insert(Credential::new(0, "root", true));
        authority
            .set_rule("com.example.read", AuthRule::Allow, &root_creds)
            .unwrap();
        assert_eq!(
            authority.get_rule("com.example.read").unwrap(),
            AuthRule::Allow
        );

        authority
            .remove_rule("com.example.read", &root_creds)
            .unwrap();
        assert!(matches!(
            authority.get_rule("com.example.read"),
            Err(AuthError::UnknownRule(_))
        ));
    }
}
