//! Username/password pair with username-only identity.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::secret::SecretString;

/// Authentication context for a physical connection.
///
/// Both fields are optional: an anonymous credential (no username, no
/// password) requests whatever default identity the connection source
/// grants.
///
/// # Identity
///
/// `Eq` and `Hash` are defined on the **username only** — two credentials
/// with the same username and different passwords are equal and hash
/// identically. This is deliberate, not an oversight: pools are keyed by
/// credential, and a password rotation must *replace* the pool for a
/// username rather than silently create a second one next to it. Use
/// [`matches_password`] when the password itself has to be compared.
///
/// [`matches_password`]: Credential::matches_password
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    username: Option<String>,
    password: Option<SecretString>,
}

impl Credential {
    /// Creates a credential with both a username and a password.
    pub fn new(username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Creates a credential carrying a username but no password.
    pub fn username_only(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: None,
        }
    }

    /// Creates the no-credential value.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// The username, if any.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The password, if any.
    #[must_use]
    pub fn password(&self) -> Option<&SecretString> {
        self.password.as_ref()
    }

    /// Returns a copy of this credential with the password replaced.
    #[must_use]
    pub fn with_password(&self, password: Option<SecretString>) -> Self {
        Self {
            username: self.username.clone(),
            password,
        }
    }

    /// Full password comparison (constant-time on the secret bytes).
    ///
    /// Two absent passwords match; an absent password never matches a
    /// present one.
    #[must_use]
    pub fn matches_password(&self, supplied: Option<&str>) -> bool {
        match (&self.password, supplied) {
            (None, None) => true,
            (Some(own), Some(given)) => own.expose(|s| {
                use subtle::ConstantTimeEq;
                s.as_bytes().ct_eq(given.as_bytes()).into()
            }),
            _ => false,
        }
    }
}

/// Identity on username only — see the type-level docs.
impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
    }
}

impl Eq for Credential {}

/// Hash on username only — must stay consistent with `PartialEq`.
impl Hash for Credential {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.username.hash(state);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
