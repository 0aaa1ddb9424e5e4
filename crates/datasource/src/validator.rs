//! Connection validation: lifetime expiry and usability checks.

use std::time::Duration;

use thiserror::Error;

use crate::entry::{PoolEntry, ValidatingSet};
use crate::source::RawConnection;

/// Raised by the lifetime check used at activate/passivate time.
#[derive(Error, Debug)]
#[error("connection exceeded maximum lifetime ({age:?} >= {max:?})")]
pub struct MaxLifetimeExceeded {
    /// Current age of the connection.
    pub age: Duration,
    /// Configured maximum lifetime.
    pub max: Duration,
}

/// Decides whether a pooled connection is still usable.
///
/// `validate` never fails with an error: every backend exception during a
/// check resolves to `false` and the pool's policy decides what happens
/// next. The lifetime rule is additionally exposed on its own, because
/// activate/passivate surface it as an error rather than a boolean.
#[derive(Debug, Clone)]
pub struct ConnectionValidator {
    validation_query: Option<String>,
    validation_timeout: Option<Duration>,
    rollback_after_validation: bool,
    max_lifetime: Option<Duration>,
}

impl ConnectionValidator {
    /// Build a validator.
    ///
    /// With no `validation_query`, the connection's native check is used.
    /// `max_lifetime` of `None` means connections never expire by age.
    #[must_use]
    pub fn new(
        validation_query: Option<String>,
        validation_timeout: Option<Duration>,
        rollback_after_validation: bool,
        max_lifetime: Option<Duration>,
    ) -> Self {
        Self {
            validation_query,
            validation_timeout,
            rollback_after_validation,
            max_lifetime,
        }
    }

    /// The configured maximum lifetime, if any.
    #[must_use]
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime
    }

    /// Fail when `age` has reached the configured maximum lifetime.
    pub fn check_lifetime(&self, age: Duration) -> Result<(), MaxLifetimeExceeded> {
        match self.max_lifetime {
            Some(max) if !max.is_zero() && age >= max => Err(MaxLifetimeExceeded { age, max }),
            _ => Ok(()),
        }
    }

    /// Full validation of a pooled entry. Never raises; backend failures
    /// mean `false`.
    ///
    /// The connection is marked in `validating` for the duration of the
    /// probe so a close event fired by the probe itself is not mistaken
    /// for a client release; the mark is cleared on every exit path.
    pub async fn validate<C: RawConnection>(
        &self,
        entry: &PoolEntry<C>,
        validating: &ValidatingSet,
    ) -> bool {
        if self.check_lifetime(entry.age()).is_err() {
            return false;
        }

        let conn = entry.conn();
        let id = conn.id();
        validating.insert(id);
        let _unmark = scopeguard::guard((), |()| validating.remove(id));

        match &self.validation_query {
            None => conn
                .is_valid(self.effective_timeout())
                .await
                .unwrap_or(false),
            Some(query) => {
                let outcome = async {
                    let rows = conn.execute_query(query, self.effective_timeout()).await?;
                    if self.rollback_after_validation {
                        conn.rollback().await?;
                    }
                    Ok::<bool, crate::error::DataSourceError>(rows > 0)
                }
                .await;
                outcome.unwrap_or(false)
            }
        }
    }

    /// Timeout actually handed to the backend.
    ///
    /// Zero (or unset) means unbounded; a positive sub-second value is
    /// rounded up to one second because backend validity APIs take whole
    /// seconds and zero would mean "no limit".
    fn effective_timeout(&self) -> Option<Duration> {
        match self.validation_timeout {
            None => None,
            Some(t) if t.is_zero() => None,
            Some(t) if t < Duration::from_secs(1) => Some(Duration::from_secs(1)),
            Some(t) => Some(t),
        }
    }
}
