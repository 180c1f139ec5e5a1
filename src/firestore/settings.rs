use std::time::Duration;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::util::BackoffSettings;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESUME_TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Tunables for the client core.
#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    /// Limbo resolution targets allowed in flight at once; the rest wait in FIFO order.
    pub max_concurrent_limbo_resolutions: usize,
    pub backoff: BackoffSettings,
    /// How long an unused stream stays open before it is half-closed.
    pub idle_timeout: Duration,
    /// How long a stream may take to become healthy before it is reopened.
    pub health_check_timeout: Duration,
    /// Resume tokens older than this are persisted even without other changes.
    pub resume_token_max_age: Duration,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            backoff: BackoffSettings::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            resume_token_max_age: DEFAULT_RESUME_TOKEN_MAX_AGE,
        }
    }
}

impl FirestoreSettings {
    pub fn validate(&self) -> FirestoreResult<()> {
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be at least 1",
            ));
        }
        if !(self.backoff.backoff_factor >= 1.0) {
            return Err(invalid_argument(format!(
                "backoff factor must be >= 1.0, got {}",
                self.backoff.backoff_factor
            )));
        }
        if self.backoff.initial_delay > self.backoff.max_delay {
            return Err(invalid_argument(
                "backoff initial delay must not exceed the maximum delay",
            ));
        }
        Ok(())
    }
}
