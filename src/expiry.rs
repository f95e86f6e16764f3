//! Content lifetime policy.

use std::collections::HashMap;
use std::time::Duration;

use crate::content::now_millis;

/// Maps submission metadata to an expiry instant.
///
/// A default lifetime applies to everything, with per-source overrides
/// keyed by user agent, origin or host (matched in that precedence). A
/// zero or negative number of minutes means "never expire".
pub struct ExpiryHandler {
    default_lifetime: Option<Duration>,
    specific_lifetimes: HashMap<String, Option<Duration>>,
}

impl ExpiryHandler {
    pub fn new(lifetime_minutes: i64, specific_minutes: &HashMap<String, i64>) -> Self {
        Self {
            default_lifetime: to_lifetime(lifetime_minutes),
            specific_lifetimes: specific_minutes
                .iter()
                .map(|(source, minutes)| (source.clone(), to_lifetime(*minutes)))
                .collect(),
        }
    }

    /// Whether any finite expiry time is configured at all.
    pub fn has_expiry_times(&self) -> bool {
        self.default_lifetime.is_some() || !self.specific_lifetimes.is_empty()
    }

    /// The expiry instant (epoch millis) for content submitted with the
    /// given metadata, or `None` if it should never expire.
    pub fn expiry(&self, user_agent: &str, origin: &str, host: &str) -> Option<i64> {
        let lifetime = self
            .specific_lifetimes
            .get(user_agent)
            .or_else(|| self.specific_lifetimes.get(origin))
            .or_else(|| self.specific_lifetimes.get(host))
            .unwrap_or(&self.default_lifetime);

        lifetime.map(|duration| now_millis() + duration.as_millis() as i64)
    }
}

fn to_lifetime(minutes: i64) -> Option<Duration> {
    // zero is the "don't expire" sentinel; a negative value implies the same
    (minutes > 0).then(|| Duration::from_secs(minutes as u64 * 60))
}
