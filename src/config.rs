//! Tunables for a [`crate::Connection`].
//!
//! Mirrors the consuming-builder shape used throughout this kind of crate:
//! each setter takes `self` by value and returns `Self`, terminated by
//! [`ClientConfig::build`].

use std::time::Duration;

/// Default cap on how many times a redispatched op may be re-queued before
/// it is dropped (spec.md §4.5; not present in the original source, chosen
/// here to bound pathological loops).
pub const DEFAULT_REDISPATCH_ATTEMPTS: u32 = 16;

const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_LOGOUT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a single connection's worth of core state.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) simulation_speed: f64,
    pub(crate) redispatch_attempts: u32,
    pub(crate) login_timeout: Duration,
    pub(crate) logout_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) seed_types: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            simulation_speed: 1.0,
            redispatch_attempts: DEFAULT_REDISPATCH_ATTEMPTS,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            logout_timeout: DEFAULT_LOGOUT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            seed_types: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder(ClientConfig::default())
    }
}

/// Builder for [`ClientConfig`].
#[derive(Clone, Debug, Default)]
pub struct ClientConfigBuilder(ClientConfig);

impl ClientConfigBuilder {
    /// Models time dilation: predicted motion advances at `speed` times
    /// wall-clock (spec.md §4.7). Defaults to `1.0`.
    pub fn simulation_speed(mut self, speed: f64) -> Self {
        self.0.simulation_speed = speed;
        self
    }

    /// Maximum number of times a blocked op may be redispatched before it is
    /// dropped. Defaults to [`DEFAULT_REDISPATCH_ATTEMPTS`].
    pub fn redispatch_attempts(mut self, attempts: u32) -> Self {
        self.0.redispatch_attempts = attempts;
        self
    }

    /// How long a pending LOGIN/LOGOUT request may go unanswered before it
    /// fails with a timeout. Defaults to 15s.
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.0.login_timeout = timeout;
        self
    }

    pub fn logout_timeout(mut self, timeout: Duration) -> Self {
        self.0.logout_timeout = timeout;
        self
    }

    /// Timeout applied to other request kinds (look/create/possess/type
    /// lookup does *not* time out — spec.md §4.4 Failure semantics).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.0.request_timeout = timeout;
        self
    }

    /// Additional builtin type names to seed as permanently bound at
    /// startup, alongside `root`, `root-entity`, `root-operation`, and
    /// `anonymous`.
    pub fn seed_types(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.0.seed_types = names.into_iter().collect();
        self
    }

    pub fn build(self) -> ClientConfig {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.redispatch_attempts, 16);
        assert_eq!(cfg.login_timeout, Duration::from_secs(15));
        assert_eq!(cfg.simulation_speed, 1.0);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = ClientConfig::builder()
            .simulation_speed(2.0)
            .redispatch_attempts(4)
            .build();
        assert_eq!(cfg.simulation_speed, 2.0);
        assert_eq!(cfg.redispatch_attempts, 4);
    }
}
