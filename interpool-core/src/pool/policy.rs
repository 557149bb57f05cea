//! Expiration Policies and Pool Configuration

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Expiration policy for one interpreter class.
///
/// A value of `0` means unbounded in that dimension. The defaults are
/// deliberately conservative: one request per instance, no idle or age
/// limit, which gives fresh-context-per-request semantics until a host
/// opts into reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassPolicy {
    /// Requests an instance may serve before it expires (0 = unbounded).
    pub max_requests: u64,
    /// Seconds an instance may sit free before it expires (0 = unbounded).
    pub max_idle_secs: u64,
    /// Seconds an instance may live in total (0 = unbounded).
    pub max_ttl_secs: u64,
}

impl Default for ClassPolicy {
    fn default() -> Self {
        Self {
            max_requests: 1,
            max_idle_secs: 0,
            max_ttl_secs: 0,
        }
    }
}

impl ClassPolicy {
    /// A policy with every dimension unbounded.
    pub fn unbounded() -> Self {
        Self {
            max_requests: 0,
            max_idle_secs: 0,
            max_ttl_secs: 0,
        }
    }

    pub(crate) fn request_limit_reached(&self, count: u64) -> bool {
        self.max_requests != 0 && count >= self.max_requests
    }

    pub(crate) fn idle_exceeded(&self, last_used: SystemTime, now: SystemTime) -> bool {
        self.max_idle_secs != 0 && elapsed_secs(last_used, now) > self.max_idle_secs
    }

    pub(crate) fn ttl_exceeded(&self, created: SystemTime, now: SystemTime) -> bool {
        self.max_ttl_secs != 0 && elapsed_secs(created, now) > self.max_ttl_secs
    }
}

fn elapsed_secs(from: SystemTime, to: SystemTime) -> u64 {
    to.duration_since(from)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Pool-wide configuration: a default policy plus per-class overrides.
///
/// Hosts usually deserialize this from their server configuration and hand
/// it to the pool at construction; later `configure_class_policy` calls
/// update it in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Policy applied to classes without an explicit override.
    pub default_policy: ClassPolicy,
    /// Per-class policy overrides, keyed by canonical identity.
    pub classes: HashMap<String, ClassPolicy>,
}

impl PoolConfig {
    /// Parse a configuration from its JSON representation.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub(crate) fn policy_for(&self, identity: &Path) -> ClassPolicy {
        identity
            .to_str()
            .and_then(|key| self.classes.get(key))
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub(crate) fn set_class_policy(&mut self, identity: &Path, policy: ClassPolicy) {
        self.classes
            .insert(identity.to_string_lossy().into_owned(), policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_policy_is_single_request() {
        let policy = ClassPolicy::default();
        assert_eq!(policy.max_requests, 1);
        assert_eq!(policy.max_idle_secs, 0);
        assert_eq!(policy.max_ttl_secs, 0);
    }

    #[test]
    fn test_request_limit() {
        let policy = ClassPolicy {
            max_requests: 3,
            ..ClassPolicy::unbounded()
        };
        assert!(!policy.request_limit_reached(2));
        assert!(policy.request_limit_reached(3));
        assert!(policy.request_limit_reached(4));

        // 0 means never.
        assert!(!ClassPolicy::unbounded().request_limit_reached(1_000_000));
    }

    #[test]
    fn test_idle_and_ttl_are_strict() {
        let policy = ClassPolicy {
            max_requests: 0,
            max_idle_secs: 60,
            max_ttl_secs: 300,
        };
        let now = SystemTime::now();

        // Exactly at the threshold is still alive; one second past is not.
        assert!(!policy.idle_exceeded(now - Duration::from_secs(60), now));
        assert!(policy.idle_exceeded(now - Duration::from_secs(61), now));
        assert!(!policy.ttl_exceeded(now - Duration::from_secs(300), now));
        assert!(policy.ttl_exceeded(now - Duration::from_secs(301), now));
    }

    #[test]
    fn test_config_from_json() {
        let config = PoolConfig::from_json(
            r#"{
                "default_policy": { "max_requests": 0, "max_idle_secs": 120 },
                "classes": {
                    "/app/shop.ws": { "max_requests": 50, "max_ttl_secs": 3600 }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.default_policy.max_requests, 0);
        assert_eq!(config.default_policy.max_idle_secs, 120);

        let shop = config.policy_for(Path::new("/app/shop.ws"));
        assert_eq!(shop.max_requests, 50);
        assert_eq!(shop.max_ttl_secs, 3600);
        // Unlisted fields fall back to their defaults.
        assert_eq!(shop.max_idle_secs, 0);

        let other = config.policy_for(Path::new("/app/other.ws"));
        assert_eq!(other.max_idle_secs, 120);
    }

    #[test]
    fn test_set_class_policy_overrides() {
        let mut config = PoolConfig::default();
        let policy = ClassPolicy {
            max_requests: 9,
            ..ClassPolicy::unbounded()
        };
        config.set_class_policy(Path::new("/s.ws"), policy);
        assert_eq!(config.policy_for(Path::new("/s.ws")), policy);
    }
}
