//! Operator configuration.
//!
//! Settings come from the environment. Unset or unparsable values fall back
//! to the defaults.

use serde::Serialize;
use std::env;
use std::time::Duration;

/// Default seconds between passes over a steady cluster.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Default seconds before the next pass over a converging cluster.
pub const DEFAULT_REQUEUE_SECS: u64 = 20;

/// Default seconds to wait for a TCP connection to an etcd endpoint.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;

/// Default seconds to wait for an etcd membership call.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Component name stamped on events when the pod name is unknown.
pub const DEFAULT_EVENT_SOURCE: &str = "etcd-operator";

/// Operator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Seconds between passes over a steady cluster.
    pub reconcile_interval_secs: u64,
    /// Seconds before the next pass over a converging cluster.
    pub requeue_secs: u64,
    /// etcd dial timeout in seconds.
    pub dial_timeout_secs: u64,
    /// etcd request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Only watch this namespace. All namespaces when unset.
    pub watch_namespace: Option<String>,
    /// Component name on recorded events.
    pub event_source: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            requeue_secs: DEFAULT_REQUEUE_SECS,
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            watch_namespace: None,
            event_source: DEFAULT_EVENT_SOURCE.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            reconcile_interval_secs: secs(
                "ETCD_OPERATOR_RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL_SECS,
            ),
            requeue_secs: secs("ETCD_OPERATOR_REQUEUE_SECS", DEFAULT_REQUEUE_SECS),
            dial_timeout_secs: secs("ETCD_OPERATOR_DIAL_TIMEOUT_SECS", DEFAULT_DIAL_TIMEOUT_SECS),
            request_timeout_secs: secs(
                "ETCD_OPERATOR_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
            watch_namespace: non_empty("ETCD_OPERATOR_WATCH_NAMESPACE"),
            event_source: non_empty("MY_POD_NAME")
                .unwrap_or_else(|| DEFAULT_EVENT_SOURCE.to_string()),
        }
    }

    /// Interval between passes over a steady cluster.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Interval before the next pass over a converging cluster.
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    /// etcd dial timeout.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// etcd request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
