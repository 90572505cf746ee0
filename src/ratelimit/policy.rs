//! Rate limit policies and the named presets for endpoint classes.
//!
//! A policy is a `(limit, window)` pair. Endpoint classes map to policies
//! through a [`PolicyTable`], which starts from the built-in presets and can
//! be overridden from YAML:
//!
//! ```yaml
//! policies:
//!   auth:
//!     limit: 3
//!     window_ms: 600000
//!   reports:
//!     limit: 20
//!     window_ms: 60000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Maximum requests allowed per fixed window.
///
/// A policy always has a non-zero window; a zero `limit` is valid and denies
/// every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicySpec")]
pub struct RateLimitPolicy {
    limit: u64,
    window_ms: u64,
}

/// Unvalidated wire form of a policy.
#[derive(Debug, Clone, Copy, Deserialize)]
struct PolicySpec {
    limit: u64,
    window_ms: u64,
}

impl TryFrom<PolicySpec> for RateLimitPolicy {
    type Error = TurnstileError;

    fn try_from(spec: PolicySpec) -> Result<Self> {
        RateLimitPolicy::new(spec.limit, spec.window_ms)
    }
}

impl RateLimitPolicy {
    /// Create a policy, rejecting a zero-length window.
    pub fn new(limit: u64, window_ms: u64) -> Result<Self> {
        if window_ms == 0 {
            return Err(TurnstileError::InvalidPolicy(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        Ok(Self { limit, window_ms })
    }

    /// Create a policy from a window expressed as a [`Duration`].
    pub fn per(limit: u64, window: Duration) -> Result<Self> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        Self::new(limit, window_ms)
    }

    const fn preset(limit: u64, window_ms: u64) -> Self {
        Self { limit, window_ms }
    }

    /// Maximum requests per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length in milliseconds, clamped to the timestamp range.
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window_ms).unwrap_or(i64::MAX)
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Built-in endpoint classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPreset {
    /// Login, password reset and similar credential checks
    Auth,
    /// General API traffic
    Api,
    /// Bulk data exports (payroll, reports)
    Export,
    /// Inbound webhook receivers
    Webhook,
}

impl PolicyPreset {
    /// Every preset, in a stable order.
    pub const ALL: [PolicyPreset; 4] = [
        PolicyPreset::Auth,
        PolicyPreset::Api,
        PolicyPreset::Export,
        PolicyPreset::Webhook,
    ];

    /// The class name used in keys and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyPreset::Auth => "auth",
            PolicyPreset::Api => "api",
            PolicyPreset::Export => "export",
            PolicyPreset::Webhook => "webhook",
        }
    }

    /// The default policy for this class.
    pub const fn policy(&self) -> RateLimitPolicy {
        match self {
            // 5 per 15 minutes
            PolicyPreset::Auth => RateLimitPolicy::preset(5, 15 * 60 * 1000),
            // 100 per minute
            PolicyPreset::Api => RateLimitPolicy::preset(100, 60 * 1000),
            // 10 per hour
            PolicyPreset::Export => RateLimitPolicy::preset(10, 60 * 60 * 1000),
            // 300 per minute
            PolicyPreset::Webhook => RateLimitPolicy::preset(300, 60 * 1000),
        }
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyPreset {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        PolicyPreset::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| TurnstileError::Config(format!("Unknown policy preset: {}", s)))
    }
}

impl From<PolicyPreset> for RateLimitPolicy {
    fn from(preset: PolicyPreset) -> Self {
        preset.policy()
    }
}

/// Policies indexed by endpoint class name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyTable {
    policies: BTreeMap<String, RateLimitPolicy>,
}

/// Shape of a policy override document.
#[derive(Debug, Default, Deserialize)]
struct PolicyOverrides {
    #[serde(default)]
    policies: BTreeMap<String, RateLimitPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let policies = PolicyPreset::ALL
            .into_iter()
            .map(|preset| (preset.as_str().to_string(), preset.policy()))
            .collect();
        Self { policies }
    }
}

impl PolicyTable {
    /// A table holding only the built-in presets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from a YAML file on top of the presets.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load overrides from a YAML string on top of the presets.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: PolicyOverrides = serde_yaml::from_str(yaml).map_err(|e| {
            TurnstileError::Config(format!("Failed to parse rate limit policies: {}", e))
        })?;

        let mut table = Self::new();
        table.merge(overrides.policies);
        Ok(table)
    }

    /// Replace or add policies. Presets not named keep their defaults.
    pub fn merge<I>(&mut self, policies: I)
    where
        I: IntoIterator<Item = (String, RateLimitPolicy)>,
    {
        for (class, policy) in policies {
            self.insert(class, policy);
        }
    }

    /// Set the policy for a class. Class names are case-insensitive.
    pub fn insert(&mut self, class: impl Into<String>, policy: RateLimitPolicy) {
        self.policies.insert(normalize_class(class.into()), policy);
    }

    /// Look up the policy for a class, ignoring case.
    pub fn get(&self, class: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(&class.to_ascii_lowercase())
    }

    /// The (possibly overridden) policy for a preset class.
    pub fn preset(&self, preset: PolicyPreset) -> RateLimitPolicy {
        self.get(preset.as_str())
            .copied()
            .unwrap_or_else(|| preset.policy())
    }

    /// All configured classes with their policies.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RateLimitPolicy)> {
        self.policies.iter().map(|(class, policy)| (class.as_str(), policy))
    }

    /// Number of configured classes.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the table has no classes.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Class names are stored and compared in lowercase.
pub(crate) fn normalize_class(mut class: String) -> String {
    class.make_ascii_lowercase();
    class
}
