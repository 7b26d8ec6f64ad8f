//! Job service configuration.

use std::borrow::Cow;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use flowjob_core::{LockOwner, TenantId};

/// How `MessageLimit::max_len` is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthUnit {
    Chars,
    Bytes,
}

/// Bound applied to exception messages when they are written to a job record.
///
/// The marker is counted inside the limit, so a truncated message is never longer
/// than `max_len`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLimit {
    pub max_len: usize,
    pub unit: LengthUnit,
    pub marker: String,
}

impl Default for MessageLimit {
    fn default() -> Self {
        Self {
            max_len: 255,
            unit: LengthUnit::Chars,
            marker: "...".to_string(),
        }
    }
}

impl MessageLimit {
    pub fn chars(max_len: usize) -> Self {
        Self {
            max_len,
            ..Default::default()
        }
    }

    pub fn bytes(max_len: usize) -> Self {
        Self {
            max_len,
            unit: LengthUnit::Bytes,
            ..Default::default()
        }
    }

    fn measure(&self, s: &str) -> usize {
        match self.unit {
            LengthUnit::Chars => s.chars().count(),
            LengthUnit::Bytes => s.len(),
        }
    }

    /// Byte offset of the longest prefix of `s` measuring at most `budget` units.
    fn prefix_end(&self, s: &str, budget: usize) -> usize {
        match self.unit {
            LengthUnit::Chars => s.char_indices().nth(budget).map_or(s.len(), |(i, _)| i),
            LengthUnit::Bytes => {
                let mut end = budget.min(s.len());
                while !s.is_char_boundary(end) {
                    end -= 1;
                }
                end
            }
        }
    }

    /// Apply the limit, returning the input untouched when it already fits.
    pub fn apply<'a>(&self, message: &'a str) -> Cow<'a, str> {
        if self.measure(message) <= self.max_len {
            return Cow::Borrowed(message);
        }

        let marker_len = self.measure(&self.marker);
        if marker_len >= self.max_len {
            // No room for the marker: hard cut.
            let end = self.prefix_end(message, self.max_len);
            return Cow::Owned(message[..end].to_string());
        }

        let end = self.prefix_end(message, self.max_len - marker_len);
        let mut out = String::with_capacity(end + self.marker.len());
        out.push_str(&message[..end]);
        out.push_str(&self.marker);
        Cow::Owned(out)
    }
}

/// Settings shared by the lease manager, job construction and command execution.
#[derive(Debug, Clone)]
pub struct JobServiceConfig {
    /// Identity of this engine instance.
    pub lock_owner: LockOwner,
    /// Lease length used when a caller does not pass one.
    pub lease_duration: Duration,
    /// Retry budget given to new jobs.
    pub default_retries: u32,
    /// Tenant assigned to jobs created without one (the "no tenant" sentinel).
    pub default_tenant: TenantId,
    pub exception_message_limit: MessageLimit,
    /// Configuration longer than this many bytes is offloaded to a blob.
    pub inline_configuration_threshold: usize,
    /// How often a logical operation is re-run after a version conflict.
    pub max_conflict_retries: u32,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            lock_owner: LockOwner::for_process(),
            lease_duration: Duration::from_secs(5 * 60),
            default_retries: 3,
            default_tenant: TenantId::new(""),
            exception_message_limit: MessageLimit::default(),
            inline_configuration_threshold: 4000,
            max_conflict_retries: 3,
        }
    }
}

impl JobServiceConfig {
    pub fn with_lock_owner(mut self, owner: LockOwner) -> Self {
        self.lock_owner = owner;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_default_tenant(mut self, tenant: TenantId) -> Self {
        self.default_tenant = tenant;
        self
    }

    pub fn with_exception_message_limit(mut self, limit: MessageLimit) -> Self {
        self.exception_message_limit = limit;
        self
    }

    pub fn with_inline_configuration_threshold(mut self, threshold: usize) -> Self {
        self.inline_configuration_threshold = threshold;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Load overrides from `FLOWJOB_*` environment variables.
    ///
    /// Recognised: `FLOWJOB_LOCK_OWNER`, `FLOWJOB_LEASE_SECS`, `FLOWJOB_DEFAULT_RETRIES`,
    /// `FLOWJOB_DEFAULT_TENANT`, `FLOWJOB_EXCEPTION_MESSAGE_MAX`,
    /// `FLOWJOB_EXCEPTION_MESSAGE_UNIT` (`chars`|`bytes`), `FLOWJOB_INLINE_CONFIG_MAX`,
    /// `FLOWJOB_MAX_CONFLICT_RETRIES`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(owner) = lookup("FLOWJOB_LOCK_OWNER") {
            config.lock_owner = LockOwner::new(owner).context("FLOWJOB_LOCK_OWNER")?;
        }
        if let Some(secs) = lookup("FLOWJOB_LEASE_SECS") {
            let secs: u64 = secs.parse().context("FLOWJOB_LEASE_SECS")?;
            config.lease_duration = Duration::from_secs(secs);
        }
        if let Some(retries) = lookup("FLOWJOB_DEFAULT_RETRIES") {
            config.default_retries = retries.parse().context("FLOWJOB_DEFAULT_RETRIES")?;
        }
        if let Some(tenant) = lookup("FLOWJOB_DEFAULT_TENANT") {
            config.default_tenant = TenantId::new(tenant);
        }
        if let Some(max) = lookup("FLOWJOB_EXCEPTION_MESSAGE_MAX") {
            config.exception_message_limit.max_len =
                max.parse().context("FLOWJOB_EXCEPTION_MESSAGE_MAX")?;
        }
        if let Some(unit) = lookup("FLOWJOB_EXCEPTION_MESSAGE_UNIT") {
            config.exception_message_limit.unit = match unit.to_lowercase().as_str() {
                "chars" => LengthUnit::Chars,
                "bytes" => LengthUnit::Bytes,
                other => anyhow::bail!("FLOWJOB_EXCEPTION_MESSAGE_UNIT: unknown unit '{other}'"),
            };
        }
        if let Some(max) = lookup("FLOWJOB_INLINE_CONFIG_MAX") {
            config.inline_configuration_threshold =
                max.parse().context("FLOWJOB_INLINE_CONFIG_MAX")?;
        }
        if let Some(retries) = lookup("FLOWJOB_MAX_CONFLICT_RETRIES") {
            config.max_conflict_retries = retries.parse().context("FLOWJOB_MAX_CONFLICT_RETRIES")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn short_messages_pass_through() {
        let limit = MessageLimit::chars(10);
        assert!(matches!(limit.apply("short"), Cow::Borrowed("short")));
    }

    #[test]
    fn long_messages_are_abbreviated_within_limit() {
        let limit = MessageLimit::chars(10);
        assert_eq!(limit.apply("abcdefghijklmnop"), "abcdefg...");
    }

    #[test]
    fn byte_mode_never_splits_a_char() {
        let limit = MessageLimit::bytes(6);
        // 'é' is two bytes; budget for text is 3 bytes.
        let out = limit.apply("ééééé");
        assert_eq!(out, "é...");
    }

    #[test]
    fn tiny_limit_cuts_without_marker() {
        let limit = MessageLimit::chars(2);
        assert_eq!(limit.apply("abcdef"), "ab");
    }

    #[test]
    fn env_overrides_are_applied() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FLOWJOB_LOCK_OWNER", "node-7"),
            ("FLOWJOB_LEASE_SECS", "30"),
            ("FLOWJOB_DEFAULT_RETRIES", "5"),
            ("FLOWJOB_EXCEPTION_MESSAGE_UNIT", "bytes"),
        ]);
        let config = JobServiceConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.lock_owner.as_str(), "node-7");
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.default_retries, 5);
        assert_eq!(config.exception_message_limit.unit, LengthUnit::Bytes);
        assert_eq!(config.default_tenant.as_str(), "");
    }

    #[test]
    fn malformed_env_value_is_reported() {
        let err = JobServiceConfig::from_lookup(|k| {
            (k == "FLOWJOB_LEASE_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("FLOWJOB_LEASE_SECS"));
    }

    proptest! {
        #[test]
        fn truncation_respects_bound(message in ".{0,400}", max in 4usize..300) {
            for limit in [MessageLimit::chars(max), MessageLimit::bytes(max)] {
                let out = limit.apply(&message);
                prop_assert!(limit.measure(&out) <= max);
            }
        }
    }
}
