// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// TOML configuration. Every field has a default, so an empty file (or no
// file at all) yields a working supervisor.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable that overrides `namespace`.
pub const NAMESPACE_ENV: &str = "PROCX_NAMESPACE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Prefix of every shared resource name. Instances rendezvous on it.
    pub namespace: String,
    /// Number of process slots (N).
    pub process_capacity: usize,
    /// Number of instance slots (M); also the number of bus mailboxes.
    pub instance_capacity: usize,
    /// Pending notifications each mailbox can hold.
    pub mailbox_capacity: usize,
    /// Liveness Monitor period.
    pub poll_interval_ms: u64,
    /// Longest single sleep inside a blocking bus receive.
    pub receive_poll_ms: u64,
    /// Collect exited children that the table scan did not account for.
    pub reap_orphans: bool,
    /// SIGINT presses needed before the terminal shuts down.
    pub interrupt_confirmations: usize,
    /// Default `tracing` filter; `RUST_LOG` wins when set.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "procx".to_owned(),
            process_capacity: 50,
            instance_capacity: 100,
            mailbox_capacity: 64,
            poll_interval_ms: 2000,
            receive_poll_ms: 250,
            reap_orphans: true,
            interrupt_confirmations: 3,
            log_filter: "info".to_owned(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `PROCX_NAMESPACE` if set.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(ns) = std::env::var(NAMESPACE_ENV) {
            self.namespace = ns;
            self.validate()?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::invalid("namespace", "must not be empty"));
        }
        if self
            .namespace
            .chars()
            .any(|c| c == '/' || c == '\0' || c.is_whitespace())
        {
            return Err(ConfigError::invalid(
                "namespace",
                format!("`{}` may not contain '/', NUL or whitespace", self.namespace),
            ));
        }
        if self.process_capacity == 0 || self.process_capacity > u32::MAX as usize {
            return Err(ConfigError::invalid("process_capacity", "must be in 1..=u32::MAX"));
        }
        // Instance ids pack the slot into 32 bits.
        if self.instance_capacity == 0 || self.instance_capacity > u32::MAX as usize {
            return Err(ConfigError::invalid("instance_capacity", "must be in 1..=u32::MAX"));
        }
        if self.mailbox_capacity == 0 || self.mailbox_capacity > u32::MAX as usize {
            return Err(ConfigError::invalid("mailbox_capacity", "must be in 1..=u32::MAX"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be positive"));
        }
        if self.receive_poll_ms == 0 {
            return Err(ConfigError::invalid("receive_poll_ms", "must be positive"));
        }
        if self.interrupt_confirmations == 0 {
            return Err(ConfigError::invalid("interrupt_confirmations", "must be at least 1"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_policy_constants() {
        let c = Config::default();
        assert_eq!(c.process_capacity, 50);
        assert_eq!(c.instance_capacity, 100);
        assert_eq!(c.poll_interval(), Duration::from_secs(2));
        assert_eq!(c.interrupt_confirmations, 3);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let c = Config::from_toml_str(
            r#"
            namespace = "lab"
            process_capacity = 4
            poll_interval_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(c.namespace, "lab");
        assert_eq!(c.process_capacity, 4);
        assert_eq!(c.poll_interval(), Duration::from_millis(100));
        assert_eq!(c.instance_capacity, 100);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Config::from_toml_str("cgroup_limit = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_values_name_the_field() {
        let err = Config::from_toml_str("process_capacity = 0").unwrap_err();
        assert!(err.to_string().starts_with("process_capacity"));

        let err = Config::from_toml_str("namespace = \"a/b\"").unwrap_err();
        assert!(err.to_string().starts_with("namespace"));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mailbox_capacity = 8").unwrap();
        let c = Config::load(file.path()).unwrap();
        assert_eq!(c.mailbox_capacity, 8);
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = Config::load(Path::new("/nonexistent/procx.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/procx.toml"));
    }
}
