//! # Configuration Module
//!
//! A [`Config`] is an ordered set of case-insensitive `name=value` pairs.
//! It selects the middleware driver, carries transport hints on a
//! per-message basis, and controls every optional subsystem of a
//! connection (tracking, validation, aggregation, asynchronous publish,
//! request/reply shaping).
//!
//! Unrecognized keys are retained and passed through to the driver;
//! the core only interprets the names in [`keys`].

use crate::status::{Result, Status, StatusClass, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Names of the configuration options recognized by the core runtime.
pub mod keys {
    /// Selects the middleware driver (`loopback`, `bolt`, ...).
    pub const MW_ID: &str = "mw-id";
    /// Legacy alias for [`MW_ID`].
    pub const CONNECTION_TYPE: &str = "connectiontype";
    /// Server endpoint, or a comma-separated failover URI list.
    pub const SERVER: &str = "server";
    /// Alias for [`SERVER`].
    pub const MW_SERVER: &str = "mw-server";

    pub const TRACKING: &str = "tracking";
    pub const TRACKING_NODE: &str = "tracking-node";
    pub const TRACKING_PROCESS_ID: &str = "tracking-process-id";
    pub const TRACKING_USER_NAME: &str = "tracking-user-name";
    pub const TRACKING_CONNECTION_ID: &str = "tracking-connection-id";
    pub const TRACKING_PUBLISH_TIME: &str = "tracking-publish-time";
    pub const TRACKING_UNIQUE_ID: &str = "tracking-unique-id";
    pub const TRACKING_MW_INFO: &str = "tracking-mw-info";
    pub const TRACKING_ACTIVE_SUBSCRIPTIONS: &str = "tracking-active-subscriptions";
    pub const TRACKING_CONNECTION_ENDPOINT: &str = "tracking-connection-endpoint";

    pub const MSG_CONTENT_VALIDATE: &str = "gmsec-msg-content-validate";
    pub const MSG_CONTENT_VALIDATE_SEND: &str = "gmsec-msg-content-validate-send";
    pub const MSG_CONTENT_VALIDATE_RECV: &str = "gmsec-msg-content-validate-recv";
    pub const MSG_CONTENT_VALIDATE_ALL: &str = "gmsec-msg-content-validate-all";
    pub const REMOVE_TRACKING_FIELDS: &str = "gmsec-remove-tracking-fields";

    pub const ASYNC_PUBLISH: &str = "gmsec-async-publish";
    pub const ASYNC_PUBLISH_QUEUE_DEPTH: &str = "gmsec-async-publish-queue-depth";
    pub const ASYNC_PUBLISH_TEARDOWN_WAIT: &str = "gmsec-async-publish-teardown-wait";

    pub const USE_MSG_BINS: &str = "gmsec-use-msg-bins";
    pub const MSG_BIN_SIZE: &str = "gmsec-msg-bin-size";
    pub const MSG_BIN_TIMEOUT: &str = "gmsec-msg-bin-timeout";
    pub const MSG_BIN_SUBJECT: &str = "gmsec-msg-bin-subject";

    pub const REQ_REPUBLISH_MS: &str = "gmsec-req-republish-ms";
    pub const REPLY_SUBJECT: &str = "gmsec-reply-subject";
    pub const REQ_RESP_BEHAVIOR: &str = "gmsec-req-resp-behavior";
    pub const EXPOSE_REPLIES: &str = "gmsec-expose-replies";
    pub const MULTI_RESPONSE: &str = "gmsec-multi-response";
    pub const SUBSCRIBE_FOR_RESPONSE: &str = "gmsec-subscribe-for-response";
    pub const DISABLE_RR: &str = "gmsec-disable-rr";

    pub const LOG_PERFORMANCE: &str = "gmsec-log-performance";

    pub const MAX_CONN_RETRIES: &str = "gmsec-max-conn-retries";
    pub const CONN_RETRY_INTERVAL: &str = "gmsec-conn-retry-interval";

    pub const SPECIFICATION_VERSION: &str = "gmsec-specification-version";
    pub const SCHEMA_LEVEL: &str = "gmsec-schema-level";
    pub const LEGACY_SCHEMA_FILES: &str = "gmsec-legacy-schema-files";
    pub const SUPPORT_LEGACY_API: &str = "gmsec-support-legacy-api";

    pub const FILTER_DUPS: &str = "mw-filter-dups";
}

/// Ordered, case-insensitive key/value configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    entries: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from whitespace-separated `name=value` tokens, e.g.
    /// `"mw-id=loopback tracking=false"`.
    pub fn from_args(data: &str) -> Result<Self> {
        let mut config = Config::new();
        for token in data.split_whitespace() {
            let (name, value) = token.split_once('=').ok_or_else(|| {
                Status::new(
                    StatusClass::ConfigError,
                    StatusCode::BadMsgFormat,
                    format!("Expected name=value, got '{token}'"),
                )
            })?;
            config.add_value(name, value)?;
        }
        Ok(config)
    }

    /// Build a config from its canonical JSON form:
    /// `{"CONFIG":{"PARAMETER":[{"NAME":...,"VALUE":...},...]}}`.
    pub fn from_json(data: &str) -> Result<Self> {
        let root: serde_json::Value = serde_json::from_str(data).map_err(|e| {
            Status::new(
                StatusClass::ConfigError,
                StatusCode::BadMsgFormat,
                format!("Malformed config JSON: {e}"),
            )
        })?;

        let params = root
            .get("CONFIG")
            .and_then(|c| c.get("PARAMETER"))
            .and_then(|p| p.as_array())
            .ok_or_else(|| {
                Status::new(
                    StatusClass::ConfigError,
                    StatusCode::BadMsgFormat,
                    "Config JSON is missing CONFIG.PARAMETER",
                )
            })?;

        let mut config = Config::new();
        for param in params {
            let name = param.get("NAME").and_then(|v| v.as_str());
            let value = param.get("VALUE").and_then(|v| v.as_str());
            match (name, value) {
                (Some(name), Some(value)) => config.add_value(name, value)?,
                _ => {
                    return Err(Status::new(
                        StatusClass::ConfigError,
                        StatusCode::BadMsgFormat,
                        "Config PARAMETER entry is missing NAME or VALUE",
                    ))
                }
            }
        }
        Ok(config)
    }

    /// Render the canonical JSON form.
    pub fn to_json(&self) -> String {
        let params: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|(name, value)| serde_json::json!({"NAME": name, "VALUE": value}))
            .collect();
        serde_json::json!({"CONFIG": {"PARAMETER": params}}).to_string()
    }

    /// Add or replace a value. Names are folded to lowercase.
    pub fn add_value(&mut self, name: &str, value: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Status::new(
                StatusClass::ConfigError,
                StatusCode::InvalidFieldName,
                "Config entry name cannot be empty",
            ));
        }
        self.entries.insert(name.trim().to_lowercase(), value.to_string());
        Ok(())
    }

    /// Remove an entry; returns whether it existed.
    pub fn clear_value(&mut self, name: &str) -> bool {
        self.entries.remove(&name.trim().to_lowercase()).is_some()
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.trim().to_lowercase()).map(String::as_str)
    }

    /// Look up a value under any of the given aliases, first hit wins.
    pub fn value_of_any(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.value(name))
    }

    /// Boolean interpretation: `true`/`false` (case-insensitive) or `0`/`1`.
    pub fn boolean_value(&self, name: &str, default: bool) -> bool {
        match self.value(name) {
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => default,
            },
            None => default,
        }
    }

    pub fn integer_value(&self, name: &str, default: i64) -> i64 {
        self.value(name)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(default)
    }

    /// Merge `other` into `self`; existing entries are overwritten only
    /// when `overwrite` is set.
    pub fn merge(&mut self, other: &Config, overwrite: bool) {
        for (name, value) in &other.entries {
            if overwrite || !self.entries.contains_key(name) {
                self.entries.insert(name.clone(), value.clone());
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
