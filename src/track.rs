//! # Tracking Field Injection
//!
//! Before a message reaches the wire the runtime stamps it with
//! provenance fields (node, process id, user, connection id, publish
//! time, unique id, middleware info, and — on heartbeats — the active
//! subscription set and connection endpoint). Policy comes from two
//! sources: the connection-level tracking mask and a per-message
//! override; an explicit OFF on either side always wins.
//!
//! Fields added here are flagged as tracking fields so the exact set can
//! be removed again before the message is handed back to the caller on
//! the send path. On received messages they remain visible.

use crate::config::{keys, Config};
use crate::field::{Field, FieldValue};
use crate::message::Message;
use crate::template::{SPEC_2016, SPEC_2018, SPEC_2019};
use crate::util::format_time_now;

/// Three-state tracking switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tracking {
    #[default]
    Unset,
    On,
    Off,
}

impl Tracking {
    fn from_config(config: &Config, key: &str) -> Self {
        match config.value(key) {
            None => Tracking::Unset,
            Some(_) => {
                if config.boolean_value(key, true) {
                    Tracking::On
                } else {
                    Tracking::Off
                }
            }
        }
    }
}

/// Parsed tracking mask (one switch per injectable field).
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingDetails {
    pub all: Tracking,
    pub node: Tracking,
    pub process_id: Tracking,
    pub user_name: Tracking,
    pub connection_id: Tracking,
    pub publish_time: Tracking,
    pub unique_id: Tracking,
    pub mw_info: Tracking,
    pub active_subscriptions: Tracking,
    pub connection_endpoint: Tracking,
}

impl TrackingDetails {
    pub fn from_config(config: &Config) -> Self {
        Self {
            all: Tracking::from_config(config, keys::TRACKING),
            node: Tracking::from_config(config, keys::TRACKING_NODE),
            process_id: Tracking::from_config(config, keys::TRACKING_PROCESS_ID),
            user_name: Tracking::from_config(config, keys::TRACKING_USER_NAME),
            connection_id: Tracking::from_config(config, keys::TRACKING_CONNECTION_ID),
            publish_time: Tracking::from_config(config, keys::TRACKING_PUBLISH_TIME),
            unique_id: Tracking::from_config(config, keys::TRACKING_UNIQUE_ID),
            mw_info: Tracking::from_config(config, keys::TRACKING_MW_INFO),
            active_subscriptions: Tracking::from_config(
                config,
                keys::TRACKING_ACTIVE_SUBSCRIPTIONS,
            ),
            connection_endpoint: Tracking::from_config(
                config,
                keys::TRACKING_CONNECTION_ENDPOINT,
            ),
        }
    }

    /// Connection-level mask: tracking defaults to on when unconfigured.
    pub fn for_connection(config: &Config) -> Self {
        let mut details = Self::from_config(config);
        if details.all == Tracking::Unset {
            details.all = Tracking::On;
        }
        details
    }
}

/// Identity snapshot and version knobs used when stamping messages.
#[derive(Debug, Clone)]
pub(crate) struct TrackingInjector {
    pub details: TrackingDetails,
    pub host_name: String,
    pub user_lower: String,
    pub user_upper: String,
    pub process_id: u32,
    pub connection_ordinal: u32,
    pub conn_id: String,
    pub spec_version: u32,
    pub schema_level: u8,
    pub perf_logger_active: bool,
}

fn enabled(add_all: bool, conn: Tracking, msg: Tracking) -> bool {
    (add_all || conn == Tracking::On || msg == Tracking::On)
        && conn != Tracking::Off
        && msg != Tracking::Off
}

impl TrackingInjector {
    fn add_all(&self, msg_details: &TrackingDetails) -> bool {
        self.details.all == Tracking::On
            && (msg_details.all == Tracking::On || msg_details.all == Tracking::Unset)
    }

    /// Whether the message is a heartbeat eligible for the
    /// subscription-set and endpoint fields.
    fn is_heartbeat(&self, msg: &Message) -> bool {
        let subtype = if self.spec_version < SPEC_2019 {
            "C2CX-SUBTYPE"
        } else {
            "MESSAGE-SUBTYPE"
        };
        msg.string_value(subtype)
            .map(|v| v.eq_ignore_ascii_case("HB"))
            .unwrap_or(false)
    }

    fn endpoint_field_name(&self) -> &'static str {
        // 2018 C2MS-draft level 0 used a different spelling than the
        // official 2019 C2MS.
        if self.spec_version == SPEC_2018 && self.schema_level == 0 {
            "CONNECTION-ENDPOINT"
        } else {
            "MW-CONNECTION-ENDPOINT"
        }
    }

    fn stamp(msg: &mut Message, name: &str, value: impl Into<FieldValue>, header: bool) {
        if let Ok(field) = Field::new(name, value) {
            msg.add_field(field.with_header(header).with_tracking(true));
        }
    }

    /// Add the enabled subset of tracking fields to an outbound message.
    pub fn insert(
        &self,
        msg: &mut Message,
        counter: u32,
        mw_info: &str,
        endpoint: Option<&str>,
        active_subs: &[String],
    ) {
        let msg_details = TrackingDetails::from_config(msg.config());
        let add_all = self.add_all(&msg_details);
        let conn = &self.details;

        if enabled(add_all, conn.node, msg_details.node) {
            Self::stamp(msg, "NODE", self.host_name.clone(), true);
        }

        if enabled(add_all, conn.process_id, msg_details.process_id) {
            // PIDs beyond i16::MAX wrap via two's-complement under the
            // 2014/2016 specs; downstream consumers round-trip the raw
            // bits through U32 and rely on it.
            if self.spec_version <= SPEC_2016 {
                Self::stamp(msg, "PROCESS-ID", self.process_id as u16 as i16, true);
            } else {
                Self::stamp(msg, "PROCESS-ID", self.process_id, true);
            }
        }

        if enabled(add_all, conn.user_name, msg_details.user_name) {
            let user = if self.spec_version < SPEC_2018 {
                &self.user_lower
            } else {
                &self.user_upper
            };
            Self::stamp(msg, "USER-NAME", user.clone(), true);
        }

        if enabled(add_all, conn.connection_id, msg_details.connection_id) {
            Self::stamp(msg, "CONNECTION-ID", self.connection_ordinal, true);
        }

        if self.perf_logger_active
            || enabled(add_all, conn.publish_time, msg_details.publish_time)
        {
            Self::stamp(msg, "PUBLISH-TIME", format_time_now(), true);
        }

        if enabled(add_all, conn.unique_id, msg_details.unique_id) {
            Self::stamp(msg, "UNIQUE-ID", format!("{}_{}", self.conn_id, counter), true);
        }

        if enabled(add_all, conn.mw_info, msg_details.mw_info) {
            Self::stamp(msg, "MW-INFO", mw_info.to_string(), true);
        }

        // Subscription and endpoint fields only exist from the 2018 spec
        // onward, and only on heartbeat messages.
        if self.spec_version >= SPEC_2018 && self.is_heartbeat(msg) {
            if enabled(
                add_all,
                conn.active_subscriptions,
                msg_details.active_subscriptions,
            ) {
                Self::stamp(msg, "NUM-OF-SUBSCRIPTIONS", active_subs.len() as u16, false);
                for (n, pattern) in active_subs.iter().enumerate() {
                    Self::stamp(
                        msg,
                        &format!("SUBSCRIPTION.{}.SUBJECT-PATTERN", n + 1),
                        pattern.clone(),
                        false,
                    );
                }
            }

            if enabled(
                add_all,
                conn.connection_endpoint,
                msg_details.connection_endpoint,
            ) {
                let endpoint = endpoint.unwrap_or("unknown");
                Self::stamp(msg, self.endpoint_field_name(), endpoint.to_string(), false);
            }
        }
    }

    /// Remove exactly the set `insert` would have added under the same
    /// policy.
    pub fn remove(&self, msg: &mut Message) {
        let msg_details = TrackingDetails::from_config(msg.config());
        let add_all = self.add_all(&msg_details);
        let conn = &self.details;

        if enabled(add_all, conn.node, msg_details.node) {
            msg.clear_field("NODE");
        }
        if enabled(add_all, conn.process_id, msg_details.process_id) {
            msg.clear_field("PROCESS-ID");
        }
        if enabled(add_all, conn.user_name, msg_details.user_name) {
            msg.clear_field("USER-NAME");
        }
        if enabled(add_all, conn.connection_id, msg_details.connection_id) {
            msg.clear_field("CONNECTION-ID");
        }
        if self.perf_logger_active
            || enabled(add_all, conn.publish_time, msg_details.publish_time)
        {
            msg.clear_field("PUBLISH-TIME");
        }
        if enabled(add_all, conn.unique_id, msg_details.unique_id) {
            msg.clear_field("UNIQUE-ID");
        }
        if enabled(add_all, conn.mw_info, msg_details.mw_info) {
            msg.clear_field("MW-INFO");
        }

        if self.spec_version >= SPEC_2018 && self.is_heartbeat(msg) {
            if enabled(
                add_all,
                conn.active_subscriptions,
                msg_details.active_subscriptions,
            ) {
                if let Some(field) = msg.get_field("NUM-OF-SUBSCRIPTIONS") {
                    if let Ok(count) = field.i64_value() {
                        for n in 1..=count {
                            msg.clear_field(&format!("SUBSCRIPTION.{n}.SUBJECT-PATTERN"));
                        }
                    }
                    msg.clear_field("NUM-OF-SUBSCRIPTIONS");
                }
            }
            if enabled(
                add_all,
                conn.connection_endpoint,
                msg_details.connection_endpoint,
            ) {
                msg.clear_field(self.endpoint_field_name());
            }
        }
    }
}
