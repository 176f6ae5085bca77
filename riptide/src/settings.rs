use crate::retry::{Delay, RetryPolicy};
use brine::message::feature;
use std::time::Duration;

/// Everything tunable about a client, with defaults fit for a production
/// bucket. Timeouts are independent per operation family, per the protocol's
/// repair model.
#[derive(Clone)]
pub struct ClientSettings {
    pub bucket: String,
    pub username: String,
    pub password: String,
    /// User-visible part of the DCP connection name.
    pub connection_name: String,
    /// Server-side flow control window, sent as `connection_buffer_size`.
    pub connection_buffer_size: u32,
    /// Acknowledge once unacked credit crosses this share of the window.
    pub ack_watermark_percent: u8,
    pub enable_noop: bool,
    pub noop_interval: Duration,
    /// Optional `set_priority` control value ("low" / "medium" / "high").
    pub priority: Option<String>,
    /// TCP connect plus per-response handshake budget.
    pub connect_timeout: Duration,
    /// Seqno and failover-log query budget.
    pub query_timeout: Duration,
    /// Graceful stream-close drain budget.
    pub close_timeout: Duration,
    /// No inbound traffic for this long marks the producer dead.
    pub dead_connection_interval: Duration,
    /// Feature codes offered in HELO.
    pub desired_features: Vec<u16>,
    pub connect_policy: RetryPolicy,
    pub config_policy: RetryPolicy,
    /// Budget for repairing a partition after a drop or stream failure.
    pub repair_policy: RetryPolicy,
    /// Budget for re-issuing a stream request the server answered TMPFAIL.
    pub stream_policy: RetryPolicy,
}

impl ClientSettings {
    pub fn new<S: Into<String>>(bucket: S, username: S, password: S) -> ClientSettings {
        let transient_only =
            |policy: RetryPolicy| policy.with_interrupt(|error| !error.is_transient());

        ClientSettings {
            bucket: bucket.into(),
            username: username.into(),
            password: password.into(),
            connection_name: "riptide".to_string(),
            connection_buffer_size: 20 * 1024 * 1024,
            ack_watermark_percent: 20,
            enable_noop: true,
            noop_interval: Duration::from_secs(120),
            priority: None,
            connect_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(10),
            dead_connection_interval: Duration::from_secs(300),
            desired_features: vec![
                feature::DATATYPE,
                feature::MUTATION_SEQNO,
                feature::XERROR,
                feature::SELECT_BUCKET,
            ],
            connect_policy: transient_only(RetryPolicy::new(
                5,
                Delay::Exponential {
                    base: Duration::from_millis(100),
                    cap: Duration::from_secs(5),
                },
            )),
            config_policy: transient_only(RetryPolicy::new(
                5,
                Delay::Exponential {
                    base: Duration::from_millis(100),
                    cap: Duration::from_secs(5),
                },
            )),
            repair_policy: transient_only(RetryPolicy::new(
                8,
                Delay::Exponential {
                    base: Duration::from_millis(100),
                    cap: Duration::from_secs(10),
                },
            )),
            stream_policy: RetryPolicy::new(5, Delay::Fixed(Duration::from_millis(500))),
        }
    }

    pub fn with_connection_name<S: Into<String>>(mut self, name: S) -> ClientSettings {
        self.connection_name = name.into();
        self
    }

    pub fn with_buffer_size(mut self, bytes: u32) -> ClientSettings {
        self.connection_buffer_size = bytes;
        self
    }

    pub fn with_noop(mut self, enabled: bool, interval: Duration) -> ClientSettings {
        self.enable_noop = enabled;
        self.noop_interval = interval;
        self
    }

    pub fn with_priority<S: Into<String>>(mut self, priority: S) -> ClientSettings {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> ClientSettings {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> ClientSettings {
        self.query_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> ClientSettings {
        self.close_timeout = timeout;
        self
    }

    pub fn with_dead_connection_interval(mut self, interval: Duration) -> ClientSettings {
        self.dead_connection_interval = interval;
        self
    }

    pub fn with_connect_policy(mut self, policy: RetryPolicy) -> ClientSettings {
        self.connect_policy = policy;
        self
    }

    pub fn with_config_policy(mut self, policy: RetryPolicy) -> ClientSettings {
        self.config_policy = policy;
        self
    }

    pub fn with_repair_policy(mut self, policy: RetryPolicy) -> ClientSettings {
        self.repair_policy = policy;
        self
    }

    /// Credit threshold that triggers a buffer acknowledgement.
    #[inline]
    pub fn ack_watermark(&self) -> u64 {
        u64::from(self.connection_buffer_size) * u64::from(self.ack_watermark_percent) / 100
    }
}
