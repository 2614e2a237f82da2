//! Transport and scheduler configuration.
//!
//! Both config structs follow the same shape: `Default` gives the values a
//! container normally runs with, `with_*` builders override single fields,
//! and [`TransportConfig::from_env`] layers environment overrides on top.

use crate::error::{Error, Result};

/// Default size of a shared-memory endpoint (3 MiB).
pub const DEFAULT_SMB_SIZE: u64 = 3 * 1024 * 1024;

/// Default number of spin rounds a control-plane mailbox request may take.
pub const DEFAULT_RETRY_COUNT: u32 = 128;

/// Number of mailboxes (and therefore endpoints) per protocol.
pub const MAX_SYSTEM_SMBS: u16 = 20;

/// Default bound on scheduler passes per `Container::run` call.
pub const MAX_RUNS_PER_CALL: u32 = 10;

/// Environment variable overriding [`TransportConfig::smb_size`].
pub const ENV_SMB_SIZE: &str = "CONDUIT_SMB_SIZE";
/// Environment variable overriding [`TransportConfig::first_mailbox`].
pub const ENV_TRANSFER_MAILBOX: &str = "CONDUIT_TRANSFER_MAILBOX";
/// Environment variable overriding [`TransportConfig::max_mailbox`].
pub const ENV_MAX_MAILBOX: &str = "CONDUIT_MAX_MAILBOX";

/// Configuration of the transfer layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Size of endpoints allocated with [`crate::transfer::TransportContext::allocate_endpoint`].
    pub smb_size: u64,
    /// Spin rounds allowed for a mailbox request before it is reported failed.
    pub retry_count: u32,
    /// First mailbox number handed out by endpoint allocation.
    pub first_mailbox: u16,
    /// Number of mailboxes per protocol (mailboxes are `0..max_mailbox`).
    pub max_mailbox: u16,
    /// Maximum number of advanced-but-unsent buffers a single output port may queue.
    pub queue_depth_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            smb_size: DEFAULT_SMB_SIZE,
            retry_count: DEFAULT_RETRY_COUNT,
            first_mailbox: 1,
            max_mailbox: MAX_SYSTEM_SMBS,
            queue_depth_limit: 32,
        }
    }
}

impl TransportConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set but does not parse,
    /// or if the resulting mailbox range is empty.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup function.
    ///
    /// Split out from [`from_env`](Self::from_env) so callers can layer values
    /// from their own configuration source.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_SMB_SIZE) {
            self.smb_size = parse_var(ENV_SMB_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_TRANSFER_MAILBOX) {
            self.first_mailbox = parse_var(ENV_TRANSFER_MAILBOX, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_MAILBOX) {
            self.max_mailbox = parse_var(ENV_MAX_MAILBOX, &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.smb_size == 0 {
            return Err(Error::InvalidConfig("smb_size must be non-zero".into()));
        }
        if self.first_mailbox >= self.max_mailbox {
            return Err(Error::InvalidConfig(format!(
                "first mailbox {} must be below max mailbox {}",
                self.first_mailbox, self.max_mailbox
            )));
        }
        if self.retry_count == 0 {
            return Err(Error::InvalidConfig("retry_count must be non-zero".into()));
        }
        Ok(())
    }

    /// Set the endpoint size.
    pub fn with_smb_size(mut self, size: u64) -> Self {
        self.smb_size = size;
        self
    }

    /// Set the mailbox retry count.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Set the first mailbox number.
    pub fn with_first_mailbox(mut self, mailbox: u16) -> Self {
        self.first_mailbox = mailbox;
        self
    }

    /// Set the number of mailboxes per protocol.
    pub fn with_max_mailbox(mut self, max: u16) -> Self {
        self.max_mailbox = max;
        self
    }

    /// Set the per-port queue depth limit.
    pub fn with_queue_depth_limit(mut self, depth: usize) -> Self {
        self.queue_depth_limit = depth;
        self
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{key}={value:?} is not a valid number")))
}

/// Configuration of a container's scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Bound on scheduler passes per `run` call.
    pub max_runs_per_call: u32,
    /// Whether the transport is dispatched before every worker, not only once per call.
    pub dispatch_per_worker: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_runs_per_call: MAX_RUNS_PER_CALL,
            dispatch_per_worker: true,
        }
    }
}

impl SchedulerConfig {
    /// Set the pass bound. Zero is treated as one.
    pub fn with_max_runs_per_call(mut self, max: u32) -> Self {
        self.max_runs_per_call = max.max(1);
        self
    }

    /// Enable or disable per-worker dispatch.
    pub fn with_dispatch_per_worker(mut self, enabled: bool) -> Self {
        self.dispatch_per_worker = enabled;
        self
    }
}
