//! Configuration structs the rest of the system is constructed from.
//!
//! Parsing these from a config file or the command line is explicitly out of
//! scope (§1); this module only defines the typed shape the caller is
//! expected to populate, mirroring `original_source/src/Config.hxx`'s
//! section layout (one `WorkshopPartitionConfig`/`CronPartitionConfig` per
//! `[partition]`/`[cron]` section).

use std::path::PathBuf;
use std::time::Duration;

/// Top-level daemon configuration: one node identity plus any number of
/// workshop and cron partitions.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's name, used as `node_name` in claim/release SQL (§3).
    pub node_name: String,

    /// Workshop partitions (database + plan library + workplace triples).
    pub partitions: Vec<WorkshopPartitionConfig>,

    /// Cron partitions.
    pub cron_partitions: Vec<CronPartitionConfig>,

    /// Control UDP listener configuration.
    pub control: ControlConfig,
}

/// One workshop partition's configuration (§4.2's "Partition").
#[derive(Debug, Clone)]
pub struct WorkshopPartitionConfig {
    pub name: String,
    /// PostgreSQL connection string.
    pub database: String,
    /// Optional schema; when set, notifications are also listened for on
    /// `"<schema>:new_job"` per §6.
    pub database_schema: Option<String>,
    /// Plan library directories, first-match-wins (MultiLibrary, §4.2).
    pub plan_directories: Vec<PathBuf>,
    /// Maximum simultaneous operators in this partition's workplace (§4.8).
    pub concurrency: usize,
    /// Maximum bytes retained in an operator's log ring buffer (§4.7).
    pub max_log: usize,
    /// Forward captured stderr lines to the systemd journal in addition to
    /// the `log` column (§4.7, §A.5).
    pub enable_journal: bool,
    /// Optional tag used by the `TERMINATE_CHILDREN` control command's
    /// matching (§6).
    pub tag: Option<String>,
}

impl Default for WorkshopPartitionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            database: String::new(),
            database_schema: None,
            plan_directories: Vec::new(),
            concurrency: 10,
            max_log: 64 * 1024,
            enable_journal: false,
            tag: None,
        }
    }
}

/// One cron partition's configuration (§4.5).
#[derive(Debug, Clone)]
pub struct CronPartitionConfig {
    pub name: String,
    pub database: String,
    pub database_schema: Option<String>,
    pub concurrency: usize,
    /// QMQP relay address for notification email (§4.9, §A.5).
    pub qmqp_server: Option<String>,
    pub default_email_sender: Option<String>,
    /// Pond log-forwarding address (§A.5); interface-only.
    pub pond_server: Option<String>,
    pub tag: Option<String>,
}

impl Default for CronPartitionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            database: String::new(),
            database_schema: None,
            concurrency: 10,
            qmqp_server: None,
            default_email_sender: None,
            pond_server: None,
            tag: None,
        }
    }
}

/// Control-protocol listener configuration (§6).
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub bind_address: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5484".to_string(),
        }
    }
}

/// Fixed intervals the spec pins numerically (§4.2, §4.4, §4.5). Kept as
/// named constants rather than configuration because the spec does not make
/// them tunable.
pub mod intervals {
    use super::Duration;

    /// Library directory revisit cooldown (§4.2).
    pub const LIBRARY_REVISIT: Duration = Duration::from_secs(60);
    /// Disable cooldown after a missing file/executable (§4.2).
    pub const DISABLE_MISSING: Duration = Duration::from_secs(60);
    /// Disable cooldown after a plan parse failure (§4.2).
    pub const DISABLE_PARSE_FAILURE: Duration = Duration::from_secs(600);
    /// Workshop queue expiry sweep interval (§4.4).
    pub const EXPIRE_CHECK: Duration = Duration::from_secs(60);
    /// Workshop queue batch size cap (§4.4).
    pub const QUEUE_BATCH_LIMIT: i64 = 16;
    /// Workshop queue wake-up cap when waiting on a future `scheduled_time` (§4.4).
    pub const QUEUE_MAX_SLEEP: Duration = Duration::from_secs(600);
    /// Scheduler timer jitter window (§4.5).
    pub const SCHEDULER_JITTER: Duration = Duration::from_secs(5);
    /// Claim timer jitter window (§4.5).
    pub const CLAIM_JITTER: Duration = Duration::from_secs(30);
    /// Cron-scheduler batch size (§4.5).
    pub const SCHEDULER_BATCH_LIMIT: i64 = 1000;
    /// Fixed DB reconnect backoff (§4.3).
    pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
    /// Hard cap for the HTTP cron operator variant (§4.9).
    pub const CRON_HTTP_TIMEOUT: Duration = Duration::from_secs(300);
    /// Max response body captured from an HTTP cron job (§4.9).
    pub const CRON_HTTP_LOG_CAP: usize = 8 * 1024;
}
