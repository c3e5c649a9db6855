//! Line-oriented log forwarding (§A.5): syslog, the systemd journal, and
//! Pond are three wire protocols this crate does not implement, but all
//! three consume the same shape — one captured output line, tagged with the
//! job's plan and id. Modeled as one trait so the operator's log-capture
//! path (§4.7) stays oblivious to which sink (if any) is configured.

use async_trait::async_trait;

use crate::error::Result;

/// Identifies the job a forwarded line belongs to, for the
/// `WORKSHOP_PLAN`/`WORKSHOP_JOB` journal fields (§4.7) and equivalent
/// syslog/Pond structured fields.
#[derive(Debug, Clone)]
pub struct LineContext<'a> {
    pub plan_name: &'a str,
    pub job_id: &'a str,
}

#[async_trait]
pub trait LineSink: Send + Sync {
    async fn send_line(&self, context: &LineContext<'_>, line: &str) -> Result<()>;
}

/// A sink that discards everything; the default when no forwarding target
/// is configured.
pub struct NullSink;

#[async_trait]
impl LineSink for NullSink {
    async fn send_line(&self, _context: &LineContext<'_>, _line: &str) -> Result<()> {
        Ok(())
    }
}
