//! Cron "spawn" operator variant (§4.9): same lifecycle as the workshop
//! operator, but the log captures combined stdout+stderr and the result
//! lands in `cronresults` rather than `jobs`.

use chrono::NaiveDateTime;

use crate::db::cron as db;
use crate::db::QueueDb;
use crate::error::Result;
use crate::translation::is_translation_token;

use super::LogRingBuffer;
use super::workshop::WaitResult;

/// Builds the argv for a cron "spawn" job: `urn:` commands are resolved via
/// the translation client by the caller and passed in as `resolved_argv`;
/// everything else runs through `/bin/sh -c` (§4.9).
pub fn build_argv(command: &str, resolved_argv: Option<Vec<String>>) -> Vec<String> {
    if is_translation_token(command) {
        resolved_argv.unwrap_or_default()
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()]
    }
}

pub struct CronSpawnOperator {
    job_id: i64,
    start_time: NaiveDateTime,
    log: LogRingBuffer,
}

impl CronSpawnOperator {
    pub fn new(job_id: i64, start_time: NaiveDateTime, max_log: usize) -> Self {
        Self { job_id, start_time, log: LogRingBuffer::new(max_log) }
    }

    pub fn on_output(&mut self, chunk: &[u8]) {
        self.log.append(chunk);
    }

    pub fn log_string(&self) -> String {
        self.log.as_log_string()
    }

    fn exit_status(wait_result: WaitResult) -> i32 {
        match wait_result {
            WaitResult::Exited(code) => code,
            WaitResult::Signaled { .. } => -1,
        }
    }

    pub async fn finish(&self, db_handle: &QueueDb, wait_result: WaitResult) -> Result<String> {
        let log = self.log.as_log_string();
        let exit_status = Self::exit_status(wait_result);
        db::finish(db_handle, self.job_id, self.start_time, Some(exit_status), &log).await?;
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urn_command_uses_resolved_argv() {
        let argv = build_argv("urn:example:job", Some(vec!["/opt/job".to_string(), "--flag".to_string()]));
        assert_eq!(argv, vec!["/opt/job".to_string(), "--flag".to_string()]);
    }

    #[test]
    fn plain_command_runs_through_shell() {
        let argv = build_argv("echo hello", None);
        assert_eq!(argv, vec!["/bin/sh".to_string(), "-c".to_string(), "echo hello".to_string()]);
    }
}
