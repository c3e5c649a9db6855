//! Workshop operator (§4.7): supervises one running job's progress, log
//! capture, timeout, CPU accounting, and control-channel RPC.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::control::channel::{self, ChannelCommand};
use crate::db::{workshop as db, QueueDb};
use crate::error::Result;
use crate::plan::Plan;

use super::{scan_progress_values, LogRingBuffer};

/// How a finished child's result should be written back (§4.7's exit
/// semantics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// `SetDone(exit_status, log)`.
    Done { exit_status: i32, log: String },
    /// `SetAgain(delay_seconds, log)`.
    Again { delay_seconds: u32, log: String },
}

/// The exact `waitpid`-style result the spawn service reports back (§4.7).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum WaitResult {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
}

/// Supervises one running workshop job.
pub struct Operator {
    job_id: String,
    plan: Arc<Plan>,
    last_progress: Option<u32>,
    log: LogRingBuffer,
    again_requested: Option<u32>,
    cpu_usage_start_microseconds: Option<u64>,
    /// `setenv K=V` assignments accumulated from the control channel,
    /// applied in `persist` (§4.7, §6 statement 6).
    pending_env: Vec<String>,
}

impl Operator {
    pub fn new(job_id: String, plan: Arc<Plan>, max_log: usize, cpu_usage_start_microseconds: Option<u64>) -> Self {
        Self {
            job_id,
            plan,
            last_progress: None,
            log: LogRingBuffer::new(max_log),
            again_requested: None,
            cpu_usage_start_microseconds,
            pending_env: Vec::new(),
        }
    }

    /// Feeds a chunk of captured stdout/stderr into the log buffer, and, for
    /// plans without a control channel, updates progress from it (§4.7's
    /// "legacy path"). Returns every value that represents a change from the
    /// last reported progress, in the order they appear in `chunk` (§8
    /// property 8, §B.2's update-on-change rule).
    pub fn on_output(&mut self, chunk: &[u8]) -> Vec<u32> {
        self.log.append(chunk);
        if self.plan.control_channel {
            return Vec::new();
        }
        let text = String::from_utf8_lossy(chunk);
        let mut updates = Vec::new();
        for candidate in scan_progress_values(&text).into_iter().filter(|&v| v <= 100) {
            if self.last_progress == Some(candidate) {
                continue;
            }
            self.last_progress = Some(candidate);
            updates.push(candidate);
        }
        updates
    }

    /// Dispatches one control-channel datagram (§4.7's RPC table). Returns
    /// the reply payload to write back, if any.
    pub fn on_control_datagram(&mut self, payload: &str) -> Result<Option<String>> {
        let command = match channel::parse(payload) {
            Ok(command) => command,
            Err(error) => return Ok(Some(channel::error_reply(&error.to_string()))),
        };

        match command {
            ChannelCommand::Progress(value) => {
                self.last_progress = Some(value);
                Ok(None)
            }
            ChannelCommand::SetEnv(assignment) => {
                self.pending_env.push(assignment);
                Ok(None)
            }
            ChannelCommand::Again(delay) => {
                self.again_requested = Some(delay);
                Ok(None)
            }
            ChannelCommand::Version => Ok(Some(channel::version_reply(env!("CARGO_PKG_VERSION")))),
            ChannelCommand::Spawn { .. } if !(self.plan.control_channel && self.plan.allow_spawn) => {
                Ok(Some(channel::error_reply("spawn not permitted for this plan")))
            }
            ChannelCommand::Spawn { .. } => {
                // Delegating the actual spawn to the translation + spawn
                // service clients is out of scope for this unit; the
                // partition wires those in when constructing operators for
                // plans with allow_spawn set.
                Ok(Some(channel::error_reply("spawn not implemented in this operator")))
            }
        }
    }

    /// Computes the final result to write, given the spawn service's wait
    /// result (§4.7's exit semantics).
    pub fn finish(&self, wait_result: WaitResult) -> ExitOutcome {
        let log = self.log.as_log_string();
        if let Some(delay) = self.again_requested {
            return ExitOutcome::Again { delay_seconds: delay, log };
        }

        match wait_result {
            WaitResult::Exited(code) => ExitOutcome::Done { exit_status: code, log },
            WaitResult::Signaled { signal, core_dumped } => {
                let mut log = log;
                log.push_str(&format!("\n[killed by signal {signal}{}]", if core_dumped { ", core dumped" } else { "" }));
                ExitOutcome::Done { exit_status: -1, log }
            }
        }
    }

    /// `SetDone(-1, "Timeout")` on timer fire (§4.7's "Timeout" clause).
    pub fn on_timeout(&self) -> ExitOutcome {
        warn!(job = %self.job_id, plan = %self.plan.executable_path(), "job timed out");
        ExitOutcome::Done { exit_status: -1, log: "Timeout".to_string() }
    }

    pub fn timeout(&self) -> Duration {
        self.plan.parsed_timeout
    }

    /// Writes the result row and, if a cgroup usage reading is available,
    /// the CPU usage delta (§4.7's CPU accounting).
    pub async fn persist(&self, db_handle: &QueueDb, outcome: ExitOutcome, cpu_usage_end_microseconds: Option<u64>) -> Result<()> {
        match outcome {
            ExitOutcome::Done { exit_status, log } => {
                db::set_job_done(db_handle, &self.job_id, exit_status, &log).await?;
            }
            ExitOutcome::Again { delay_seconds, log } => {
                db::again_job(db_handle, &self.job_id, delay_seconds as i64, &log).await?;
            }
        }

        for assignment in &self.pending_env {
            db::set_env(db_handle, &self.job_id, assignment).await?;
        }

        if let (Some(start), Some(end)) = (self.cpu_usage_start_microseconds, cpu_usage_end_microseconds) {
            let delta = end.saturating_sub(start) as i64;
            db::add_job_cpu_usage(db_handle, &self.job_id, delta).await?;
        }

        info!(job = %self.job_id, "operator finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn plan(control_channel: bool, allow_spawn: bool) -> Arc<Plan> {
        Arc::new(Plan {
            args: vec!["/bin/true".to_string()],
            timeout: "10 minutes".to_string(),
            parsed_timeout: StdDuration::from_secs(600),
            reap_finished: None,
            chroot: None,
            uid: 65534,
            gid: 65534,
            groups: Vec::new(),
            umask: None,
            priority: 10,
            sched_idle: false,
            ioprio_idle: false,
            private_network: false,
            private_tmp: false,
            concurrency: 0,
            rate_limits: Vec::new(),
            control_channel,
            allow_spawn,
        })
    }

    #[test]
    fn legacy_progress_updates_only_on_change() {
        let mut op = Operator::new("job-1".to_string(), plan(false, false), 1024, None);
        assert_eq!(op.on_output(b"abc42xx"), vec![42]);
        assert_eq!(op.on_output(b"still 42 here"), Vec::<u32>::new());
        assert_eq!(op.on_output(b"now 99"), vec![99]);
    }

    #[test]
    fn control_channel_plans_ignore_stdout_progress() {
        let mut op = Operator::new("job-1".to_string(), plan(true, false), 1024, None);
        assert_eq!(op.on_output(b"42"), Vec::<u32>::new());
    }

    #[test]
    fn on_output_reports_every_value_in_one_chunk() {
        let mut op = Operator::new("job-1".to_string(), plan(false, false), 1024, None);
        assert_eq!(op.on_output(b"abc42xx99\nhello"), vec![42, 99]);
    }

    #[test]
    fn setenv_is_queued_and_applied_on_persist() {
        let mut op = Operator::new("job-1".to_string(), plan(false, false), 1024, None);
        op.on_control_datagram("setenv FOO=bar").unwrap();
        assert_eq!(op.pending_env, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn spawn_command_rejected_without_allow_spawn() {
        let mut op = Operator::new("job-1".to_string(), plan(true, false), 1024, None);
        let reply = op.on_control_datagram("spawn urn:x").unwrap();
        assert!(reply.unwrap().starts_with("error"));
    }

    #[test]
    fn version_command_echoes_version_prefix() {
        let mut op = Operator::new("job-1".to_string(), plan(false, false), 1024, None);
        let reply = op.on_control_datagram("version").unwrap().unwrap();
        assert!(reply.starts_with("version "));
    }

    #[test]
    fn again_command_overrides_exit_status_on_finish() {
        let mut op = Operator::new("job-1".to_string(), plan(false, false), 1024, None);
        op.on_control_datagram("again 30").unwrap();
        let outcome = op.finish(WaitResult::Exited(0));
        assert_eq!(outcome, ExitOutcome::Again { delay_seconds: 30, log: String::new() });
    }

    #[test]
    fn signaled_exit_is_recorded_as_minus_one() {
        let op = Operator::new("job-1".to_string(), plan(false, false), 1024, None);
        let outcome = op.finish(WaitResult::Signaled { signal: 9, core_dumped: false });
        match outcome {
            ExitOutcome::Done { exit_status, log } => {
                assert_eq!(exit_status, -1);
                assert!(log.contains("signal 9"));
            }
            _ => panic!("expected Done"),
        }
    }
}
