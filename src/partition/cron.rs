//! Cron partition: the scheduler and claim timers of §4.5, driving
//! `cronjobs` through `db::cron`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::config::{intervals, CronPartitionConfig};
use crate::db::{cron as db, QueueDb};
use crate::error::Result;
use crate::notify::email::{self, Notification, QmqpClient};
use crate::operator::cron_curl;
use crate::operator::cron_spawn::{self, CronSpawnOperator};
use crate::operator::workshop::WaitResult;
use crate::translation::{self, TranslationClient};

pub struct CronPartition {
    pub name: String,
    node_name: String,
    tag: Option<String>,
    db: QueueDb,
    scheduler_armed: AtomicBool,
    http_client: reqwest::Client,
    translation: Option<Arc<dyn TranslationClient>>,
    qmqp: Option<Arc<dyn QmqpClient>>,
    default_email_sender: String,
    max_log: usize,
}

impl CronPartition {
    pub async fn connect(
        node_name: &str,
        config: &CronPartitionConfig,
        translation: Option<Arc<dyn TranslationClient>>,
        qmqp: Option<Arc<dyn QmqpClient>>,
    ) -> Result<Self> {
        let db = QueueDb::connect(
            &config.database,
            config.database_schema.as_deref(),
            &["cronjobs_modified", "cronjobs_scheduled"],
        )
        .await?;

        Ok(Self {
            name: config.name.clone(),
            node_name: node_name.to_string(),
            tag: config.tag.clone(),
            db,
            scheduler_armed: AtomicBool::new(true),
            http_client: reqwest::Client::new(),
            translation,
            qmqp,
            default_email_sender: config.default_email_sender.clone().unwrap_or_else(|| "workshop@localhost".to_string()),
            max_log: 64 * 1024,
        })
    }

    pub async fn release_stale(&self) -> Result<()> {
        let released = db::release_stale(&self.db, &self.node_name).await?;
        if released > 0 {
            self.db.notify("cronjobs_modified").await?;
        }
        Ok(())
    }

    /// One scheduler pass (§4.5): fills in `next_run` for due-for-scheduling
    /// rows, batched at [`intervals::SCHEDULER_BATCH_LIMIT`]. Suspends
    /// itself (returns `false`) once a pass computes nothing, to be
    /// re-armed by the `cronjobs_modified` notification.
    pub async fn run_scheduler_once(&self) -> Result<bool> {
        if !self.scheduler_armed.load(Ordering::Relaxed) {
            return Ok(false);
        }

        let batch = db::select_scheduler_batch(&self.db, intervals::SCHEDULER_BATCH_LIMIT).await?;
        if batch.is_empty() {
            self.scheduler_armed.store(false, Ordering::Relaxed);
            return Ok(false);
        }

        for row in &batch {
            match db::recalculate_next_run(&self.db, row).await {
                Ok(_) => {}
                Err(error) => warn!(cronjob = row.id, %error, "failed to recalculate next_run"),
            }
        }

        self.db.notify("cronjobs_scheduled").await?;
        Ok(true)
    }

    pub fn rearm_scheduler(&self) {
        self.scheduler_armed.store(true, Ordering::Relaxed);
    }

    /// Sleep duration before the next scheduler wake, jittered by up to
    /// [`intervals::SCHEDULER_JITTER`] (§4.5).
    pub fn scheduler_jitter() -> Duration {
        jitter(intervals::SCHEDULER_JITTER)
    }

    /// Computes how long the claim timer should sleep: the earliest
    /// upcoming `next_run`, jittered by up to [`intervals::CLAIM_JITTER`]
    /// to break ties across nodes (§4.5), or [`intervals::QUEUE_MAX_SLEEP`]
    /// equivalent ceiling when nothing is pending.
    pub async fn claim_sleep(&self, now: chrono::NaiveDateTime) -> Result<Duration> {
        match db::earliest_pending(&self.db).await? {
            Some(next_run) if next_run > now => {
                let base = (next_run - now).to_std().unwrap_or(Duration::ZERO);
                Ok(base + jitter(intervals::CLAIM_JITTER))
            }
            Some(_) => Ok(Duration::ZERO),
            None => Ok(Duration::from_secs(24 * 3600)),
        }
    }

    /// Attempts to claim and start the next due job (§4.5's claim timer
    /// firing). Returns the claimed row, if any; the caller (the
    /// instance/spawn wiring) is responsible for actually executing it via
    /// [`crate::operator::cron_spawn`] or [`crate::operator::cron_curl`].
    pub async fn claim_next(&self) -> Result<Option<db::CronJobRow>> {
        let claimed = db::claim_next_pending(&self.db, &self.node_name).await?;
        if let Some(row) = &claimed {
            info!(cronjob = row.id, "claimed cron job");
        }
        Ok(claimed)
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Runs one claimed row to completion (§4.9): dispatches to the HTTP
    /// variant for `http(s)://` commands, otherwise the spawn variant,
    /// enforces the job's own timeout, writes the `cronresults` row, and
    /// fires the QMQP notification if `notification` validates.
    pub async fn run_claimed_job(&self, row: db::CronJobRow) {
        let start_time = chrono::Utc::now().naive_utc();
        let timeout = Duration::from_secs(row.timeout_seconds.max(0) as u64);

        let (exit_status, log) = if row.command.starts_with("http://") || row.command.starts_with("https://") {
            match tokio::time::timeout(intervals::CRON_HTTP_TIMEOUT, cron_curl::run(&self.http_client, &row.command)).await {
                Ok(result) => result,
                Err(_) => (-1, "Timeout".to_string()),
            }
        } else {
            self.run_spawn_variant(&row, start_time, timeout).await
        };

        if let Err(error) = db::finish(&self.db, row.id, start_time, Some(exit_status), &log).await {
            warn!(cronjob = row.id, %error, "failed to record cron result");
            return;
        }

        self.notify_result(&row, &log).await;
    }

    async fn run_spawn_variant(&self, row: &db::CronJobRow, start_time: chrono::NaiveDateTime, timeout: Duration) -> (i32, String) {
        let resolved_argv = if translation::is_translation_token(&row.command) {
            match &self.translation {
                Some(client) => match client.resolve(&row.command, row.translate_param.as_deref()).await {
                    Ok(translation) => Some(translation.argv),
                    Err(error) => {
                        warn!(cronjob = row.id, %error, "translation failed");
                        return (-1, format!("translation failed: {error}"));
                    }
                },
                None => return (-1, "no translation client configured".to_string()),
            }
        } else {
            None
        };
        let argv = cron_spawn::build_argv(&row.command, resolved_argv);

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.stdin(std::process::Stdio::null());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => return (-1, format!("failed to start: {error}")),
        };

        let mut operator = CronSpawnOperator::new(row.id, start_time, self.max_log);
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let wait = tokio::time::timeout(timeout, async {
            use tokio::io::AsyncReadExt;
            let mut out_buf = [0u8; 4096];
            let mut err_buf = [0u8; 4096];
            loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Ok(n) = async { stdout.as_mut().unwrap().read(&mut out_buf).await }, if stdout.is_some() => {
                        if n == 0 { stdout = None; } else { operator.on_output(&out_buf[..n]); }
                    }
                    Ok(n) = async { stderr.as_mut().unwrap().read(&mut err_buf).await }, if stderr.is_some() => {
                        if n == 0 { stderr = None; } else { operator.on_output(&err_buf[..n]); }
                    }
                }
            }
        })
        .await;

        let wait_result = match wait {
            Ok(Ok(status)) => status_to_wait_result(status),
            Ok(Err(error)) => {
                operator.on_output(format!("wait failed: {error}").as_bytes());
                WaitResult::Exited(-1)
            }
            Err(_) => {
                let _ = child.start_kill();
                operator.on_output(b"Timeout");
                WaitResult::Exited(-1)
            }
        };

        let exit_status = match wait_result {
            WaitResult::Exited(code) => code,
            WaitResult::Signaled { .. } => -1,
        };
        (exit_status, operator.log_string())
    }

    async fn notify_result(&self, row: &db::CronJobRow, log: &str) {
        let Some(address) = row.notification.as_deref().filter(|a| email::is_valid_email(a)) else { return };
        let Some(client) = &self.qmqp else { return };

        let subject = format!("cron job {} finished", row.id);
        let notification = Notification { to: address, from: &self.default_email_sender, subject: &subject, body: log };
        if let Err(error) = client.send(&notification).await {
            warn!(cronjob = row.id, %error, "failed to send cron notification");
        }
    }
}

fn status_to_wait_result(status: std::process::ExitStatus) -> WaitResult {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return WaitResult::Signaled { signal, core_dumped: status.core_dumped() };
        }
    }
    WaitResult::Exited(status.code().unwrap_or(-1))
}


/// Uniform jitter in `[0, window)` (§4.5's "randomized … 5-second and
/// 30-second windows").
fn jitter(window: Duration) -> Duration {
    if window.is_zero() {
        return window;
    }
    let micros = window.as_micros() as u64;
    Duration::from_micros(rand::thread_rng().gen_range(0..micros))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_bounded_by_window() {
        for _ in 0..50 {
            let d = jitter(Duration::from_secs(5));
            assert!(d < Duration::from_secs(5));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
