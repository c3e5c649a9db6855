//! Workshop partition: owns one `QueueDb`, plan library, workplace, and
//! rate limiter, and drives the queue-run algorithm of §4.4.
//!
//! Grounded in `original_source/src/workshop/Workplace.cxx`'s run loop
//! shape (expire → select → claim-or-skip → reschedule) and
//! `PGQueue.cxx`'s statement set (`db::workshop`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::array_codec;
use crate::config::{intervals, WorkshopPartitionConfig};
use crate::db::{workshop as db, QueueDb};
use crate::error::Result;
use crate::library::MultiLibrary;
use crate::operator::workshop::{ExitOutcome, Operator, WaitResult};
use crate::plan::Plan;
use crate::ratelimiter::RateLimiter;
use crate::spawn_service::SpawnService;
use crate::workplace::{OperatorId, WorkshopJob, Workplace};

/// How a started job's watcher task reports back to the owning partition
/// (§4.7: the spawn service's wait result drives `finish`/`on_timeout`).
enum CompletionKind {
    Exited(WaitResult),
    TimedOut,
    WaitFailed(String),
}

struct OperatorCompletion {
    operator_id: OperatorId,
    kind: CompletionKind,
    cpu_usage_end_microseconds: Option<u64>,
}

/// Whether the queue is permitted to run, per §4.4's three independent
/// gates (state-directory / admin / fullness). Fullness is read off
/// `Workplace` directly rather than cached here.
#[derive(Debug, Clone, Copy)]
struct EnableState {
    by_state_directory: bool,
    by_admin: bool,
}

impl Default for EnableState {
    fn default() -> Self {
        Self { by_state_directory: true, by_admin: true }
    }
}

pub struct WorkshopPartition {
    pub name: String,
    node_name: String,
    tag: Option<String>,
    db: QueueDb,
    library: MultiLibrary,
    workplace: Workplace,
    rate_limiter: RateLimiter,
    spawn_service: Arc<dyn SpawnService>,
    operators: HashMap<OperatorId, Operator>,
    max_log: usize,
    next_expire_check: Instant,
    next_reap_check: Instant,
    enabled: EnableState,
    running: bool,
    interrupt: bool,
    completion_tx: mpsc::UnboundedSender<OperatorCompletion>,
    completion_rx: mpsc::UnboundedReceiver<OperatorCompletion>,
}

impl WorkshopPartition {
    pub async fn connect(
        node_name: &str,
        config: &WorkshopPartitionConfig,
        spawn_service: Arc<dyn SpawnService>,
    ) -> Result<Self> {
        let db = QueueDb::connect(&config.database, config.database_schema.as_deref(), &["new_job"]).await?;
        let library = MultiLibrary::new(config.plan_directories.clone());
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        Ok(Self {
            name: config.name.clone(),
            node_name: node_name.to_string(),
            tag: config.tag.clone(),
            db,
            library,
            workplace: Workplace::new(node_name, config.concurrency),
            rate_limiter: RateLimiter::new(),
            spawn_service,
            operators: HashMap::new(),
            max_log: config.max_log,
            next_expire_check: Instant::now(),
            next_reap_check: Instant::now(),
            enabled: EnableState::default(),
            running: false,
            interrupt: false,
            completion_tx,
            completion_rx,
        })
    }

    /// Startup release of anything this node still claims (§6 statement 1),
    /// run once before the first queue pass.
    pub async fn release_stale(&self) -> Result<()> {
        let released = db::release_jobs(&self.db, &self.node_name).await?;
        if released > 0 {
            self.db.notify("new_job").await?;
        }
        Ok(())
    }

    pub fn set_admin_enabled(&mut self, enabled: bool) {
        self.enabled.by_admin = enabled;
    }

    fn is_enabled(&self) -> bool {
        self.enabled.by_state_directory && self.enabled.by_admin && !self.workplace.is_full()
    }

    /// Builds the current `(include, exclude, lowprio)` array-literal
    /// filter (§4.4). `lowprio` is always empty: nothing upstream of this
    /// partition designates a plan as low-priority (see DESIGN.md), so
    /// step 4's low-priority re-query never triggers.
    async fn compute_filters(&mut self, now: Instant) -> (String, String, HashMap<String, Arc<Plan>>) {
        let names = self.library.available_names(now);
        let mut plans = HashMap::new();
        for name in &names {
            if let Some(plan) = self.library.get(now, name).await {
                plans.insert(name.clone(), plan);
            }
        }

        let include = array_codec::encode(&names);

        let mut excluded: Vec<String> = self.rate_limiter.muted_plans(now);
        let full = self.workplace.full_plan_names(&plans);
        for name in array_codec::decode(&full).unwrap_or_default() {
            if !excluded.contains(&name) {
                excluded.push(name);
            }
        }
        excluded.sort();
        let exclude = array_codec::encode(&excluded);

        (include, exclude, plans)
    }

    /// Runs one pass of the queue algorithm (§4.4 steps 1-5). Returns how
    /// long to sleep before the next pass.
    pub async fn run_once(&mut self, now: Instant) -> Result<Duration> {
        if self.running {
            self.interrupt = true;
            return Ok(Duration::ZERO);
        }
        self.running = true;
        self.interrupt = false;
        let result = self.run_once_inner(now).await;
        self.running = false;
        result
    }

    async fn run_once_inner(&mut self, now: Instant) -> Result<Duration> {
        self.drain_completions().await?;

        self.library.update(now, false).await;

        if now >= self.next_expire_check {
            let expired = db::expire_jobs(&self.db, &self.node_name).await?;
            if expired > 0 {
                self.db.notify("new_job").await?;
            }
            self.next_expire_check = now + intervals::EXPIRE_CHECK;
        }

        let (include, exclude, plans) = self.compute_filters(now).await;

        if now >= self.next_reap_check {
            self.reap_finished(&plans).await?;
            self.next_reap_check = now + intervals::EXPIRE_CHECK;
        }

        if !self.is_enabled() {
            return Ok(intervals::QUEUE_MAX_SLEEP);
        }

        let lowprio = "{}".to_string();

        let rows = db::select_new_jobs(&self.db, &include, &exclude, &lowprio, intervals::QUEUE_BATCH_LIMIT).await?;
        let hit_limit = rows.len() as i64 == intervals::QUEUE_BATCH_LIMIT;

        for row in rows {
            if self.workplace.is_full() {
                break;
            }

            let Some(plan) = plans.get(&row.plan_name).cloned() else { continue };

            if self.rate_limiter.check(&self.db, now, &row.plan_name, &plan.rate_limits).await? {
                continue;
            }

            let timeout_seconds = plan.parsed_timeout.as_secs() as i64;
            if !db::claim_job(&self.db, &row.id, &self.node_name, timeout_seconds).await? {
                continue;
            }

            let job = WorkshopJob { id: row.id.clone(), plan_name: row.plan_name.clone(), args: row.args, env: row.env };
            match self.workplace.start(&job, &plan) {
                Some((operator_id, request)) => match self.spawn_service.spawn(request).await {
                    Ok(spawned) => {
                        let operator = Operator::new(job.id.clone(), plan.clone(), self.max_log, None);
                        self.operators.insert(operator_id, operator);
                        info!(job = %job.id, plan = %job.plan_name, "started job");
                        self.spawn_watcher(operator_id, plan.parsed_timeout, spawned.pid, spawned.pidfd, spawned.cgroup_fd);
                    }
                    Err(error) => {
                        warn!(job = %job.id, %error, "spawn failed");
                        self.workplace.on_exit(operator_id);
                        db::set_job_done(&self.db, &job.id, -1, &error.to_string()).await?;
                    }
                },
                None => {
                    db::rollback_job(&self.db, &job.id).await?;
                }
            }
        }

        if hit_limit {
            return Ok(Duration::from_secs(1));
        }
        if self.interrupt {
            return Ok(Duration::ZERO);
        }

        match db::next_scheduled_job(&self.db, &include).await? {
            Some(seconds) if seconds > 0 => Ok(Duration::from_secs(seconds as u64).min(intervals::QUEUE_MAX_SLEEP)),
            Some(_) => Ok(Duration::ZERO),
            None => Ok(intervals::QUEUE_MAX_SLEEP),
        }
    }

    /// Spawns the task that waits for one started job to exit and reports
    /// back over `completion_tx`, so its result reaches a terminal row
    /// state without blocking this partition's own queue pass (§4.7,
    /// mirroring `CronPartition::run_claimed_job`'s drive loop).
    fn spawn_watcher(&self, operator_id: OperatorId, timeout: Duration, pid: u32, pidfd: i32, cgroup_fd: Option<i32>) {
        let spawn_service = self.spawn_service.clone();
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let kind = match tokio::time::timeout(timeout, spawn_service.wait(pid, pidfd)).await {
                Ok(Ok(wait_result)) => CompletionKind::Exited(wait_result),
                Ok(Err(error)) => CompletionKind::WaitFailed(error.to_string()),
                Err(_) => {
                    if let Err(error) = spawn_service.kill(pid, pidfd).await {
                        warn!(%error, "failed to kill timed-out job");
                    }
                    CompletionKind::TimedOut
                }
            };
            let cpu_usage_end_microseconds = match cgroup_fd {
                Some(fd) => spawn_service.read_cpu_usage_microseconds(fd).await.ok(),
                None => None,
            };
            let _ = completion_tx.send(OperatorCompletion { operator_id, kind, cpu_usage_end_microseconds });
        });
    }

    /// Drains every watcher-reported completion and persists its result
    /// (§4.7's exit semantics, §4.8's `OnExit`).
    async fn drain_completions(&mut self) -> Result<()> {
        while let Ok(completion) = self.completion_rx.try_recv() {
            let Some(operator) = self.operators.get(&completion.operator_id) else { continue };

            let outcome = match completion.kind {
                CompletionKind::Exited(wait_result) => operator.finish(wait_result),
                CompletionKind::TimedOut => operator.on_timeout(),
                CompletionKind::WaitFailed(error) => {
                    warn!(%error, "spawn service wait failed");
                    ExitOutcome::Done { exit_status: -1, log: format!("wait failed: {error}") }
                }
            };

            operator.persist(&self.db, outcome, completion.cpu_usage_end_microseconds).await?;
            self.on_operator_exit(completion.operator_id);
        }
        Ok(())
    }

    /// Per-plan `reap_finished` sweep (§A.5, §6 statement 10): deletes
    /// finished rows older than each plan's configured age, analogous to
    /// the node-wide expiry sweep above.
    async fn reap_finished(&self, plans: &HashMap<String, Arc<Plan>>) -> Result<()> {
        for (name, plan) in plans {
            let Some(reap_finished) = plan.reap_finished else { continue };
            let reaped = db::reap_finished_jobs(&self.db, name, reap_finished.as_secs() as i64).await?;
            if reaped > 0 {
                info!(plan = %name, count = reaped, "reaped finished jobs");
            }
        }
        Ok(())
    }

    /// Removes a finished operator's slot (§4.8's `OnExit`).
    pub fn on_operator_exit(&mut self, operator_id: OperatorId) {
        self.workplace.on_exit(operator_id);
        self.operators.remove(&operator_id);
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_state_defaults_to_both_enabled() {
        let state = EnableState::default();
        assert!(state.by_state_directory && state.by_admin);
    }
}
