//! Workplace: the per-partition bounded pool of concurrent operators
//! (§4.8).
//!
//! Grounded in `original_source/src/workshop/Workplace.hxx`'s shape: a fixed
//! `max_operators` budget, an intrusive list of running operators, and two
//! derived PostgreSQL-array strings (`GetRunningPlanNames`/
//! `GetFullPlanNames`) that the workshop queue folds into its exclude filter
//! (§4.4). Process supervision itself (the `Operator`) is a distinct module
//! (§4.7); `Workplace` only does admission control, slot accounting, and
//! `PreparedChildProcess` construction.

use std::collections::HashMap;

use crate::array_codec;
use crate::plan::Plan;
use crate::spawn_service::PreparedChildProcess;

/// A job as read off the workshop queue, stripped to what `Workplace` needs
/// to start it (§4.4 step 3, §6 statement 3's row shape).
#[derive(Debug, Clone)]
pub struct WorkshopJob {
    pub id: String,
    pub plan_name: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
}

/// One slot occupied by a running operator.
#[derive(Debug, Clone)]
struct RunningSlot {
    plan_name: String,
}

/// Opaque handle identifying one running operator within a workplace.
pub type OperatorId = u64;

pub struct Workplace {
    node_name: String,
    max_operators: usize,
    next_id: OperatorId,
    running: HashMap<OperatorId, RunningSlot>,
}

impl Workplace {
    pub fn new(node_name: impl Into<String>, max_operators: usize) -> Self {
        Self {
            node_name: node_name.into(),
            max_operators,
            next_id: 0,
            running: HashMap::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.running.len() >= self.max_operators
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Distinct plan names currently running, as a Postgres array literal
    /// (§4.8's `GetRunningPlanNames`).
    pub fn running_plan_names(&self) -> String {
        let mut names: Vec<String> = self
            .running
            .values()
            .map(|slot| slot.plan_name.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        array_codec::encode(&names)
    }

    /// Plan names whose per-plan `concurrency` limit has been reached
    /// (§4.8's `GetFullPlanNames`; plans with `concurrency == 0` never
    /// participate, matching `Plan::concurrency`'s "unlimited" meaning).
    pub fn full_plan_names(&self, plans: &HashMap<String, std::sync::Arc<Plan>>) -> String {
        let mut running_counts: HashMap<&str, usize> = HashMap::new();
        for slot in self.running.values() {
            *running_counts.entry(slot.plan_name.as_str()).or_default() += 1;
        }

        let mut full: Vec<String> = running_counts
            .into_iter()
            .filter(|(name, count)| {
                plans
                    .get(*name)
                    .is_some_and(|plan| plan.concurrency > 0 && *count >= plan.concurrency as usize)
            })
            .map(|(name, _)| name.to_string())
            .collect();
        full.sort();
        array_codec::encode(&full)
    }

    /// Reserves a slot and builds the spawn request for `job` under `plan`
    /// (§4.8 steps 1-2). Returns `None` if the workplace is full.
    pub fn start(&mut self, job: &WorkshopJob, plan: &Plan) -> Option<(OperatorId, PreparedChildProcess)> {
        if self.is_full() {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.running.insert(id, RunningSlot { plan_name: job.plan_name.clone() });

        let argv = expand_placeholders(&build_argv(plan, job), &self.node_name, &job.id, &job.plan_name);
        let env = filter_env(&job.env);

        let request = PreparedChildProcess {
            argv,
            env,
            uid: plan.uid,
            gid: plan.gid,
            groups: plan.groups.clone(),
            chroot: plan.chroot.clone(),
            umask: plan.umask,
            priority: plan.priority,
            sched_idle: plan.sched_idle,
            ioprio_idle: plan.ioprio_idle,
            private_network: plan.private_network,
            private_tmp: plan.private_tmp,
            no_new_privs: true,
            cgroup_name: Some(job.plan_name.clone()),
            ..Default::default()
        };

        Some((id, request))
    }

    /// Frees the slot for `id` (§4.8's `OnExit`).
    pub fn on_exit(&mut self, id: OperatorId) {
        self.running.remove(&id);
    }
}

/// `plan.args ++ job.args` (§4.8 step 2).
fn build_argv(plan: &Plan, job: &WorkshopJob) -> Vec<String> {
    let mut argv = plan.args.clone();
    argv.extend(job.args.iter().cloned());
    argv
}

/// Expands `${0}`, `${NODE}`, `${JOB}`, `${PLAN}` in each argv element
/// (§4.8 step 2).
fn expand_placeholders(argv: &[String], node_name: &str, job_id: &str, plan_name: &str) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            arg.replace("${0}", argv.first().map(String::as_str).unwrap_or(""))
                .replace("${NODE}", node_name)
                .replace("${JOB}", job_id)
                .replace("${PLAN}", plan_name)
        })
        .collect()
}

/// Drops any job-supplied `LD_*` environment assignment (§4.8 step 2: "reject
/// entries starting with `LD_`").
fn filter_env(env: &[String]) -> Vec<String> {
    env.iter()
        .filter(|entry| !entry.starts_with("LD_"))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn plan(concurrency: u32) -> Plan {
        Plan {
            args: vec!["/bin/true".to_string()],
            timeout: "10 minutes".to_string(),
            parsed_timeout: Duration::from_secs(600),
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
            concurrency,
            rate_limits: Vec::new(),
            control_channel: false,
            allow_spawn: false,
        }
    }

    fn job(id: &str, plan_name: &str) -> WorkshopJob {
        WorkshopJob {
            id: id.to_string(),
            plan_name: plan_name.to_string(),
            args: vec!["${JOB}".to_string()],
            env: vec!["LD_PRELOAD=evil.so".to_string(), "FOO=bar".to_string()],
        }
    }

    #[test]
    fn start_rejects_ld_prefixed_env_and_expands_placeholders() {
        let mut workplace = Workplace::new("node-a", 10);
        let p = plan(0);
        let j = job("job-1", "build");
        let (_, request) = workplace.start(&j, &p).unwrap();

        assert_eq!(request.argv, vec!["/bin/true".to_string(), "job-1".to_string()]);
        assert_eq!(request.env, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn workplace_becomes_full_at_max_operators() {
        let mut workplace = Workplace::new("node-a", 1);
        let p = plan(0);
        assert!(workplace.start(&job("a", "build"), &p).is_some());
        assert!(workplace.start(&job("b", "build"), &p).is_none());
    }

    #[test]
    fn on_exit_frees_the_slot() {
        let mut workplace = Workplace::new("node-a", 1);
        let p = plan(0);
        let (id, _) = workplace.start(&job("a", "build"), &p).unwrap();
        assert!(workplace.is_full());
        workplace.on_exit(id);
        assert!(!workplace.is_full());
    }

    #[test]
    fn full_plan_names_only_counts_plans_with_nonzero_limit() {
        let mut workplace = Workplace::new("node-a", 10);
        let limited = plan(1);
        let unlimited = plan(0);
        let mut plans = HashMap::new();
        plans.insert("limited".to_string(), Arc::new(limited.clone()));
        plans.insert("unlimited".to_string(), Arc::new(unlimited.clone()));

        workplace.start(&job("a", "limited"), &limited).unwrap();
        workplace.start(&job("b", "unlimited"), &unlimited).unwrap();

        assert_eq!(workplace.full_plan_names(&plans), "{limited}");
        assert_eq!(workplace.running_plan_names(), "{limited,unlimited}");
    }
}
