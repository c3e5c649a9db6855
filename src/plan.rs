//! Plan file grammar and in-memory plan representation (§3, §6).
//!
//! A plan describes how to run one kind of job: the executable plus its
//! fixed arguments, and the sandboxing/scheduling parameters applied to
//! every run. Grounded in `original_source/src/workshop/Plan.hxx` (field
//! set) and `PlanLoader.cxx` (line grammar); `rlimits`/uid/gid/chroot/etc
//! are carried as data only — the actual privilege-dropping mechanics are
//! delegated to the external spawn service (§1 Non-goals).

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, PlanError};

/// A single `rate_limit` plan directive: at most `count` runs per `period`
/// (§4.4, §8 property 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub count: u32,
    pub period: Duration,
}

/// How a job's output is delivered and accounted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// `args[0]` is the executable path, the rest are fixed arguments
    /// prepended to whatever the job row supplies.
    pub args: Vec<String>,

    /// Raw `timeout` string as written in the plan file (kept for display);
    /// `parsed_timeout` is what's actually enforced.
    pub timeout: String,
    pub parsed_timeout: Duration,

    /// Raw `reap_finished` interval string, if the plan auto-deletes its
    /// own completed rows (§A.5).
    pub reap_finished: Option<Duration>,

    pub chroot: Option<PathBuf>,

    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,

    pub umask: Option<u32>,
    pub priority: i32,

    pub sched_idle: bool,
    pub ioprio_idle: bool,
    pub private_network: bool,
    pub private_tmp: bool,

    /// Maximum simultaneous operators for this one plan, 0 = unlimited
    /// (§4.8).
    pub concurrency: u32,

    pub rate_limits: Vec<RateLimit>,

    /// Whether a SOCK_SEQPACKET control channel is attached to the child's
    /// fd 3 (§4.7).
    pub control_channel: bool,
    /// `allow_spawn` requires `control_channel` (§4.7's `spawn` command).
    pub allow_spawn: bool,
}

impl Plan {
    pub fn executable_path(&self) -> &str {
        self.args.first().expect("Plan::args is never empty once loaded")
    }
}

fn parse_interval_seconds(s: &str) -> Option<Duration> {
    // Accepts "N seconds|minutes|hours|days" and bare "N" (seconds), the
    // shape Postgres's own interval literals take (`Pg::ParseIntervalS` in
    // `original_source`).
    let s = s.trim();
    let mut parts = s.splitn(2, char::is_whitespace);
    let number: f64 = parts.next()?.parse().ok()?;
    let unit = parts.next().map(str::trim).unwrap_or("seconds");
    let seconds = match unit.trim_end_matches('s') {
        "second" | "" => number,
        "minute" => number * 60.0,
        "hour" => number * 3600.0,
        "day" => number * 86400.0,
        _ => return None,
    };
    if seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

fn parse_rate_limit(s: &str) -> Result<RateLimit, String> {
    // "<count>/<period>", e.g. "10/1 minute".
    let (count_str, period_str) = s
        .split_once('/')
        .ok_or_else(|| format!("malformed rate_limit {s:?}, expected COUNT/PERIOD"))?;
    let count: u32 = count_str
        .trim()
        .parse()
        .map_err(|_| format!("malformed rate_limit count {count_str:?}"))?;
    let period = parse_interval_seconds(period_str)
        .ok_or_else(|| format!("malformed rate_limit period {period_str:?}"))?;
    Ok(RateLimit { count, period })
}

struct Loader {
    args: Vec<String>,
    timeout: String,
    parsed_timeout: Duration,
    reap_finished: Option<Duration>,
    chroot: Option<PathBuf>,
    uid: u32,
    gid: u32,
    groups: Vec<u32>,
    umask: Option<u32>,
    priority: i32,
    sched_idle: bool,
    ioprio_idle: bool,
    private_network: bool,
    private_tmp: bool,
    concurrency: u32,
    rate_limits: Vec<RateLimit>,
    control_channel: bool,
    allow_spawn: bool,
}

impl Default for Loader {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            timeout: String::new(),
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
            concurrency: 0,
            rate_limits: Vec::new(),
            control_channel: false,
            allow_spawn: false,
        }
    }
}

fn parse_line(loader: &mut Loader, path: &Path, lineno: u32, line: &str) -> Result<(), PlanError> {
    let err = |message: String| PlanError::Parse {
        path: path.display().to_string(),
        line: lineno,
        message,
    };

    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let mut words = line.split_whitespace();
    let Some(key) = words.next() else { return Ok(()) };
    let rest: Vec<&str> = words.collect();

    match key {
        "exec" => {
            if !loader.args.is_empty() {
                return Err(err("'exec' already specified".to_string()));
            }
            if rest.is_empty() || rest[0].is_empty() {
                return Err(err("empty executable".to_string()));
            }
            loader.args = rest.into_iter().map(str::to_string).collect();
        }
        "control_channel" => {
            loader.control_channel = match rest.first().copied() {
                None => true,
                Some("yes") | Some("true") => true,
                Some("no") | Some("false") => false,
                Some(other) => return Err(err(format!("expected yes/no, got {other:?}"))),
            };
        }
        "allow_spawn" => {
            if !loader.control_channel {
                return Err(err("allow_spawn requires control_channel".to_string()));
            }
            loader.allow_spawn = true;
        }
        "timeout" => {
            let value = rest
                .first()
                .ok_or_else(|| err("timeout requires a value".to_string()))?;
            loader.parsed_timeout = parse_interval_seconds(value)
                .ok_or_else(|| err(format!("invalid timeout {value:?}")))?;
            loader.timeout = value.to_string();
        }
        "reap_finished" => {
            let value = rest
                .first()
                .ok_or_else(|| err("reap_finished requires a value".to_string()))?;
            let duration = parse_interval_seconds(value)
                .ok_or_else(|| err(format!("invalid reap_finished {value:?}")))?;
            if duration.is_zero() {
                return Err(err(format!("not a positive duration: {value}")));
            }
            loader.reap_finished = Some(duration);
        }
        "chroot" => {
            let value = rest
                .first()
                .ok_or_else(|| err("chroot requires a value".to_string()))?;
            loader.chroot = Some(PathBuf::from(value));
        }
        "user" => {
            return Err(err(
                "'user' directive requires passwd lookups, not supported by this daemon; \
                 use 'uid'/'gid' instead"
                    .to_string(),
            ));
        }
        "uid" => {
            let value = rest
                .first()
                .ok_or_else(|| err("uid requires a value".to_string()))?;
            let uid: u32 = value.parse().map_err(|_| err(format!("invalid uid {value:?}")))?;
            if uid == 0 {
                return Err(err("uid 0 (root) is forbidden".to_string()));
            }
            loader.uid = uid;
        }
        "gid" => {
            let value = rest
                .first()
                .ok_or_else(|| err("gid requires a value".to_string()))?;
            let gid: u32 = value.parse().map_err(|_| err(format!("invalid gid {value:?}")))?;
            if gid == 0 {
                return Err(err("gid 0 (root) is forbidden".to_string()));
            }
            loader.gid = gid;
        }
        "groups" => {
            loader.groups = rest
                .iter()
                .map(|g| g.parse::<u32>().map_err(|_| err(format!("invalid group id {g:?}"))))
                .collect::<Result<Vec<_>, _>>()?;
        }
        "umask" => {
            let value = rest
                .first()
                .ok_or_else(|| err("umask requires a value".to_string()))?;
            if !value.starts_with('0') {
                return Err(err("umask must be an octal value starting with '0'".to_string()));
            }
            let parsed = u32::from_str_radix(value, 8)
                .map_err(|_| err("failed to parse umask".to_string()))?;
            if parsed & !0o777 != 0 {
                return Err(err("umask is too large".to_string()));
            }
            loader.umask = Some(parsed);
        }
        "nice" => {
            let value = rest
                .first()
                .ok_or_else(|| err("nice requires a value".to_string()))?;
            loader.priority = value
                .parse()
                .map_err(|_| err(format!("invalid nice value {value:?}")))?;
        }
        "sched_idle" => loader.sched_idle = true,
        "ioprio_idle" => loader.ioprio_idle = true,
        "idle" => {
            loader.sched_idle = true;
            loader.ioprio_idle = true;
        }
        "private_network" => loader.private_network = true,
        "private_tmp" => loader.private_tmp = true,
        "concurrency" => {
            let value = rest
                .first()
                .ok_or_else(|| err("concurrency requires a value".to_string()))?;
            loader.concurrency = value
                .parse()
                .map_err(|_| err(format!("invalid concurrency value {value:?}")))?;
        }
        "rate_limit" => {
            let value = rest
                .first()
                .ok_or_else(|| err("rate_limit requires a value".to_string()))?;
            let limit = parse_rate_limit(value).map_err(|message| err(message))?;
            loader.rate_limits.push(limit);
        }
        other => return Err(err(format!("unknown option {other:?}"))),
    }

    Ok(())
}

/// Parses a plan file's already-read contents. Takes the text directly
/// (rather than a path) so tests and `library.rs`'s mtime-gated reload can
/// share one entry point.
pub fn parse_plan(path: &Path, contents: &str) -> Result<Plan, Error> {
    let mut loader = Loader::default();
    for (i, line) in contents.lines().enumerate() {
        parse_line(&mut loader, path, (i + 1) as u32, line)?;
    }

    if loader.args.is_empty() {
        return Err(PlanError::Parse {
            path: path.display().to_string(),
            line: 0,
            message: "no 'exec'".to_string(),
        }
        .into());
    }

    if loader.timeout.is_empty() {
        loader.timeout = "10 minutes".to_string();
        loader.parsed_timeout = Duration::from_secs(600);
    }

    Ok(Plan {
        args: loader.args,
        timeout: loader.timeout,
        parsed_timeout: loader.parsed_timeout,
        reap_finished: loader.reap_finished,
        chroot: loader.chroot,
        uid: loader.uid,
        gid: loader.gid,
        groups: loader.groups,
        umask: loader.umask,
        priority: loader.priority,
        sched_idle: loader.sched_idle,
        ioprio_idle: loader.ioprio_idle,
        private_network: loader.private_network,
        private_tmp: loader.private_tmp,
        concurrency: loader.concurrency,
        rate_limits: loader.rate_limits,
        control_channel: loader.control_channel,
        allow_spawn: loader.allow_spawn,
    })
}

/// Loads and parses a plan file from disk.
pub async fn load_plan_file(path: &Path) -> Result<Plan, Error> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(PlanError::from)?;
    parse_plan(path, &contents)
}

/// `is_valid_plan_name` from `original_source`: plan (and plan-file)
/// names are restricted to `[A-Za-z0-9_-]+` so they're safe to embed in SQL
/// error messages, control-channel tags, and file paths without escaping.
pub fn is_valid_plan_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Result<Plan, Error> {
        parse_plan(Path::new("test.plan"), s)
    }

    #[test]
    fn minimal_plan_gets_default_timeout() {
        let plan = p("exec /bin/true\n").unwrap();
        assert_eq!(plan.args, vec!["/bin/true".to_string()]);
        assert_eq!(plan.timeout, "10 minutes");
        assert_eq!(plan.parsed_timeout, Duration::from_secs(600));
        assert_eq!(plan.uid, 65534);
        assert_eq!(plan.gid, 65534);
    }

    #[test]
    fn exec_takes_all_remaining_words_as_args() {
        let plan = p("exec /usr/bin/foo --flag value\n").unwrap();
        assert_eq!(
            plan.args,
            vec!["/usr/bin/foo".to_string(), "--flag".to_string(), "value".to_string()]
        );
    }

    #[test]
    fn duplicate_exec_is_rejected() {
        let err = p("exec /bin/true\nexec /bin/false\n").unwrap_err();
        assert!(matches!(err, Error::Plan(PlanError::Parse { .. })));
    }

    #[test]
    fn missing_exec_is_rejected() {
        assert!(p("timeout 5 minutes\n").is_err());
    }

    #[test]
    fn parses_timeout_chroot_and_concurrency() {
        let plan = p("exec /bin/true\ntimeout 5 minutes\nchroot /srv/jail\nconcurrency 3\n").unwrap();
        assert_eq!(plan.parsed_timeout, Duration::from_secs(300));
        assert_eq!(plan.chroot, Some(PathBuf::from("/srv/jail")));
        assert_eq!(plan.concurrency, 3);
    }

    #[test]
    fn allow_spawn_requires_control_channel() {
        let err = p("exec /bin/true\nallow_spawn\n").unwrap_err();
        assert!(matches!(err, Error::Plan(PlanError::Parse { .. })));

        let plan = p("exec /bin/true\ncontrol_channel\nallow_spawn\n").unwrap();
        assert!(plan.control_channel);
        assert!(plan.allow_spawn);
    }

    #[test]
    fn parses_rate_limit() {
        let plan = p("exec /bin/true\nrate_limit 10/1 minute\n").unwrap();
        assert_eq!(plan.rate_limits.len(), 1);
        assert_eq!(plan.rate_limits[0].count, 10);
        assert_eq!(plan.rate_limits[0].period, Duration::from_secs(60));
    }

    #[test]
    fn umask_must_be_octal() {
        let plan = p("exec /bin/true\numask 0022\n").unwrap();
        assert_eq!(plan.umask, Some(0o022));
        assert!(p("exec /bin/true\numask 18\n").is_err());
    }

    #[test]
    fn rejects_unknown_option() {
        assert!(p("exec /bin/true\nbogus_option yes\n").is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let plan = p("# a plan\n\nexec /bin/true # trailing comment\n").unwrap();
        assert_eq!(plan.args, vec!["/bin/true".to_string()]);
    }

    #[test]
    fn plan_name_validation() {
        assert!(is_valid_plan_name("my-plan_1"));
        assert!(!is_valid_plan_name(""));
        assert!(!is_valid_plan_name("../etc"));
        assert!(!is_valid_plan_name("has space"));
    }
}
