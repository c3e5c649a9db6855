//! Thin bootstrap: builds a [`Config`] from environment variables, starts one
//! [`Instance`], and drives every partition from a single cooperative event
//! loop (§5: "a single-threaded cooperative event loop per process ... no
//! data structure is shared across OS threads").
//!
//! Config-file/CLI parsing is out of scope (§1); this binary only reads a
//! handful of `WORKSHOPD_*` environment variables, documented alongside
//! their defaults below.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use workshopd::config::{Config, ControlConfig, CronPartitionConfig, WorkshopPartitionConfig};
use workshopd::instance::Instance;
use workshopd::partition::cron::CronPartition;
use workshopd::spawn_service::UnixSocketSpawnService;

fn init_tracing() {
    let debug = std::env::var("WORKSHOPD_DEBUG").is_ok();
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Builds the daemon's configuration from environment variables. A single
/// workshop partition and, if `WORKSHOPD_CRON_DATABASE_URL` is set, a single
/// cron partition are assembled; multi-partition deployments require the
/// config-file loader this crate doesn't implement (§1 Non-goals).
fn load_config() -> Config {
    let node_name = std::env::var("WORKSHOPD_NODE_NAME").unwrap_or_else(|_| {
        hostname_fallback()
    });

    let mut partitions = Vec::new();
    if let Ok(database) = std::env::var("WORKSHOPD_DATABASE_URL") {
        let plan_directories = std::env::var("WORKSHOPD_PLAN_DIRECTORIES")
            .map(|value| value.split(':').map(PathBuf::from).collect())
            .unwrap_or_else(|_| vec![PathBuf::from("/etc/cm4all/workshop/plans.d")]);

        partitions.push(WorkshopPartitionConfig {
            name: "main".to_string(),
            database,
            database_schema: std::env::var("WORKSHOPD_DATABASE_SCHEMA").ok(),
            plan_directories,
            concurrency: parse_env_or("WORKSHOPD_CONCURRENCY", 10),
            max_log: parse_env_or("WORKSHOPD_MAX_LOG", 64 * 1024),
            enable_journal: std::env::var("WORKSHOPD_ENABLE_JOURNAL").is_ok(),
            tag: std::env::var("WORKSHOPD_TAG").ok(),
        });
    }

    let mut cron_partitions = Vec::new();
    if let Ok(database) = std::env::var("WORKSHOPD_CRON_DATABASE_URL") {
        cron_partitions.push(CronPartitionConfig {
            name: "cron".to_string(),
            database,
            database_schema: std::env::var("WORKSHOPD_CRON_DATABASE_SCHEMA").ok(),
            concurrency: parse_env_or("WORKSHOPD_CRON_CONCURRENCY", 10),
            qmqp_server: std::env::var("WORKSHOPD_QMQP_SERVER").ok(),
            default_email_sender: std::env::var("WORKSHOPD_DEFAULT_EMAIL_SENDER").ok(),
            pond_server: std::env::var("WORKSHOPD_POND_SERVER").ok(),
            tag: std::env::var("WORKSHOPD_CRON_TAG").ok(),
        });
    }

    let control = ControlConfig {
        bind_address: std::env::var("WORKSHOPD_CONTROL_BIND").unwrap_or_else(|_| "0.0.0.0:5484".to_string()),
    };

    Config { node_name, partitions, cron_partitions, control }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|value| value.parse().ok()).unwrap_or(default)
}

fn hostname_fallback() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "workshop-node".to_string())
}

/// Next due-time for one cron partition's two independent timers (§4.5).
struct CronDue {
    scheduler: Instant,
    claim: Instant,
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = load_config();
    info!(node = %config.node_name, partitions = config.partitions.len(), cron_partitions = config.cron_partitions.len(), "starting");

    let spawn_socket = std::env::var("WORKSHOPD_SPAWN_SOCKET").unwrap_or_else(|_| "/run/cm4all/workshop/spawn.socket".to_string());
    let spawn_service = Arc::new(UnixSocketSpawnService::new(spawn_socket));

    // No concrete translation-server or QMQP wire client is built in this
    // crate (§1 Non-goals for the former; the latter has no protocol
    // implementation here, see DESIGN.md) — cron jobs that need either
    // degrade to a logged failure rather than silently no-op.
    let translation = None;
    let qmqp = None;

    let mut instance = Instance::start(&config, spawn_service, translation, qmqp).await?;
    let node_name = instance.node_name().to_string();

    let now = Instant::now();
    let mut workshop_due: Vec<Instant> = vec![now; instance.workshop_partitions.len()];
    let mut cron_due: Vec<CronDue> = instance.cron_partitions.iter().map(|_| CronDue { scheduler: now, claim: now }).collect();

    info!(node = %node_name, "workshopd ready");

    loop {
        let now = Instant::now();
        let mut next_wake = now + Duration::from_secs(60);
        for due in &workshop_due {
            next_wake = next_wake.min(*due);
        }
        for due in &cron_due {
            next_wake = next_wake.min(due.scheduler).min(due.claim);
        }
        next_wake = next_wake.max(now);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            result = instance.handle_one_control_datagram() => {
                if let Err(error) = result {
                    warn!(%error, "control datagram handling failed");
                }
            }
            _ = tokio::time::sleep_until(next_wake.into()) => {}
        }

        let now = Instant::now();
        for (partition, due) in instance.workshop_partitions.iter_mut().zip(workshop_due.iter_mut()) {
            if now < *due {
                continue;
            }
            match partition.run_once(now).await {
                Ok(sleep_for) => *due = now + sleep_for,
                Err(error) => {
                    warn!(partition = %partition.name, %error, "workshop partition run failed");
                    *due = now + Duration::from_secs(10);
                }
            }
        }

        for (partition, due) in instance.cron_partitions.iter().zip(cron_due.iter_mut()) {
            if now >= due.scheduler {
                // No `cronjobs_modified`/`cronjobs_scheduled` LISTEN wakeup is
                // wired into this loop (see DESIGN.md), so re-arm on every
                // fallback tick rather than relying on a notification to do
                // it — otherwise a pass that finds nothing suspends the
                // scheduler permanently.
                partition.rearm_scheduler();
                match partition.run_scheduler_once().await {
                    Ok(true) => due.scheduler = now + CronPartition::scheduler_jitter(),
                    Ok(false) => due.scheduler = now + Duration::from_secs(3600),
                    Err(error) => {
                        warn!(partition = %partition.name, %error, "cron scheduler pass failed");
                        due.scheduler = now + Duration::from_secs(10);
                    }
                }
            }

            if now >= due.claim {
                match partition.claim_next().await {
                    Ok(Some(row)) => {
                        let partition = partition.clone();
                        tokio::spawn(async move { partition.run_claimed_job(row).await });
                        due.claim = now;
                    }
                    Ok(None) => match partition.claim_sleep(chrono::Utc::now().naive_utc()).await {
                        Ok(sleep_for) => due.claim = now + sleep_for,
                        Err(error) => {
                            warn!(partition = %partition.name, %error, "failed to compute claim sleep");
                            due.claim = now + Duration::from_secs(10);
                        }
                    },
                    Err(error) => {
                        warn!(partition = %partition.name, %error, "cron claim failed");
                        due.claim = now + Duration::from_secs(10);
                    }
                }
            }
        }
    }

    info!("shutting down");
    std::process::exit(0);
}
