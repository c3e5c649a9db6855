//! Workshop `jobs` table SQL surface (§6, statement classes 1-10).
//!
//! Every statement here is grounded verbatim in
//! `original_source/src/workshop/PGQueue.cxx`; only the Rust binding style
//! changes (runtime `sqlx::query`/`query_as`, not the original's
//! hand-rolled `Pg::Connection::ExecuteParams`).

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::array_codec;
use crate::error::{DbError, Result};

use super::QueueDb;

/// One row returned by [`select_new_jobs`].
#[derive(Debug, Clone)]
pub struct WorkshopJobRow {
    pub id: String,
    pub plan_name: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

/// §6 statement 1: startup release of anything this node still claims.
pub async fn release_jobs(db: &QueueDb, node_name: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET node_name=NULL, node_timeout=NULL, progress=0 \
         WHERE node_name=$1 AND time_done IS NULL AND exit_status IS NULL",
    )
    .bind(node_name)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    Ok(result.rows_affected())
}

/// §6 statement 2: expire rows abandoned by dead nodes.
pub async fn expire_jobs(db: &QueueDb, except_node_name: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET node_name=NULL, node_timeout=NULL, progress=0 \
         WHERE time_done IS NULL AND exit_status IS NULL AND \
               node_name IS NOT NULL AND node_name <> $1 AND \
               node_timeout IS NOT NULL AND now() > node_timeout",
    )
    .bind(except_node_name)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    Ok(result.rows_affected())
}

/// §6 statement 3: select pending rows. `plans_include`/`plans_exclude`/
/// `plans_lowprio` are Postgres array literals built with
/// [`array_codec::encode`].
pub async fn select_new_jobs(
    db: &QueueDb,
    plans_include: &str,
    plans_exclude: &str,
    plans_lowprio: &str,
    limit: i64,
) -> Result<Vec<WorkshopJobRow>> {
    let rows = sqlx::query(
        "SELECT id, plan_name, args, env, stdin \
         FROM jobs \
         WHERE node_name IS NULL \
           AND time_done IS NULL AND exit_status IS NULL \
           AND (scheduled_time IS NULL OR now() >= scheduled_time) \
           AND plan_name = ANY ($1::TEXT[]) \
           AND plan_name <> ALL ($2::TEXT[] || $3::TEXT[]) \
           AND enabled \
         ORDER BY priority, time_created \
         LIMIT $4",
    )
    .bind(plans_include)
    .bind(plans_exclude)
    .bind(plans_lowprio)
    .bind(limit)
    .fetch_all(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;

    rows.into_iter()
        .map(|row| {
            Ok(WorkshopJobRow {
                id: row.try_get("id").map_err(|e| DbError::Query(e.to_string()))?,
                plan_name: row.try_get("plan_name").map_err(|e| DbError::Query(e.to_string()))?,
                args: row.try_get("args").map_err(|e| DbError::Query(e.to_string()))?,
                env: row.try_get("env").map_err(|e| DbError::Query(e.to_string()))?,
                stdin: row.try_get("stdin").map_err(|e| DbError::Query(e.to_string()))?,
            })
        })
        .collect()
}

/// §6 statement: minimum upcoming `scheduled_time`, capped by the caller at
/// 600s (§4.4 step 5). Returns `None` when there is nothing scheduled.
pub async fn next_scheduled_job(db: &QueueDb, plans_include: &str) -> Result<Option<i64>> {
    let row = sqlx::query(
        "SELECT EXTRACT(EPOCH FROM (MIN(scheduled_time) - now())) FROM jobs \
         WHERE node_name IS NULL AND time_done IS NULL AND exit_status IS NULL \
           AND scheduled_time IS NOT NULL \
           AND scheduled_time < now() + '1 year'::interval \
           AND plan_name = ANY ($1::TEXT[]) \
           AND enabled",
    )
    .bind(plans_include)
    .fetch_optional(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;

    match row {
        Some(row) => {
            let value: Option<f64> = row.try_get(0).map_err(|e| DbError::Query(e.to_string()))?;
            Ok(value.map(|v| v as i64))
        }
        None => Ok(None),
    }
}

/// §6 statement 9: rate-limit probe. Returns the number of seconds to wait
/// until a new run is allowed, or `None` if the limit is not yet reached.
pub async fn check_rate_limit(
    db: &QueueDb,
    plan_name: &str,
    duration_seconds: i64,
    max_count: i64,
) -> Result<Option<i64>> {
    let row = sqlx::query(
        "SELECT EXTRACT(EPOCH FROM time_started + $2 * '1 second'::interval - now()) FROM jobs \
          WHERE plan_name=$1 AND time_started >= now() - $2 * '1 second'::interval \
          ORDER BY time_started DESC \
          LIMIT 1 OFFSET $3",
    )
    .bind(plan_name)
    .bind(duration_seconds)
    .bind((max_count - 1).max(0))
    .fetch_optional(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;

    match row {
        Some(row) => {
            let value: Option<f64> = row.try_get(0).map_err(|e| DbError::Query(e.to_string()))?;
            Ok(value.map(|v| v.ceil() as i64).filter(|&v| v > 0))
        }
        None => Ok(None),
    }
}

/// §6 statement 4: claim. Returns whether this node won the race.
pub async fn claim_job(db: &QueueDb, job_id: &str, node_name: &str, timeout_seconds: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET node_name=$1, node_timeout=now() + $3 * '1 second'::interval, time_started=now() \
         WHERE id=$2 AND node_name IS NULL AND enabled",
    )
    .bind(node_name)
    .bind(job_id)
    .bind(timeout_seconds)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    Ok(result.rows_affected() > 0)
}

/// §6 statement 5: progress update, also refreshing `node_timeout`.
pub async fn set_job_progress(db: &QueueDb, job_id: &str, progress: u32, timeout_seconds: i64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs SET progress=$2, node_timeout=now() + $3 * '1 second'::interval WHERE id=$1",
    )
    .bind(job_id)
    .bind(progress as i32)
    .bind(timeout_seconds)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(DbError::LostClaim { id: job_id.to_string() }.into());
    }
    Ok(())
}

/// §6 statement 6: merge one `K=V` assignment into `env`, filtering out any
/// existing entry with the same key.
pub async fn set_env(db: &QueueDb, job_id: &str, assignment: &str) -> Result<()> {
    let Some((name, _)) = assignment.split_once('=') else {
        return Err(DbError::Query(format!("malformed environment variable {assignment:?}")).into());
    };
    if name.is_empty() {
        return Err(DbError::Query(format!("malformed environment variable {assignment:?}")).into());
    }
    let like = format!("{name}=%");

    let result = sqlx::query(
        "UPDATE jobs \
         SET env=ARRAY(SELECT x FROM (SELECT unnest(env) AS x) AS y WHERE x NOT LIKE $3)||ARRAY[$2]::varchar[] \
         WHERE id=$1",
    )
    .bind(job_id)
    .bind(assignment)
    .bind(&like)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(DbError::LostClaim { id: job_id.to_string() }.into());
    }
    Ok(())
}

/// Rolls a job back to pending without rescheduling (used on spawn
/// failure before any progress was recorded).
pub async fn rollback_job(db: &QueueDb, job_id: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs SET node_name=NULL, node_timeout=NULL, progress=0 \
         WHERE id=$1 AND node_name IS NOT NULL AND time_done IS NULL",
    )
    .bind(job_id)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(DbError::LostClaim { id: job_id.to_string() }.into());
    }
    Ok(())
}

/// §6 statement 7: `again` — reschedule instead of marking done.
pub async fn again_job(db: &QueueDb, job_id: &str, delay_seconds: i64, log: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET node_name=NULL, node_timeout=NULL, progress=0, log=$3, \
             scheduled_time=now() + $2 * '1 second'::interval \
         WHERE id=$1 AND node_name IS NOT NULL AND time_done IS NULL",
    )
    .bind(job_id)
    .bind(delay_seconds)
    .bind(log)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(DbError::LostClaim { id: job_id.to_string() }.into());
    }
    Ok(())
}

/// §6 statement 8: mark a job done.
pub async fn set_job_done(db: &QueueDb, job_id: &str, exit_status: i32, log: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs SET time_done=now(), progress=100, exit_status=$2, log=$3 WHERE id=$1",
    )
    .bind(job_id)
    .bind(exit_status)
    .bind(log)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(DbError::LostClaim { id: job_id.to_string() }.into());
    }
    Ok(())
}

/// Adds to the accumulated `cpu_usage` interval (§4.7's CPU accounting).
pub async fn add_job_cpu_usage(db: &QueueDb, job_id: &str, cpu_usage_microseconds: i64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs SET cpu_usage=COALESCE(cpu_usage, '0'::interval) + $2 * '1 microsecond'::interval \
         WHERE id=$1",
    )
    .bind(job_id)
    .bind(cpu_usage_microseconds)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(DbError::LostClaim { id: job_id.to_string() }.into());
    }
    Ok(())
}

/// §6 statement 10: `reap_finished` sweep for one plan.
pub async fn reap_finished_jobs(db: &QueueDb, plan_name: &str, reap_finished_seconds: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM jobs \
         WHERE plan_name=$1 AND time_done IS NOT NULL \
           AND time_done < now() - $2 * '1 second'::interval",
    )
    .bind(plan_name)
    .bind(reap_finished_seconds)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    Ok(result.rows_affected())
}

/// Helper: last-started timestamp of a plan, used by the rate limiter's
/// sliding-window accounting in tests.
pub async fn last_started(db: &QueueDb, plan_name: &str) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query("SELECT time_started FROM jobs WHERE plan_name=$1 ORDER BY time_started DESC LIMIT 1")
        .bind(plan_name)
        .fetch_optional(db.pool())
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
    match row {
        Some(row) => row.try_get(0).map_err(|e| DbError::Query(e.to_string()).into()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_filter_literals_round_trip_through_array_codec() {
        let include = array_codec::encode(&["build".to_string(), "deploy".to_string()]);
        assert_eq!(include, "{build,deploy}");
        assert_eq!(
            array_codec::decode(&include).unwrap(),
            vec!["build".to_string(), "deploy".to_string()]
        );
    }
}
