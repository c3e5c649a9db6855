//! `cronjobs`/`cronjobs_history` SQL surface (§4.5, §6).
//!
//! Grounded in `original_source/src/cron/Queue.cxx` (claim/finish/result
//! insertion, `LISTEN` setup, stale-row release) and
//! `original_source/src/cron/CalculateNextRun.cxx` (jitter generation and
//! the `next_run` recalculation that happens on every scheduler pass).

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use rand::Rng;
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::schedule::{CronSchedule, NextRun};

use super::QueueDb;

/// One row due for (re)scheduling, as read by [`select_scheduler_batch`].
#[derive(Debug, Clone)]
pub struct CronScheduleRow {
    pub id: i64,
    pub schedule_text: String,
    pub last_run: Option<NaiveDateTime>,
    pub delay_range_seconds: i64,
}

/// One job claimed for execution, as read by [`claim_next_pending`].
#[derive(Debug, Clone)]
pub struct CronJobRow {
    pub id: i64,
    pub account_id: Option<String>,
    pub command: String,
    pub translate_param: Option<String>,
    pub notification: Option<String>,
    pub timeout_seconds: i64,
}

/// §4.5 step 1 (`OnConnect` in `Queue.cxx`): release rows this node still
/// holds from a previous run and that never finished.
pub async fn release_stale(db: &QueueDb, node_name: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE cronjobs SET node_name=NULL, node_timeout=NULL \
         WHERE node_name=$1",
    )
    .bind(node_name)
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    Ok(result.rows_affected())
}

/// Scheduler pass: rows whose `next_run` has arrived or is unset, capped at
/// [`crate::config::intervals::SCHEDULER_BATCH_LIMIT`].
pub async fn select_scheduler_batch(db: &QueueDb, limit: i64) -> Result<Vec<CronScheduleRow>> {
    let rows = sqlx::query(
        "SELECT id, schedule, last_run AT TIME ZONE COALESCE(tz,'UTC'), \
                COALESCE(delay_range, 0) \
         FROM cronjobs \
         WHERE enabled AND (next_run IS NULL OR next_run <= now()) \
         ORDER BY next_run NULLS FIRST \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;

    rows.into_iter()
        .map(|row| {
            Ok(CronScheduleRow {
                id: row.try_get(0).map_err(|e| DbError::Query(e.to_string()))?,
                schedule_text: row.try_get(1).map_err(|e| DbError::Query(e.to_string()))?,
                last_run: row.try_get(2).map_err(|e| DbError::Query(e.to_string()))?,
                delay_range_seconds: row.try_get(3).map_err(|e| DbError::Query(e.to_string()))?,
            })
        })
        .collect()
}

/// `MakeRandomDelay` (`CalculateNextRun.cxx`): uniform in `[0, range)`
/// seconds, persisted once per schedule so repeated recalculations are
/// stable until the schedule text itself changes.
pub fn make_random_delay(range: std::time::Duration) -> std::time::Duration {
    if range.is_zero() {
        return range;
    }
    let seconds = range.as_secs();
    let jittered = rand::thread_rng().gen_range(0..=seconds);
    std::time::Duration::from_secs(jittered)
}

/// Recomputes and persists `next_run` for one row, matching
/// `CalculateNextRun.cxx`'s loop: subtract the previously-stored delay from
/// `last_run`, feed the delay-free `last_run` through [`CronSchedule::next`],
/// then re-add a (possibly freshly generated) delay to the result. The
/// delay is only regenerated when the row had none stored yet; afterwards it
/// is conditionally persisted so concurrent schedulers converge on the
/// first writer's value, mirroring the original's `UPDATE ... WHERE
/// delay_range IS NULL` guard.
pub async fn recalculate_next_run(db: &QueueDb, row: &CronScheduleRow) -> Result<NextRun> {
    let schedule = CronSchedule::parse(&row.schedule_text)
        .map_err(|e| DbError::Query(format!("invalid schedule in cronjobs.{}: {e}", row.id)))?;

    let stored_delay = ChronoDuration::seconds(row.delay_range_seconds.max(0));
    let last_run_undelayed = row.last_run.map(|t| t - stored_delay);

    let now = chrono::Utc::now().naive_utc();
    let next = schedule.next(last_run_undelayed, now);

    let NextRun::At(base) = next else {
        sqlx::query("UPDATE cronjobs SET next_run=NULL WHERE id=$1")
            .bind(row.id)
            .execute(db.pool())
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;
        return Ok(NextRun::Never);
    };

    let delay = if row.delay_range_seconds > 0 {
        ChronoDuration::seconds(row.delay_range_seconds)
    } else {
        ChronoDuration::from_std(make_random_delay(schedule.delay_range)).unwrap_or_default()
    };
    let next_run = base + delay;

    sqlx::query(
        "UPDATE cronjobs \
         SET next_run=$2::timestamp AT TIME ZONE COALESCE(tz,'UTC'), \
             delay_range=COALESCE(delay_range, $3) \
         WHERE id=$1",
    )
    .bind(row.id)
    .bind(next_run)
    .bind(delay.num_seconds())
    .execute(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;

    Ok(NextRun::At(next_run))
}

/// Earliest upcoming `next_run`, used to size the claim timer's sleep
/// (jittered and capped by the caller, §4.5 step 4).
pub async fn earliest_pending(db: &QueueDb) -> Result<Option<NaiveDateTime>> {
    let row = sqlx::query(
        "SELECT MIN(next_run) FROM cronjobs WHERE enabled AND node_name IS NULL AND next_run IS NOT NULL",
    )
    .fetch_optional(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;
    match row {
        Some(row) => row.try_get(0).map_err(|e| DbError::Query(e.to_string()).into()),
        None => Ok(None),
    }
}

/// Claims one due, unclaimed row. Returns `None` if nothing is due, or if
/// another node won the race (caller should retry against the next row).
pub async fn claim_next_pending(db: &QueueDb, node_name: &str) -> Result<Option<CronJobRow>> {
    let candidate = sqlx::query(
        "SELECT id FROM cronjobs \
         WHERE enabled AND node_name IS NULL AND next_run IS NOT NULL AND next_run <= now() \
         ORDER BY next_run LIMIT 1",
    )
    .fetch_optional(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;

    let Some(candidate) = candidate else { return Ok(None) };
    let id: i64 = candidate.try_get(0).map_err(|e| DbError::Query(e.to_string()))?;

    let claimed = sqlx::query(
        "UPDATE cronjobs SET node_name=$2, node_timeout=now() + interval '1 hour', last_run=now() \
         WHERE id=$1 AND node_name IS NULL \
         RETURNING account_id, command, translate_param, notification, \
                   COALESCE(EXTRACT(epoch FROM timeout)::bigint, 600)",
    )
    .bind(id)
    .bind(node_name)
    .fetch_optional(db.pool())
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;

    match claimed {
        Some(row) => Ok(Some(CronJobRow {
            id,
            account_id: row.try_get(0).map_err(|e| DbError::Query(e.to_string()))?,
            command: row.try_get(1).map_err(|e| DbError::Query(e.to_string()))?,
            translate_param: row.try_get(2).map_err(|e| DbError::Query(e.to_string()))?,
            notification: row.try_get(3).map_err(|e| DbError::Query(e.to_string()))?,
            timeout_seconds: row.try_get(4).map_err(|e| DbError::Query(e.to_string()))?,
        })),
        None => Ok(None),
    }
}

/// Releases a claimed row back to the pool (used on spawn failure before
/// any result is known).
pub async fn release_claim(db: &QueueDb, job_id: i64) -> Result<()> {
    let result = sqlx::query("UPDATE cronjobs SET node_name=NULL, node_timeout=NULL WHERE id=$1")
        .bind(job_id)
        .execute(db.pool())
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(DbError::LostClaim { id: job_id.to_string() }.into());
    }
    Ok(())
}

/// Finishes a claimed row: clears the claim and records a `cronresults` row
/// (`InsertResult` in `Queue.cxx`).
pub async fn finish(
    db: &QueueDb,
    job_id: i64,
    start_time: NaiveDateTime,
    exit_status: Option<i32>,
    log: &str,
) -> Result<()> {
    let mut tx = db.pool().begin().await.map_err(|e| DbError::Query(e.to_string()))?;

    sqlx::query("UPDATE cronjobs SET node_name=NULL, node_timeout=NULL WHERE id=$1")
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

    sqlx::query(
        "INSERT INTO cronresults (cronjob_id, start_time, finish_time, exit_status, log) \
         VALUES ($1, $2, now(), $3, $4)",
    )
    .bind(job_id)
    .bind(start_time)
    .bind(exit_status)
    .bind(log)
    .execute(&mut *tx)
    .await
    .map_err(|e| DbError::Query(e.to_string()))?;

    tx.commit().await.map_err(|e| DbError::Query(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_delay_is_bounded_and_zero_range_is_zero() {
        assert_eq!(make_random_delay(std::time::Duration::ZERO), std::time::Duration::ZERO);
        for _ in 0..50 {
            let delay = make_random_delay(std::time::Duration::from_secs(10));
            assert!(delay <= std::time::Duration::from_secs(10));
        }
    }
}
