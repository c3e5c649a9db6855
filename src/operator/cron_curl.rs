//! Cron "HTTP" operator variant (§4.9): a GET request stands in for the
//! child process. No OS process is spawned; the operator's "exit status"
//! is the HTTP status code.

use chrono::NaiveDateTime;

use crate::config::intervals;
use crate::db::cron as db;
use crate::db::QueueDb;
use crate::error::Result;

/// Runs one HTTP cron job to completion and returns `(exit_status, log)`
/// ready for [`db::finish`] (§4.9: 5-minute hard timeout, body captured
/// only for `text/*` responses, capped at 8 KiB).
pub async fn run(client: &reqwest::Client, url: &str) -> (i32, String) {
    let request = client.get(url).timeout(intervals::CRON_HTTP_TIMEOUT);
    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16() as i32;
            let is_text = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("text/"));

            let log = if is_text {
                match response.text().await {
                    Ok(body) => truncate_utf8(&body, intervals::CRON_HTTP_LOG_CAP),
                    Err(error) => format!("failed to read response body: {error}"),
                }
            } else {
                String::new()
            };

            (status, log)
        }
        Err(error) => (-1, error.to_string()),
    }
}

pub async fn finish(db_handle: &QueueDb, job_id: i64, start_time: NaiveDateTime, exit_status: i32, log: &str) -> Result<()> {
    db::finish(db_handle, job_id, start_time, Some(exit_status), log).await
}

/// Truncates to at most `cap` bytes on a UTF-8 boundary.
fn truncate_utf8(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_utf8_stops_at_char_boundary() {
        let s = "héllo world";
        let truncated = truncate_utf8(s, 2);
        assert!(s.is_char_boundary(truncated.len()));
        assert!(truncated.len() <= 2);
    }

    #[test]
    fn truncate_utf8_is_noop_under_cap() {
        assert_eq!(truncate_utf8("short", 100), "short");
    }
}
