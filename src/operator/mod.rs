//! Operators: the daemon-side supervisor for one running child (§4.7, §4.9).
//!
//! [`workshop`] is the workshop queue's operator; [`cron_spawn`] and
//! [`cron_curl`] are the two cron variants (§4.9). All three share the log
//! ring buffer and the legacy stdout progress parser defined here.

pub mod cron_curl;
pub mod cron_spawn;
pub mod workshop;

/// Fixed-capacity UTF-8 log ring buffer (§4.7's log-capture rules): retains
/// at most `capacity` bytes, replacing non-printable ASCII (everything but
/// `\r`, `\n`, `\t`) with a space. Oldest bytes are dropped first.
#[derive(Debug, Default)]
pub struct LogRingBuffer {
    capacity: usize,
    data: Vec<u8>,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, data: Vec::new() }
    }

    /// Appends `chunk`, sanitizing non-printable bytes and truncating from
    /// the front if the buffer would exceed `capacity`.
    pub fn append(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            let sanitized = if byte == b'\r' || byte == b'\n' || byte == b'\t' || (0x20..0x7f).contains(&byte) {
                byte
            } else {
                b' '
            };
            self.data.push(sanitized);
        }
        if self.data.len() > self.capacity {
            let excess = self.data.len() - self.capacity;
            self.data.drain(0..excess);
        }
    }

    /// The retained log as a lossily-decoded string (§7: invalid UTF-8 is
    /// replaced wholesale with a fixed message, since the source byte
    /// stream may have been truncated mid-codepoint).
    pub fn as_log_string(&self) -> String {
        match std::str::from_utf8(&self.data) {
            Ok(s) => s.to_string(),
            Err(_) => "Invalid UTF-8 output".to_string(),
        }
    }
}

/// Legacy (no control channel) progress parsing: scans for runs of ASCII
/// digits bounded by non-digits, yielding each run's numeric value in
/// order. The caller picks the first value `<= 100` and, per §B.2's
/// resolution, only acts on it when it differs from the last reported
/// progress (C++ "update on change" semantics, preferred over the C legacy
/// "any digit run" behavior per §9's open question).
pub fn scan_progress_values(stdout_chunk: &str) -> Vec<u32> {
    let mut values = Vec::new();
    let mut current = String::new();
    for c in stdout_chunk.chars().chain(std::iter::once('\u{0}')) {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(value) = current.parse::<u32>() {
                values.push(value);
            }
            current.clear();
        }
    }
    values
}

/// First value out of [`scan_progress_values`] that is `<= 100`, or `None`.
pub fn first_valid_progress(stdout_chunk: &str) -> Option<u32> {
    scan_progress_values(stdout_chunk).into_iter().find(|&v| v <= 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_sanitizes_non_printable_bytes() {
        let mut buf = LogRingBuffer::new(64);
        buf.append(b"hello\x01world\n");
        assert_eq!(buf.as_log_string(), "hello world\n");
    }

    #[test]
    fn ring_buffer_drops_oldest_bytes_past_capacity() {
        let mut buf = LogRingBuffer::new(5);
        buf.append(b"abcdefgh");
        assert_eq!(buf.as_log_string(), "defgh");
    }

    #[test]
    fn progress_scan_matches_property_8_example() {
        let values = scan_progress_values("abc42xx99\nhello");
        assert_eq!(values, vec![42, 99]);
    }

    #[test]
    fn first_valid_progress_ignores_runs_over_100() {
        assert_eq!(first_valid_progress("999 then 42"), Some(42));
        assert_eq!(first_valid_progress("42 then 999"), Some(42));
        assert_eq!(first_valid_progress("no digits here"), None);
    }
}
