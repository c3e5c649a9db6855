//! QMQP notification client interface (§4.9): after a cron job's result row
//! is inserted, a non-empty `notification` address that validates as an
//! email gets a QMQP envelope with the job's captured log as the body. The
//! QMQP wire protocol itself is out of scope (§1); this module owns the
//! address validation (so invalid `notification` values are silently
//! skipped rather than attempted) and the narrow send interface.

use async_trait::async_trait;

use crate::error::Result;

/// One outgoing notification (§4.9).
#[derive(Debug, Clone)]
pub struct Notification<'a> {
    pub to: &'a str,
    pub from: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
}

#[async_trait]
pub trait QmqpClient: Send + Sync {
    async fn send(&self, notification: &Notification<'_>) -> Result<()>;
}

/// Minimal `local@domain` shape check; good enough to decide whether a
/// `notification` column is worth acting on (§4.9 says "validates as an
/// email address", not RFC 5322 compliance).
pub fn is_valid_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !address.chars().any(char::is_whitespace)
        && address.matches('@').count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plausible_addresses() {
        assert!(is_valid_email("ops@example.com"));
        assert!(is_valid_email("a.b+tag@sub.example.org"));
    }

    #[test]
    fn rejects_obviously_invalid_addresses() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("user@nodot"));
        assert!(!is_valid_email("user name@example.com"));
        assert!(!is_valid_email("a@b@example.com"));
    }
}
