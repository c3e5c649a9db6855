//! Translation-server client interface (§1 Non-goals: the translation
//! protocol itself is an external collaborator; this crate only needs to
//! resolve a `urn:` token into an argv before handing it to the spawn
//! service, per §4.7's `spawn` verb and §4.9's cron "`urn:` token" case).

use async_trait::async_trait;

use crate::error::Result;

/// The piece of a translation response this crate actually consumes.
#[derive(Debug, Clone, Default)]
pub struct Translation {
    pub argv: Vec<String>,
    pub env: Vec<String>,
}

#[async_trait]
pub trait TranslationClient: Send + Sync {
    /// Resolves `token` (and an optional free-form `param`) into an argv.
    async fn resolve(&self, token: &str, param: Option<&str>) -> Result<Translation>;
}

/// Whether a cron command string should be resolved via [`TranslationClient`]
/// rather than run through `/bin/sh -c` (§4.9).
pub fn is_translation_token(command: &str) -> bool {
    command.starts_with("urn:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_urn_tokens() {
        assert!(is_translation_token("urn:example:job"));
        assert!(!is_translation_token("/bin/echo hi"));
    }
}
