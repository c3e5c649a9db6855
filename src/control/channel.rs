//! Control-channel RPC parsing (§4.7): one SEQPACKET datagram per command,
//! first whitespace-separated token is the verb.

use crate::error::{ControlError, Result};

/// One parsed control-channel command from a running child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// `progress N`, `0..=100`.
    Progress(u32),
    /// `setenv K=V`.
    SetEnv(String),
    /// `again [S]`, `S` in `0..=86400` seconds (default 0: run again
    /// immediately).
    Again(u32),
    /// `version`.
    Version,
    /// `spawn TOKEN [PARAM]`.
    Spawn { token: String, param: Option<String> },
}

const MAX_AGAIN_DELAY_SECONDS: u32 = 86400;

/// Parses one datagram's UTF-8 payload into a command.
pub fn parse(line: &str) -> Result<ChannelCommand> {
    let line = line.trim_end_matches(['\n', '\0']);
    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match verb {
        "progress" => {
            let value: u32 = rest
                .parse()
                .map_err(|_| ControlError::MalformedFrame(format!("bad progress value: {rest:?}")))?;
            if value > 100 {
                return Err(ControlError::MalformedFrame(format!("progress out of range: {value}")).into());
            }
            Ok(ChannelCommand::Progress(value))
        }
        "setenv" => {
            if !rest.contains('=') || rest.split('=').next().is_some_and(str::is_empty) {
                return Err(ControlError::MalformedFrame(format!("malformed setenv: {rest:?}")).into());
            }
            Ok(ChannelCommand::SetEnv(rest.to_string()))
        }
        "again" => {
            if rest.is_empty() {
                return Ok(ChannelCommand::Again(0));
            }
            let delay: u32 = rest
                .parse()
                .map_err(|_| ControlError::MalformedFrame(format!("bad again delay: {rest:?}")))?;
            if delay > MAX_AGAIN_DELAY_SECONDS {
                return Err(ControlError::MalformedFrame(format!("again delay too large: {delay}")).into());
            }
            Ok(ChannelCommand::Again(delay))
        }
        "version" => Ok(ChannelCommand::Version),
        "spawn" => {
            if rest.is_empty() {
                return Err(ControlError::MalformedFrame("spawn requires a translation token".to_string()).into());
            }
            let mut spawn_parts = rest.splitn(2, ' ');
            let token = spawn_parts.next().unwrap().to_string();
            let param = spawn_parts.next().map(str::to_string).filter(|s| !s.is_empty());
            Ok(ChannelCommand::Spawn { token, param })
        }
        other => Err(ControlError::MalformedFrame(format!("unknown control-channel verb: {other:?}")).into()),
    }
}

/// Builds the daemon's `version <V>` reply (§8 property 9).
pub fn version_reply(version: &str) -> String {
    format!("version {version}")
}

/// Builds an `error <msg>` reply for a recoverable protocol error (§7:
/// "keep connection open (temporary error)").
pub fn error_reply(message: &str) -> String {
    format!("error {message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress() {
        assert_eq!(parse("progress 42").unwrap(), ChannelCommand::Progress(42));
    }

    #[test]
    fn rejects_progress_above_100() {
        assert!(parse("progress 101").is_err());
    }

    #[test]
    fn parses_setenv() {
        assert_eq!(
            parse("setenv FOO=bar").unwrap(),
            ChannelCommand::SetEnv("FOO=bar".to_string())
        );
    }

    #[test]
    fn rejects_malformed_setenv() {
        assert!(parse("setenv noequals").is_err());
        assert!(parse("setenv =novalue").is_err());
    }

    #[test]
    fn parses_again_with_and_without_delay() {
        assert_eq!(parse("again").unwrap(), ChannelCommand::Again(0));
        assert_eq!(parse("again 30").unwrap(), ChannelCommand::Again(30));
    }

    #[test]
    fn rejects_again_delay_over_one_day() {
        assert!(parse("again 86401").is_err());
    }

    #[test]
    fn parses_version_and_builds_reply() {
        assert_eq!(parse("version").unwrap(), ChannelCommand::Version);
        assert_eq!(version_reply("1.0"), "version 1.0");
    }

    #[test]
    fn parses_spawn_with_and_without_param() {
        assert_eq!(
            parse("spawn urn:example").unwrap(),
            ChannelCommand::Spawn { token: "urn:example".to_string(), param: None }
        );
        assert_eq!(
            parse("spawn urn:example extra").unwrap(),
            ChannelCommand::Spawn {
                token: "urn:example".to_string(),
                param: Some("extra".to_string())
            }
        );
    }

    #[test]
    fn rejects_unknown_verb() {
        assert!(parse("frobnicate").is_err());
    }
}
