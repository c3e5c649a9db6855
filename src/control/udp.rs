//! Control UDP wire protocol (§6): datagram = 4-byte BE magic
//! `0x63046102` + 4-byte BE CRC32 of the payload + one or more packets, each
//! `{u16 BE size; u16 BE command; payload; pad to 4 bytes}`.
//!
//! Privileged commands (everything but `NOP`/`VERBOSE`) require the sending
//! peer to be root (§5's "Only local-root clients may issue privileged
//! control commands"); enforcement reads `SO_PEERCRED` on the bound
//! `AF_UNIX`/UDP socket and is left to the caller — this module only frames
//! and parses.

use crate::error::{ControlError, Error, Result};

pub const MAGIC: u32 = 0x6304_6102;

/// One parsed admin command (§6's command table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Nop,
    Verbose(u8),
    DisableQueue,
    EnableQueue,
    TerminateChildren(String),
}

impl Command {
    fn code(&self) -> u16 {
        match self {
            Command::Nop => 0,
            Command::Verbose(_) => 1,
            Command::DisableQueue => 2,
            Command::EnableQueue => 3,
            Command::TerminateChildren(_) => 4,
        }
    }

    /// Whether this command may only be accepted from a root peer.
    pub fn requires_root(&self) -> bool {
        !matches!(self, Command::Nop)
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Command::Nop | Command::DisableQueue | Command::EnableQueue => Vec::new(),
            Command::Verbose(level) => vec![*level],
            Command::TerminateChildren(tag) => tag.as_bytes().to_vec(),
        }
    }
}

/// Builds a complete datagram containing exactly one packet.
pub fn encode_datagram(command: &Command) -> Vec<u8> {
    let payload = command.payload();
    let mut packet = Vec::with_capacity(4 + payload.len());
    packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(&command.code().to_be_bytes());
    packet.extend_from_slice(&payload);
    while packet.len() % 4 != 0 {
        packet.push(0);
    }

    let crc = crc32fast::hash(&packet);
    let mut datagram = Vec::with_capacity(8 + packet.len());
    datagram.extend_from_slice(&MAGIC.to_be_bytes());
    datagram.extend_from_slice(&crc.to_be_bytes());
    datagram.extend_from_slice(&packet);
    datagram
}

/// Parses a received datagram into its packets, verifying magic and CRC32
/// first. One datagram may carry several packets back-to-back.
pub fn decode_datagram(datagram: &[u8]) -> Result<Vec<Command>> {
    if datagram.len() < 8 {
        return Err(ControlError::Truncated.into());
    }
    let magic = u32::from_be_bytes(datagram[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(ControlError::BadMagic.into());
    }
    let expected_crc = u32::from_be_bytes(datagram[4..8].try_into().unwrap());
    let payload = &datagram[8..];
    if crc32fast::hash(payload) != expected_crc {
        return Err(ControlError::BadCrc.into());
    }

    let mut commands = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(ControlError::Truncated.into());
        }
        let size = u16::from_be_bytes(rest[0..2].try_into().unwrap()) as usize;
        let code = u16::from_be_bytes(rest[2..4].try_into().unwrap());
        let body_end = 4 + size;
        if rest.len() < body_end {
            return Err(ControlError::Truncated.into());
        }
        let body = &rest[4..body_end];
        commands.push(decode_command(code, body)?);

        let padded_len = (body_end + 3) / 4 * 4;
        if rest.len() < padded_len {
            return Err(ControlError::Truncated.into());
        }
        rest = &rest[padded_len..];
    }

    Ok(commands)
}

fn decode_command(code: u16, body: &[u8]) -> Result<Command> {
    match code {
        0 => Ok(Command::Nop),
        1 => {
            let level = *body.first().ok_or(Error::Control(ControlError::Truncated))?;
            Ok(Command::Verbose(level))
        }
        2 => Ok(Command::DisableQueue),
        3 => Ok(Command::EnableQueue),
        4 => Ok(Command::TerminateChildren(String::from_utf8_lossy(body).into_owned())),
        other => Err(ControlError::UnknownCommand(other).into()),
    }
}

/// Decides whether a packet may be applied, given the sending peer's uid
/// (§8 scenario f).
pub fn authorize(command: &Command, peer_uid: u32) -> Result<()> {
    if command.requires_root() && peer_uid != 0 {
        return Err(ControlError::PermissionDenied(peer_uid).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_nop() {
        let datagram = encode_datagram(&Command::Nop);
        assert_eq!(decode_datagram(&datagram).unwrap(), vec![Command::Nop]);
    }

    #[test]
    fn round_trips_verbose_level() {
        let datagram = encode_datagram(&Command::Verbose(3));
        assert_eq!(decode_datagram(&datagram).unwrap(), vec![Command::Verbose(3)]);
    }

    #[test]
    fn round_trips_terminate_children_tag() {
        let datagram = encode_datagram(&Command::TerminateChildren("batch".to_string()));
        assert_eq!(
            decode_datagram(&datagram).unwrap(),
            vec![Command::TerminateChildren("batch".to_string())]
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut datagram = encode_datagram(&Command::Nop);
        datagram[0] ^= 0xff;
        assert!(decode_datagram(&datagram).is_err());
    }

    #[test]
    fn rejects_corrupted_payload() {
        let mut datagram = encode_datagram(&Command::Verbose(3));
        *datagram.last_mut().unwrap() ^= 0xff;
        assert!(decode_datagram(&datagram).is_err());
    }

    #[test]
    fn root_required_for_privileged_commands_but_not_nop() {
        assert!(authorize(&Command::Nop, 1000).is_ok());
        assert!(authorize(&Command::DisableQueue, 1000).is_err());
        assert!(authorize(&Command::DisableQueue, 0).is_ok());
        assert!(authorize(&Command::Verbose(3), 0).is_ok());
        assert!(authorize(&Command::Verbose(3), 1000).is_err());
    }
}
