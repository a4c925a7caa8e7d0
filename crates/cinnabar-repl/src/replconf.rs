//! REPLCONF subcommand parsing and validation.

use cinnabar_types::ReplOffset;
use cinnabar_wire::Command;
use thiserror::Error;

/// Capability flags a replica may advertise via `REPLCONF CAPA`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub psync2: bool,
    pub eof: bool,
    pub multi_bulk: bool,
}

impl Capabilities {
    /// Parses capability tokens, ignoring unknown ones.
    pub fn from_tokens<'a>(tokens: impl Iterator<Item = &'a [u8]>) -> Self {
        let mut capabilities = Self::default();
        for token in tokens {
            if token.eq_ignore_ascii_case(b"psync2") {
                capabilities.psync2 = true;
            } else if token.eq_ignore_ascii_case(b"eof") {
                capabilities.eof = true;
            } else if token.eq_ignore_ascii_case(b"multi-bulk") {
                capabilities.multi_bulk = true;
            }
        }
        capabilities
    }
}

/// A validated REPLCONF subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplConf {
    /// `REPLCONF ACK <offset>`: replica reports its applied offset.
    Ack(ReplOffset),
    /// `REPLCONF LISTENING-PORT <port>`: replica advertises its port.
    ListeningPort(u16),
    /// `REPLCONF CAPA <cap>...`: replica advertises capabilities.
    Capa(Capabilities),
    /// `REPLCONF GETACK`: request an immediate ACK.
    GetAck,
}

/// REPLCONF validation failures, with their wire messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplConfError {
    #[error("wrong number of arguments for REPLCONF")]
    MissingSubcommand,

    #[error("unknown REPLCONF subcommand")]
    UnknownSubcommand,

    #[error("invalid REPLCONF arguments")]
    InvalidArgs,

    #[error("invalid port number")]
    InvalidPort,
}

impl ReplConf {
    /// Parses and validates a `REPLCONF …` command.
    ///
    /// | Subcommand | Arity |
    /// |---|---|
    /// | `ACK <offset>` | 3 |
    /// | `LISTENING-PORT <port>` | 3, port in 1..=65535 |
    /// | `CAPA <cap>…` | ≥3 |
    /// | `GETACK` | 2 |
    pub fn parse(cmd: &Command) -> Result<Self, ReplConfError> {
        let sub = cmd.arg(1).ok_or(ReplConfError::MissingSubcommand)?;

        if sub.eq_ignore_ascii_case(b"ACK") {
            if cmd.arity() != 3 {
                return Err(ReplConfError::InvalidArgs);
            }
            let offset = cmd
                .arg_str(2)
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(ReplConfError::InvalidArgs)?;
            Ok(ReplConf::Ack(ReplOffset::new(offset)))
        } else if sub.eq_ignore_ascii_case(b"LISTENING-PORT") {
            if cmd.arity() != 3 {
                return Err(ReplConfError::InvalidArgs);
            }
            let port = cmd
                .arg_str(2)
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or(ReplConfError::InvalidPort)?;
            let port = u16::try_from(port).ok().filter(|&p| p > 0);
            port.map(ReplConf::ListeningPort)
                .ok_or(ReplConfError::InvalidPort)
        } else if sub.eq_ignore_ascii_case(b"CAPA") {
            if cmd.arity() < 3 {
                return Err(ReplConfError::InvalidArgs);
            }
            let capabilities =
                Capabilities::from_tokens(cmd.args()[2..].iter().map(|a| a.as_ref()));
            Ok(ReplConf::Capa(capabilities))
        } else if sub.eq_ignore_ascii_case(b"GETACK") {
            if cmd.arity() != 2 {
                return Err(ReplConfError::InvalidArgs);
            }
            Ok(ReplConf::GetAck)
        } else {
            Err(ReplConfError::UnknownSubcommand)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cmd(parts: &[&str]) -> Command {
        Command::from_args(
            parts
                .iter()
                .map(|p| Bytes::copy_from_slice(p.as_bytes()))
                .collect(),
        )
    }

    #[test]
    fn ack_parses_offset() {
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "ACK", "1234"])),
            Ok(ReplConf::Ack(ReplOffset::new(1234)))
        );
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "ack", "0"])),
            Ok(ReplConf::Ack(ReplOffset::ZERO))
        );
    }

    #[test]
    fn ack_arity_is_exact() {
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "ACK"])),
            Err(ReplConfError::InvalidArgs)
        );
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "ACK", "1", "2"])),
            Err(ReplConfError::InvalidArgs)
        );
    }

    #[test]
    fn listening_port_validates_range() {
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "LISTENING-PORT", "6380"])),
            Ok(ReplConf::ListeningPort(6380))
        );
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "LISTENING-PORT", "0"])),
            Err(ReplConfError::InvalidPort)
        );
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "LISTENING-PORT", "70000"])),
            Err(ReplConfError::InvalidPort)
        );
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "LISTENING-PORT", "nope"])),
            Err(ReplConfError::InvalidPort)
        );
    }

    #[test]
    fn capa_collects_known_flags() {
        let parsed = ReplConf::parse(&cmd(&["REPLCONF", "CAPA", "psync2", "eof", "future-cap"]));
        assert_eq!(
            parsed,
            Ok(ReplConf::Capa(Capabilities {
                psync2: true,
                eof: true,
                multi_bulk: false,
            }))
        );
    }

    #[test]
    fn getack_takes_no_arguments() {
        assert_eq!(ReplConf::parse(&cmd(&["REPLCONF", "GETACK"])), Ok(ReplConf::GetAck));
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "GETACK", "x"])),
            Err(ReplConfError::InvalidArgs)
        );
    }

    #[test]
    fn unknown_subcommand_rejected() {
        assert_eq!(
            ReplConf::parse(&cmd(&["REPLCONF", "FROB"])),
            Err(ReplConfError::UnknownSubcommand)
        );
    }
}
