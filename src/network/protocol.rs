//! Wire grammar of the leader election protocol (LEP).
//!
//! Every message is a single UTF-8 line. The acceptor greets each new peer
//! connection with [`GREETING`]; afterwards the connecting side sends
//! [`Command`]s and the acceptor answers each one with a [`Reply`].

use std::fmt;
use std::str::FromStr;

use super::NetworkError;

pub const GREETING: &str = "ok LEP";

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const ELECT: &str = "elect";
pub const DECLARE: &str = "declare";
pub const OK: &str = "ok";
pub const ACK: &str = "ack";
pub const VOTE: &str = "vote";
pub const ERROR: &str = "error";

const PING_USAGE: &str = "ping";
const ELECT_USAGE: &str = "elect <id>";
const DECLARE_USAGE: &str = "declare <id>";
pub const VOTE_USAGE: &str = "vote <sender-id> <candidate-id>";

/// A request sent from one cluster member to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Elect { candidate_id: i32 },
    Declare { leader_id: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Known command with the wrong number or type of arguments.
    Usage(&'static str),
    Unknown(String),
}

impl CommandError {
    pub fn reply(&self) -> Reply {
        match self {
            CommandError::Usage(syntax) => Reply::usage(syntax),
            CommandError::Unknown(_) => Reply::protocol_error(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Usage(syntax) => write!(f, "usage: {syntax}"),
            CommandError::Unknown(line) => write!(f, "unknown command '{line}'"),
        }
    }
}

impl std::error::Error for CommandError {}

fn parse_id(arg: &str, usage: &'static str) -> Result<i32, CommandError> {
    arg.parse().map_err(|_| CommandError::Usage(usage))
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let args: Vec<&str> = line.split_whitespace().collect();
        match args.as_slice() {
            [PING] => Ok(Command::Ping),
            [PING, ..] => Err(CommandError::Usage(PING_USAGE)),
            [ELECT, id] => Ok(Command::Elect {
                candidate_id: parse_id(id, ELECT_USAGE)?,
            }),
            [ELECT, ..] => Err(CommandError::Usage(ELECT_USAGE)),
            [DECLARE, id] => Ok(Command::Declare {
                leader_id: parse_id(id, DECLARE_USAGE)?,
            }),
            [DECLARE, ..] => Err(CommandError::Usage(DECLARE_USAGE)),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ping => write!(f, "{PING}"),
            Command::Elect { candidate_id } => write!(f, "{ELECT} {candidate_id}"),
            Command::Declare { leader_id } => write!(f, "{DECLARE} {leader_id}"),
        }
    }
}

/// The answer to a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Pong,
    Ok,
    Ack { sender_id: i32 },
    Vote { sender_id: i32, candidate_id: i32 },
    Error(String),
}

impl Reply {
    pub fn usage(syntax: &str) -> Self {
        Reply::Error(format!("usage: {syntax}"))
    }

    pub fn protocol_error() -> Self {
        Reply::Error("protocol error".to_string())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Pong => write!(f, "{PONG}"),
            Reply::Ok => write!(f, "{OK}"),
            Reply::Ack { sender_id } => write!(f, "{ACK} {sender_id}"),
            Reply::Vote {
                sender_id,
                candidate_id,
            } => write!(f, "{VOTE} {sender_id} {candidate_id}"),
            Reply::Error(msg) => write!(f, "{ERROR} {msg}"),
        }
    }
}

impl FromStr for Reply {
    type Err = NetworkError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || NetworkError::Protocol(format!("malformed reply '{}'", line.trim()));
        let int = |arg: &str| arg.parse::<i32>().map_err(|_| malformed());

        let args: Vec<&str> = line.split_whitespace().collect();
        match args.as_slice() {
            [PONG] => Ok(Reply::Pong),
            [OK] => Ok(Reply::Ok),
            [ACK, sender] => Ok(Reply::Ack {
                sender_id: int(sender)?,
            }),
            [VOTE, sender, candidate] => Ok(Reply::Vote {
                sender_id: int(sender)?,
                candidate_id: int(candidate)?,
            }),
            [ERROR, ..] => Ok(Reply::Error(
                line.trim()
                    .strip_prefix(ERROR)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            )),
            _ => Err(malformed()),
        }
    }
}
