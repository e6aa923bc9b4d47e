//! Line-based text protocol spoken between peers.
//!
//! One command per connection, newline-terminated, words separated by
//! whitespace. Addresses travel as two words: `<ip> <port>`.
//!
//! Ring maintenance:
//!   - "FINDSUCCESSOR <key> <ip> <port> [<hops>]" (joining peer -> ring member)
//!   - "UPDATEPREDECESSOR <ip> <port>"
//!   - "UPDATESUCCESSOR <ip> <port>"
//!   - "FINDPREDECESSOR <ip> <port>"              (answered with one reply line)
//!
//! Storage (header line + exactly <len> binary bytes where a length is given):
//!   - "FORWARD <key> <degree> <len>"
//!   - "REPLICATE <key> <degree> <len>"
//!   - "RESTORE <key> <ip> <port>"
//!   - "RESTORED <key> <len>"
//!   - "DELETE <key> <ip> <port>"
//!   - "REMOVED <key> <ip> <port> <len>"
//!   - "UPDATETABLE <key> <ip> <port>"
//!
//! Replies:
//!   - "PREDECESSOR <ip> <port>" or "PREDECESSOR NONE"

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::ProtocolError;
use crate::id::{FileKey, RingId};

/// Parsed representation of a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `hops` counts forwards so far; absent on the wire means 0.
    FindSuccessor { key: RingId, candidate: SocketAddr, hops: u32 },
    UpdatePredecessor(SocketAddr),
    UpdateSuccessor(SocketAddr),
    FindPredecessor(SocketAddr),

    Forward { key: FileKey, degree: u32, len: u64 },
    Replicate { key: FileKey, degree: u32, len: u64 },
    Restore { key: FileKey, requester: SocketAddr },
    Restored { key: FileKey, len: u64 },
    Delete { key: FileKey, requester: SocketAddr },
    Removed { key: FileKey, holder: SocketAddr, len: u64 },
    UpdateTable { key: FileKey, holder: SocketAddr },
}

impl Command {
    /// Length of the binary body following the header line, if any.
    pub fn body_len(&self) -> Option<u64> {
        match self {
            Command::Forward { len, .. }
            | Command::Replicate { len, .. }
            | Command::Restored { len, .. }
            | Command::Removed { len, .. } => Some(*len),
            _ => None,
        }
    }

    /// Ring position the command is about, if it names one.
    pub fn key(&self) -> Option<RingId> {
        match self {
            Command::FindSuccessor { key, .. }
            | Command::Forward { key, .. }
            | Command::Replicate { key, .. }
            | Command::Restore { key, .. }
            | Command::Restored { key, .. }
            | Command::Delete { key, .. }
            | Command::Removed { key, .. }
            | Command::UpdateTable { key, .. } => Some(*key),
            Command::UpdatePredecessor(_) | Command::UpdateSuccessor(_) | Command::FindPredecessor(_) => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::FindSuccessor { .. } => "FINDSUCCESSOR",
            Command::UpdatePredecessor(_) => "UPDATEPREDECESSOR",
            Command::UpdateSuccessor(_) => "UPDATESUCCESSOR",
            Command::FindPredecessor(_) => "FINDPREDECESSOR",
            Command::Forward { .. } => "FORWARD",
            Command::Replicate { .. } => "REPLICATE",
            Command::Restore { .. } => "RESTORE",
            Command::Restored { .. } => "RESTORED",
            Command::Delete { .. } => "DELETE",
            Command::Removed { .. } => "REMOVED",
            Command::UpdateTable { .. } => "UPDATETABLE",
        }
    }
}

/// Header line without the trailing newline.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = self.verb();
        match self {
            Command::FindSuccessor { key, candidate, hops: 0 } => {
                write!(f, "{verb} {key} {} {}", candidate.ip(), candidate.port())
            }
            Command::FindSuccessor { key, candidate, hops } => {
                write!(f, "{verb} {key} {} {} {hops}", candidate.ip(), candidate.port())
            }
            Command::UpdatePredecessor(addr)
            | Command::UpdateSuccessor(addr)
            | Command::FindPredecessor(addr) => write!(f, "{verb} {} {}", addr.ip(), addr.port()),
            Command::Forward { key, degree, len } | Command::Replicate { key, degree, len } => {
                write!(f, "{verb} {key} {degree} {len}")
            }
            Command::Restore { key, requester } | Command::Delete { key, requester } => {
                write!(f, "{verb} {key} {} {}", requester.ip(), requester.port())
            }
            Command::Restored { key, len } => write!(f, "{verb} {key} {len}"),
            Command::Removed { key, holder, len } => {
                write!(f, "{verb} {key} {} {} {len}", holder.ip(), holder.port())
            }
            Command::UpdateTable { key, holder } => {
                write!(f, "{verb} {key} {} {}", holder.ip(), holder.port())
            }
        }
    }
}

/// Parse one incoming line from the wire into a Command.
pub fn parse_line(line: &str) -> Result<Command, ProtocolError> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or(ProtocolError::Empty)?;
    let args: Vec<&str> = words.collect();

    match verb {
        // FINDSUCCESSOR <key> <ip> <port> [<hops>]
        "FINDSUCCESSOR" => {
            let v = "FINDSUCCESSOR";
            if args.len() != 4 {
                arity(v, &args, 3)?;
            }
            let hops = match args.get(3) {
                Some(raw) => num_arg(v, "hop count", raw)?,
                None => 0,
            };
            Ok(Command::FindSuccessor {
                key: key_arg(v, args[0])?,
                candidate: addr_arg(v, args[1], args[2])?,
                hops,
            })
        }
        // UPDATEPREDECESSOR <ip> <port>
        "UPDATEPREDECESSOR" => {
            let v = "UPDATEPREDECESSOR";
            arity(v, &args, 2)?;
            Ok(Command::UpdatePredecessor(addr_arg(v, args[0], args[1])?))
        }
        // UPDATESUCCESSOR <ip> <port>
        "UPDATESUCCESSOR" => {
            let v = "UPDATESUCCESSOR";
            arity(v, &args, 2)?;
            Ok(Command::UpdateSuccessor(addr_arg(v, args[0], args[1])?))
        }
        // FINDPREDECESSOR <ip> <port>
        "FINDPREDECESSOR" => {
            let v = "FINDPREDECESSOR";
            arity(v, &args, 2)?;
            Ok(Command::FindPredecessor(addr_arg(v, args[0], args[1])?))
        }
        // FORWARD <key> <degree> <len>
        "FORWARD" => {
            let v = "FORWARD";
            arity(v, &args, 3)?;
            Ok(Command::Forward {
                key: key_arg(v, args[0])?,
                degree: num_arg(v, "replication degree", args[1])?,
                len: num_arg(v, "body length", args[2])?,
            })
        }
        // REPLICATE <key> <degree> <len>
        "REPLICATE" => {
            let v = "REPLICATE";
            arity(v, &args, 3)?;
            Ok(Command::Replicate {
                key: key_arg(v, args[0])?,
                degree: num_arg(v, "replication degree", args[1])?,
                len: num_arg(v, "body length", args[2])?,
            })
        }
        // RESTORE <key> <ip> <port>
        "RESTORE" => {
            let v = "RESTORE";
            arity(v, &args, 3)?;
            Ok(Command::Restore {
                key: key_arg(v, args[0])?,
                requester: addr_arg(v, args[1], args[2])?,
            })
        }
        // RESTORED <key> <len>
        "RESTORED" => {
            let v = "RESTORED";
            arity(v, &args, 2)?;
            Ok(Command::Restored {
                key: key_arg(v, args[0])?,
                len: num_arg(v, "body length", args[1])?,
            })
        }
        // DELETE <key> <ip> <port>
        "DELETE" => {
            let v = "DELETE";
            arity(v, &args, 3)?;
            Ok(Command::Delete {
                key: key_arg(v, args[0])?,
                requester: addr_arg(v, args[1], args[2])?,
            })
        }
        // REMOVED <key> <ip> <port> <len>
        "REMOVED" => {
            let v = "REMOVED";
            arity(v, &args, 4)?;
            Ok(Command::Removed {
                key: key_arg(v, args[0])?,
                holder: addr_arg(v, args[1], args[2])?,
                len: num_arg(v, "body length", args[3])?,
            })
        }
        // UPDATETABLE <key> <ip> <port>
        "UPDATETABLE" => {
            let v = "UPDATETABLE";
            arity(v, &args, 3)?;
            Ok(Command::UpdateTable {
                key: key_arg(v, args[0])?,
                holder: addr_arg(v, args[1], args[2])?,
            })
        }
        other => Err(ProtocolError::UnknownVerb(other.to_string())),
    }
}

/// Reply lines sent back on the same connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Predecessor(Option<SocketAddr>),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Predecessor(Some(addr)) => write!(f, "PREDECESSOR {} {}", addr.ip(), addr.port()),
            Reply::Predecessor(None) => write!(f, "PREDECESSOR NONE"),
        }
    }
}

pub fn parse_reply(line: &str) -> Result<Reply, ProtocolError> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or(ProtocolError::Empty)?;
    let args: Vec<&str> = words.collect();

    match (verb, args.as_slice()) {
        ("PREDECESSOR", ["NONE"]) => Ok(Reply::Predecessor(None)),
        ("PREDECESSOR", [ip, port]) => Ok(Reply::Predecessor(Some(addr_arg("PREDECESSOR", ip, port)?))),
        ("PREDECESSOR", rest) => Err(ProtocolError::Arity {
            verb: "PREDECESSOR",
            expected: 2,
            got: rest.len(),
        }),
        (other, _) => Err(ProtocolError::UnknownVerb(other.to_string())),
    }
}

/* --- argument helpers --- */

fn arity(verb: &'static str, args: &[&str], expected: usize) -> Result<(), ProtocolError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ProtocolError::Arity { verb, expected, got: args.len() })
    }
}

fn num_arg<T: std::str::FromStr>(verb: &'static str, field: &'static str, raw: &str) -> Result<T, ProtocolError> {
    raw.parse::<T>().map_err(|_| ProtocolError::InvalidArgument {
        verb,
        field,
        value: raw.to_string(),
    })
}

fn key_arg(verb: &'static str, raw: &str) -> Result<RingId, ProtocolError> {
    num_arg(verb, "key", raw).map(RingId)
}

fn addr_arg(verb: &'static str, ip: &str, port: &str) -> Result<SocketAddr, ProtocolError> {
    let ip: IpAddr = num_arg(verb, "ip", ip)?;
    let port: u16 = num_arg(verb, "port", port)?;
    Ok(SocketAddr::new(ip, port))
}
