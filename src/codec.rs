//! # Control-Protocol Codec
//!
//! This module defines the line-oriented control protocol shared by seeds and
//! peers. Every frame is a single newline-terminated ASCII line whose first
//! token names the kind; remaining tokens are space-separated fields. Node
//! identifiers render as `ip:port`.
//!
//! | Kind | Fields | Direction |
//! |------|--------|-----------|
//! | `REGISTER` | peer_ip peer_port | peer → seed |
//! | `PROPOSE_ADD` | peer_ip peer_port proposer | seed → seed |
//! | `VOTE_ADD` | peer_ip peer_port voter | seed → seed |
//! | `COMMIT_ADD` | peer_ip peer_port | seed → seed/peer |
//! | `PEER_LIST` | [ip:port]* | seed → peer |
//! | `DEG_QUERY` | (none) | peer → peer |
//! | `DEG_REPLY` | degree | peer → peer |
//! | `CONNECT` | peer_ip peer_port | peer → peer |
//! | `GOSSIP` | originator seq_no timestamp payload | peer → peer |
//! | `PING` | nonce | peer → peer |
//! | `PONG` | nonce | peer → peer |
//! | `DEAD_NODE` | dead_ip dead_port reporter_ip reporter_port timestamp | peer/seed → seed, peer → peer |
//! | `PROPOSE_REMOVE` | peer_ip peer_port proposer | seed → seed |
//!
//! The `GOSSIP` payload is the final field and extends to end of line; it
//! contains colons but never spaces. Parsing fails closed: a malformed line
//! yields a [`ParseError`] and is dropped by the caller, never half-applied.

use std::fmt;

use crate::identity::NodeId;

/// One frame of the control protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Register { peer: NodeId },
    ProposeAdd { peer: NodeId, proposer: NodeId },
    VoteAdd { peer: NodeId, voter: NodeId },
    CommitAdd { peer: NodeId },
    PeerList { peers: Vec<NodeId> },
    DegQuery,
    DegReply { degree: u32 },
    Connect { peer: NodeId },
    Gossip {
        originator: NodeId,
        seq_no: u64,
        timestamp: u64,
        payload: String,
    },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    DeadNode {
        dead: NodeId,
        reporter: NodeId,
        timestamp: u64,
    },
    ProposeRemove { peer: NodeId, proposer: NodeId },
}

impl Frame {
    /// Wire name of this frame's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "REGISTER",
            Frame::ProposeAdd { .. } => "PROPOSE_ADD",
            Frame::VoteAdd { .. } => "VOTE_ADD",
            Frame::CommitAdd { .. } => "COMMIT_ADD",
            Frame::PeerList { .. } => "PEER_LIST",
            Frame::DegQuery => "DEG_QUERY",
            Frame::DegReply { .. } => "DEG_REPLY",
            Frame::Connect { .. } => "CONNECT",
            Frame::Gossip { .. } => "GOSSIP",
            Frame::Ping { .. } => "PING",
            Frame::Pong { .. } => "PONG",
            Frame::DeadNode { .. } => "DEAD_NODE",
            Frame::ProposeRemove { .. } => "PROPOSE_REMOVE",
        }
    }

    /// Render the frame as its wire line, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Frame::Register { peer } => {
                format!("REGISTER {} {}", peer.ip, peer.port)
            }
            Frame::ProposeAdd { peer, proposer } => {
                format!("PROPOSE_ADD {} {} {}", peer.ip, peer.port, proposer)
            }
            Frame::VoteAdd { peer, voter } => {
                format!("VOTE_ADD {} {} {}", peer.ip, peer.port, voter)
            }
            Frame::CommitAdd { peer } => {
                format!("COMMIT_ADD {} {}", peer.ip, peer.port)
            }
            Frame::PeerList { peers } => {
                let mut line = String::from("PEER_LIST");
                for p in peers {
                    line.push(' ');
                    line.push_str(&p.to_string());
                }
                line
            }
            Frame::DegQuery => "DEG_QUERY".to_string(),
            Frame::DegReply { degree } => format!("DEG_REPLY {degree}"),
            Frame::Connect { peer } => {
                format!("CONNECT {} {}", peer.ip, peer.port)
            }
            Frame::Gossip {
                originator,
                seq_no,
                timestamp,
                payload,
            } => {
                format!("GOSSIP {originator} {seq_no} {timestamp} {payload}")
            }
            Frame::Ping { nonce } => format!("PING {nonce}"),
            Frame::Pong { nonce } => format!("PONG {nonce}"),
            Frame::DeadNode {
                dead,
                reporter,
                timestamp,
            } => format!(
                "DEAD_NODE {} {} {} {} {}",
                dead.ip, dead.port, reporter.ip, reporter.port, timestamp
            ),
            Frame::ProposeRemove { peer, proposer } => {
                format!("PROPOSE_REMOVE {} {} {}", peer.ip, peer.port, proposer)
            }
        }
    }

    /// Parse one wire line (no trailing newline).
    pub fn parse(line: &str) -> Result<Frame, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let kind = tokens.next().ok_or(ParseError::Empty)?;

        match kind {
            "REGISTER" => Ok(Frame::Register {
                peer: take_addr_pair(&mut tokens)?,
            }),
            "PROPOSE_ADD" => Ok(Frame::ProposeAdd {
                peer: take_addr_pair(&mut tokens)?,
                proposer: take_node_id(&mut tokens, "proposer")?,
            }),
            "VOTE_ADD" => Ok(Frame::VoteAdd {
                peer: take_addr_pair(&mut tokens)?,
                voter: take_node_id(&mut tokens, "voter")?,
            }),
            "COMMIT_ADD" => Ok(Frame::CommitAdd {
                peer: take_addr_pair(&mut tokens)?,
            }),
            "PEER_LIST" => {
                let mut peers = Vec::new();
                for t in tokens {
                    peers.push(parse_node_id(t, "peer_list entry")?);
                }
                Ok(Frame::PeerList { peers })
            }
            "DEG_QUERY" => Ok(Frame::DegQuery),
            "DEG_REPLY" => Ok(Frame::DegReply {
                degree: take_number(&mut tokens, "degree")?,
            }),
            "CONNECT" => Ok(Frame::Connect {
                peer: take_addr_pair(&mut tokens)?,
            }),
            "GOSSIP" => {
                // Payload is the fourth field onward, taken verbatim.
                let mut parts = line.splitn(5, ' ');
                parts.next(); // kind
                let originator =
                    parse_node_id(parts.next().ok_or(ParseError::MissingField("originator"))?, "originator")?;
                let seq_no = parse_number(parts.next().ok_or(ParseError::MissingField("seq_no"))?, "seq_no")?;
                let timestamp =
                    parse_number(parts.next().ok_or(ParseError::MissingField("timestamp"))?, "timestamp")?;
                let payload = parts.next().ok_or(ParseError::MissingField("payload"))?;
                if payload.is_empty() {
                    return Err(ParseError::MissingField("payload"));
                }
                Ok(Frame::Gossip {
                    originator,
                    seq_no,
                    timestamp,
                    payload: payload.to_string(),
                })
            }
            "PING" => Ok(Frame::Ping {
                nonce: take_number(&mut tokens, "nonce")?,
            }),
            "PONG" => Ok(Frame::Pong {
                nonce: take_number(&mut tokens, "nonce")?,
            }),
            "DEAD_NODE" => Ok(Frame::DeadNode {
                dead: take_addr_pair(&mut tokens)?,
                reporter: take_addr_pair(&mut tokens)?,
                timestamp: take_number(&mut tokens, "timestamp")?,
            }),
            "PROPOSE_REMOVE" => Ok(Frame::ProposeRemove {
                peer: take_addr_pair(&mut tokens)?,
                proposer: take_node_id(&mut tokens, "proposer")?,
            }),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

fn take_addr_pair<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<NodeId, ParseError> {
    let ip = tokens.next().ok_or(ParseError::MissingField("ip"))?;
    let port = tokens.next().ok_or(ParseError::MissingField("port"))?;
    let ip = ip
        .parse()
        .map_err(|_| ParseError::InvalidField("ip", ip.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| ParseError::InvalidField("port", port.to_string()))?;
    Ok(NodeId::new(ip, port))
}

fn take_node_id<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<NodeId, ParseError> {
    let t = tokens.next().ok_or(ParseError::MissingField(field))?;
    parse_node_id(t, field)
}

fn parse_node_id(token: &str, field: &'static str) -> Result<NodeId, ParseError> {
    token
        .parse()
        .map_err(|_| ParseError::InvalidField(field, token.to_string()))
}

fn take_number<'a, T: std::str::FromStr>(
    tokens: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<T, ParseError> {
    let t = tokens.next().ok_or(ParseError::MissingField(field))?;
    parse_number(t, field)
}

fn parse_number<T: std::str::FromStr>(token: &str, field: &'static str) -> Result<T, ParseError> {
    token
        .parse()
        .map_err(|_| ParseError::InvalidField(field, token.to_string()))
}

/// Why a wire line failed to parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownKind(String),
    MissingField(&'static str),
    InvalidField(&'static str, String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty frame"),
            Self::UnknownKind(k) => write!(f, "unknown frame kind {k:?}"),
            Self::MissingField(field) => write!(f, "missing field {field}"),
            Self::InvalidField(field, value) => {
                write!(f, "invalid {field}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn id(port: u16) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn round_trip(frame: Frame) {
        let line = frame.encode();
        let decoded = Frame::parse(&line).expect("parse should succeed");
        assert_eq!(decoded, frame, "round trip of {line:?}");
    }

    #[test]
    fn all_kinds_round_trip() {
        round_trip(Frame::Register { peer: id(6001) });
        round_trip(Frame::ProposeAdd {
            peer: id(6001),
            proposer: id(5001),
        });
        round_trip(Frame::VoteAdd {
            peer: id(6001),
            voter: id(5002),
        });
        round_trip(Frame::CommitAdd { peer: id(6001) });
        round_trip(Frame::PeerList {
            peers: vec![id(6001), id(6002), id(6003)],
        });
        round_trip(Frame::PeerList { peers: vec![] });
        round_trip(Frame::DegQuery);
        round_trip(Frame::DegReply { degree: 7 });
        round_trip(Frame::Connect { peer: id(6001) });
        round_trip(Frame::Gossip {
            originator: id(6001),
            seq_no: 3,
            timestamp: 1_700_000_000,
            payload: "1700000000:127.0.0.1:6001:3".to_string(),
        });
        round_trip(Frame::Ping { nonce: u64::MAX });
        round_trip(Frame::Pong { nonce: 0 });
        round_trip(Frame::DeadNode {
            dead: id(6002),
            reporter: id(6001),
            timestamp: 1_700_000_000,
        });
        round_trip(Frame::ProposeRemove {
            peer: id(6002),
            proposer: id(5001),
        });
    }

    #[test]
    fn gossip_payload_keeps_colons() {
        let line = "GOSSIP 127.0.0.1:6001 1 1700000000 1700000000:127.0.0.1:6001:1";
        match Frame::parse(line).unwrap() {
            Frame::Gossip { payload, .. } => {
                assert_eq!(payload, "1700000000:127.0.0.1:6001:1");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn trailing_newline_tolerated() {
        let frame = Frame::parse("PING 42\n").unwrap();
        assert_eq!(frame, Frame::Ping { nonce: 42 });
    }

    #[test]
    fn malformed_lines_rejected() {
        assert_eq!(Frame::parse(""), Err(ParseError::Empty));
        assert!(matches!(
            Frame::parse("FROBNICATE 1 2"),
            Err(ParseError::UnknownKind(_))
        ));
        assert!(matches!(
            Frame::parse("REGISTER 127.0.0.1"),
            Err(ParseError::MissingField("port"))
        ));
        assert!(matches!(
            Frame::parse("REGISTER nothost 6001"),
            Err(ParseError::InvalidField("ip", _))
        ));
        assert!(matches!(
            Frame::parse("DEG_REPLY many"),
            Err(ParseError::InvalidField("degree", _))
        ));
        assert!(matches!(
            Frame::parse("GOSSIP 127.0.0.1:6001 1 1700000000"),
            Err(ParseError::MissingField("payload"))
        ));
        assert!(matches!(
            Frame::parse("DEAD_NODE 127.0.0.1 6002 127.0.0.1 6001"),
            Err(ParseError::MissingField("timestamp"))
        ));
    }

    #[test]
    fn peer_list_rejects_bare_ips() {
        assert!(Frame::parse("PEER_LIST 127.0.0.1").is_err());
    }

    #[test]
    fn kind_names_match_wire() {
        assert_eq!(Frame::DegQuery.kind(), "DEG_QUERY");
        assert_eq!(Frame::Register { peer: id(1) }.kind(), "REGISTER");
        assert_eq!(
            Frame::ProposeRemove {
                peer: id(1),
                proposer: id(2)
            }
            .kind(),
            "PROPOSE_REMOVE"
        );
    }
}
