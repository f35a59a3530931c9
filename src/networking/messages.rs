use crate::constants::{CONTROL_MESSAGE_SIZE, MAX_DATAGRAM_SIZE};
use crate::networking::peer_info::PeerInfo;
use std::fmt::Display;
use thiserror::Error;

/// Errors produced while encoding or decoding wire messages. Parsing is
/// strict: a datagram that does not match one of the three message forms is
/// dropped by the caller, never partially applied.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("malformed {command} message: missing {field}")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
    #[error("malformed {command} message: bad {field} '{value}'")]
    BadField {
        command: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("file name '{0}' cannot travel on a whitespace-delimited wire")]
    UnencodableFileName(String),
    #[error("encoded message exceeds {limit} bytes")]
    TooLong { limit: usize },
    #[error("control record is not valid UTF-8")]
    BadEncoding,
}

///
/// The three datagram messages of the discovery protocol. All of them are
/// single ASCII datagrams with whitespace-separated tokens:
///
/// ```text
/// DISCOVERY <file_name> <total_chunks> <ttl> <orig_ip>:<orig_udp_port>
/// RESPONSE  <file_name> <link_speed> <chunk_id>...
/// REQUEST   <file_name> <chunk_id>...
/// ```
///
/// Encoding and decoding live here and nowhere else, so the wire format has
/// a single point of truth.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatagramMessage {
    /// "Who has chunks of this file?" Flooded with a bounded TTL; the
    /// requester field always names the node that originated the search,
    /// no matter how many hops the message took.
    Discovery {
        file_name: String,
        total_chunks: u32,
        ttl: u32,
        requester: PeerInfo,
    },
    /// "I hold these chunk ids, at this link speed." Sent directly to the
    /// original requester, never flooded.
    Offer {
        file_name: String,
        link_speed: u32,
        chunk_ids: Vec<u32>,
    },
    /// "Send me these chunk ids over the stream transport."
    Request {
        file_name: String,
        chunk_ids: Vec<u32>,
    },
}

impl DatagramMessage {
    /// Serializes the message, enforcing the single-datagram size limit.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let encoded = match self {
            DatagramMessage::Discovery {
                file_name,
                total_chunks,
                ttl,
                requester,
            } => {
                check_file_name(file_name)?;
                format!("DISCOVERY {} {} {} {}", file_name, total_chunks, ttl, requester)
            }
            DatagramMessage::Offer {
                file_name,
                link_speed,
                chunk_ids,
            } => {
                check_file_name(file_name)?;
                let mut message = format!("RESPONSE {} {}", file_name, link_speed);
                for id in chunk_ids {
                    message.push(' ');
                    message.push_str(&id.to_string());
                }
                message
            }
            DatagramMessage::Request {
                file_name,
                chunk_ids,
            } => {
                check_file_name(file_name)?;
                let mut message = format!("REQUEST {}", file_name);
                for id in chunk_ids {
                    message.push(' ');
                    message.push_str(&id.to_string());
                }
                message
            }
        };

        if encoded.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::TooLong {
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(encoded)
    }

    /// Parses a received datagram by its leading token.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let mut tokens = raw.split_whitespace();
        let command = tokens.next().ok_or(ProtocolError::Empty)?;

        match command {
            "DISCOVERY" => {
                let file_name = next_token(&mut tokens, "DISCOVERY", "file_name")?.to_string();
                let total_chunks = parse_number(&mut tokens, "DISCOVERY", "total_chunks")?;
                let ttl = parse_number(&mut tokens, "DISCOVERY", "ttl")?;
                let requester_token = next_token(&mut tokens, "DISCOVERY", "requester")?;
                let requester =
                    requester_token
                        .parse::<PeerInfo>()
                        .map_err(|_| ProtocolError::BadField {
                            command: "DISCOVERY",
                            field: "requester",
                            value: requester_token.to_string(),
                        })?;
                Ok(DatagramMessage::Discovery {
                    file_name,
                    total_chunks,
                    ttl,
                    requester,
                })
            }
            "RESPONSE" => {
                let file_name = next_token(&mut tokens, "RESPONSE", "file_name")?.to_string();
                let link_speed = parse_number(&mut tokens, "RESPONSE", "link_speed")?;
                let chunk_ids = parse_chunk_ids(tokens, "RESPONSE")?;
                Ok(DatagramMessage::Offer {
                    file_name,
                    link_speed,
                    chunk_ids,
                })
            }
            "REQUEST" => {
                let file_name = next_token(&mut tokens, "REQUEST", "file_name")?.to_string();
                let chunk_ids = parse_chunk_ids(tokens, "REQUEST")?;
                Ok(DatagramMessage::Request {
                    file_name,
                    chunk_ids,
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

}

impl Display for DatagramMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatagramMessage::Discovery {
                file_name,
                ttl,
                requester,
                ..
            } => write!(f, "Discovery('{}', ttl {}, for {})", file_name, ttl, requester),
            DatagramMessage::Offer {
                file_name,
                link_speed,
                chunk_ids,
            } => write!(
                f,
                "Offer('{}', {} chunks at {} B/s)",
                file_name,
                chunk_ids.len(),
                link_speed
            ),
            DatagramMessage::Request {
                file_name,
                chunk_ids,
            } => write!(f, "Request('{}', {} chunks)", file_name, chunk_ids.len()),
        }
    }
}

///
/// The fixed-size control record preceding every chunk on the stream
/// transport:
///
/// ```text
/// PUT <file_name> <chunk_id> <sender_link_speed> <chunk_size_bytes>
/// ```
///
/// zero-padded to exactly [`CONTROL_MESSAGE_SIZE`] bytes. Receivers read the
/// full record before interpreting any of it; the payload of exactly
/// `chunk_size` bytes follows immediately.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlHeader {
    pub file_name: String,
    pub chunk_id: u32,
    pub link_speed: u32,
    pub chunk_size: u64,
}

impl ControlHeader {
    pub fn encode(&self) -> Result<[u8; CONTROL_MESSAGE_SIZE], ProtocolError> {
        check_file_name(&self.file_name)?;
        let text = format!(
            "PUT {} {} {} {}",
            self.file_name, self.chunk_id, self.link_speed, self.chunk_size
        );
        // Leave at least one padding zero so the record always terminates.
        if text.len() >= CONTROL_MESSAGE_SIZE {
            return Err(ProtocolError::TooLong {
                limit: CONTROL_MESSAGE_SIZE - 1,
            });
        }

        let mut record = [0u8; CONTROL_MESSAGE_SIZE];
        record[..text.len()].copy_from_slice(text.as_bytes());
        Ok(record)
    }

    /// Parses a full control record. `raw` must be the complete
    /// [`CONTROL_MESSAGE_SIZE`]-byte buffer; padding zeros are stripped
    /// before tokenizing.
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = std::str::from_utf8(&raw[..end]).map_err(|_| ProtocolError::BadEncoding)?;

        let mut tokens = text.split_whitespace();
        let command = tokens.next().ok_or(ProtocolError::Empty)?;
        if command != "PUT" {
            return Err(ProtocolError::UnknownCommand(command.to_string()));
        }

        let file_name = next_token(&mut tokens, "PUT", "file_name")?.to_string();
        let chunk_id = parse_number(&mut tokens, "PUT", "chunk_id")?;
        let link_speed = parse_number(&mut tokens, "PUT", "link_speed")?;
        let chunk_size = parse_number(&mut tokens, "PUT", "chunk_size")?;
        Ok(ControlHeader {
            file_name,
            chunk_id,
            link_speed,
            chunk_size,
        })
    }
}

impl Display for ControlHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Put('{}' chunk {}, {} bytes at {} B/s)",
            self.file_name, self.chunk_id, self.chunk_size, self.link_speed
        )
    }
}

/// File names are opaque strings, but the wire is whitespace-tokenized, so
/// names containing whitespace (or nothing at all) are rejected up front.
fn check_file_name(file_name: &str) -> Result<(), ProtocolError> {
    if file_name.is_empty() || file_name.chars().any(|c| c.is_whitespace()) {
        return Err(ProtocolError::UnencodableFileName(file_name.to_string()));
    }
    Ok(())
}

fn next_token<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    command: &'static str,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    tokens
        .next()
        .ok_or(ProtocolError::MissingField { command, field })
}

fn parse_number<'a, N: std::str::FromStr>(
    tokens: &mut impl Iterator<Item = &'a str>,
    command: &'static str,
    field: &'static str,
) -> Result<N, ProtocolError> {
    let token = next_token(tokens, command, field)?;
    token.parse::<N>().map_err(|_| ProtocolError::BadField {
        command,
        field,
        value: token.to_string(),
    })
}

fn parse_chunk_ids<'a>(
    tokens: impl Iterator<Item = &'a str>,
    command: &'static str,
) -> Result<Vec<u32>, ProtocolError> {
    tokens
        .map(|token| {
            token.parse::<u32>().map_err(|_| ProtocolError::BadField {
                command,
                field: "chunk_id",
                value: token.to_string(),
            })
        })
        .collect()
}
