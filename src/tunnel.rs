//! Tunnel packet framing.
//!
//! The inner protocol carried inside DNS record data. Every packet starts
//! with a fixed 5-byte header (`packet_id u16 | type u8 | session_id u16`,
//! big-endian) followed by a type-specific body. The `packet_id` is echoed
//! in the paired reply so stale answers can be discarded.
//!
//! MSG bodies have two layouts: the normal `seq/ack/data` stream framing,
//! and `chunk/data` when the session was opened with
//! [`OPT_CHUNKED_DOWNLOAD`]. Decoding therefore takes the session's option
//! word.

use bytes::Bytes;
use thiserror::Error;

/// Fixed header length.
pub const HEADER_LEN: usize = 5;

pub const TYPE_SYN: u8 = 0x00;
pub const TYPE_MSG: u8 = 0x01;
pub const TYPE_FIN: u8 = 0x02;
pub const TYPE_PING: u8 = 0xFF;

/// SYN carries a trailing NUL-terminated session name.
pub const OPT_NAME: u16 = 0x0001;
/// SYN carries a trailing NUL-terminated download filename.
pub const OPT_DOWNLOAD: u16 = 0x0008;
/// MSG bodies use chunk framing instead of seq/ack.
pub const OPT_CHUNKED_DOWNLOAD: u16 = 0x0010;
/// The stream carries the framed command sub-protocol.
pub const OPT_COMMAND: u16 = 0x0020;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("tunnel packet truncated")]
    Truncated,

    #[error("unknown tunnel packet type {0:#04x}")]
    UnknownType(u8),

    #[error("malformed string field")]
    BadString,
}

/// Type-specific packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Syn {
        seq: u16,
        options: u16,
        name: Option<String>,
        download: Option<String>,
    },
    Msg {
        seq: u16,
        ack: u16,
        data: Bytes,
    },
    ChunkedMsg {
        chunk: u32,
        data: Bytes,
    },
    Fin {
        reason: String,
    },
    Ping {
        ping_id: String,
    },
}

/// One tunnel packet, the unit of a DNS exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_id: u16,
    pub session_id: u16,
    pub body: Body,
}

impl Packet {
    pub fn kind(&self) -> u8 {
        match self.body {
            Body::Syn { .. } => TYPE_SYN,
            Body::Msg { .. } | Body::ChunkedMsg { .. } => TYPE_MSG,
            Body::Fin { .. } => TYPE_FIN,
            Body::Ping { .. } => TYPE_PING,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 8);
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        buf.push(self.kind());
        buf.extend_from_slice(&self.session_id.to_be_bytes());

        match &self.body {
            Body::Syn {
                seq,
                options,
                name,
                download,
            } => {
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&options.to_be_bytes());
                if let Some(name) = name {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                if let Some(download) = download {
                    buf.extend_from_slice(download.as_bytes());
                    buf.push(0);
                }
            }
            Body::Msg { seq, ack, data } => {
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&ack.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Body::ChunkedMsg { chunk, data } => {
                buf.extend_from_slice(&chunk.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Body::Fin { reason } => buf.extend_from_slice(reason.as_bytes()),
            Body::Ping { ping_id } => buf.extend_from_slice(ping_id.as_bytes()),
        }
        buf
    }

    /// Decode a packet. `session_options` selects the MSG body layout; pass
    /// zero when no session exists yet (SYN and PING do not depend on it).
    pub fn decode(buf: &[u8], session_options: u16) -> Result<Packet, FrameError> {
        let mut pos = 0usize;
        let packet_id = read_u16(buf, &mut pos)?;
        let kind = *buf.get(pos).ok_or(FrameError::Truncated)?;
        pos += 1;
        let session_id = read_u16(buf, &mut pos)?;

        let body = match kind {
            TYPE_SYN => {
                let seq = read_u16(buf, &mut pos)?;
                let options = read_u16(buf, &mut pos)?;
                let name = if options & OPT_NAME != 0 {
                    Some(read_cstr(buf, &mut pos)?)
                } else {
                    None
                };
                let download = if options & OPT_DOWNLOAD != 0 {
                    Some(read_cstr(buf, &mut pos)?)
                } else {
                    None
                };
                Body::Syn {
                    seq,
                    options,
                    name,
                    download,
                }
            }
            TYPE_MSG if session_options & OPT_CHUNKED_DOWNLOAD != 0 => {
                let chunk = read_u32(buf, &mut pos)?;
                Body::ChunkedMsg {
                    chunk,
                    data: Bytes::copy_from_slice(&buf[pos..]),
                }
            }
            TYPE_MSG => {
                let seq = read_u16(buf, &mut pos)?;
                let ack = read_u16(buf, &mut pos)?;
                Body::Msg {
                    seq,
                    ack,
                    data: Bytes::copy_from_slice(&buf[pos..]),
                }
            }
            TYPE_FIN => Body::Fin {
                reason: read_tail(buf, pos)?,
            },
            TYPE_PING => Body::Ping {
                ping_id: read_tail(buf, pos)?,
            },
            other => return Err(FrameError::UnknownType(other)),
        };

        Ok(Packet {
            packet_id,
            session_id,
            body,
        })
    }
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, FrameError> {
    let bytes = buf.get(*pos..*pos + 2).ok_or(FrameError::Truncated)?;
    *pos += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, FrameError> {
    let bytes = buf.get(*pos..*pos + 4).ok_or(FrameError::Truncated)?;
    *pos += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// NUL-terminated UTF-8 string; `*pos` lands past the terminator.
fn read_cstr(buf: &[u8], pos: &mut usize) -> Result<String, FrameError> {
    let rest = buf.get(*pos..).ok_or(FrameError::Truncated)?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(FrameError::Truncated)?;
    let s = std::str::from_utf8(&rest[..nul]).map_err(|_| FrameError::BadString)?;
    *pos += nul + 1;
    Ok(s.to_string())
}

/// UTF-8 string running to the end of the packet.
fn read_tail(buf: &[u8], pos: usize) -> Result<String, FrameError> {
    let rest = buf.get(pos..).ok_or(FrameError::Truncated)?;
    std::str::from_utf8(rest)
        .map(str::to_string)
        .map_err(|_| FrameError::BadString)
}
