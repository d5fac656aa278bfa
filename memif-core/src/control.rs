//! Control message codec.
//!
//! Every control message is exactly 128 bytes on the wire: a 2-byte
//! little-endian message kind followed by a fixed payload, zero-padded
//! to [`MSG_SIZE`]. Messages travel over a sequenced-packet socket, so
//! there is no framing prefix; ADD_REGION and ADD_RING each carry one
//! file descriptor as SCM_RIGHTS ancillary data (handled by the
//! transport layer, not here).

use crate::error::{Error, Result};
use crate::types::{PortMode, Secret};

/// Size of every control message on the wire.
pub const MSG_SIZE: usize = 128;

/// ADD_RING flag bit 0: the ring is server-bound (client transmits).
pub const ADD_RING_FLAG_S2M: u16 = 1 << 0;

const NAME_LEN: usize = 32;
const REASON_LEN: usize = 96;

/// Control message kind, the first two bytes of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgKind {
    /// Positive acknowledgement, no payload.
    Ack = 1,
    /// Server greeting with supported parameter ranges.
    Hello = 2,
    /// Client identification and secret.
    Init = 3,
    /// Client announces a memory region (carries the region fd).
    AddRegion = 4,
    /// Client announces a ring (carries the interrupt fd).
    AddRing = 5,
    /// Client requests the connected state.
    Connect = 6,
    /// Server confirms the connected state.
    Connected = 7,
    /// Either side tears the channel down with a reason.
    Disconnect = 8,
}

impl MsgKind {
    /// Decodes a kind value, if known.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Ack),
            2 => Some(Self::Hello),
            3 => Some(Self::Init),
            4 => Some(Self::AddRegion),
            5 => Some(Self::AddRing),
            6 => Some(Self::Connect),
            7 => Some(Self::Connected),
            8 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// HELLO payload: application name and supported parameter ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Server application name.
    pub name: String,
    /// Lowest protocol version the server accepts.
    pub version_min: u16,
    /// Highest protocol version the server accepts.
    pub version_max: u16,
    /// Highest region index the server accepts.
    pub max_region: u16,
    /// Most M2S rings the server accepts.
    pub max_ring_m2s: u16,
    /// Most S2M rings the server accepts.
    pub max_ring_s2m: u16,
    /// Largest log2 ring size the server accepts.
    pub max_log2_ring_size: u8,
}

/// INIT payload: client identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    /// Protocol version the client runs; must match the server exactly.
    pub version: u16,
    /// Identifier of the server-role port the client wants.
    pub id: u32,
    /// Framing mode; always Ethernet.
    pub mode: PortMode,
    /// Shared secret; must match the port's configured secret.
    pub secret: Secret,
    /// Client application name.
    pub name: String,
}

/// ADD_REGION payload; the region fd rides along as ancillary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRegion {
    /// Region index within the port's region table.
    pub index: u16,
    /// Region size in bytes.
    pub size: u64,
}

/// ADD_RING payload; the interrupt fd rides along as ancillary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRing {
    /// Bit 0 ([`ADD_RING_FLAG_S2M`]) marks a server-bound ring.
    pub flags: u16,
    /// Queue-pair index of the ring.
    pub index: u16,
    /// Region the ring lives in.
    pub region: u16,
    /// Ring offset within the region.
    pub offset: u32,
    /// Ring size as log2 of the slot count.
    pub log2_ring_size: u8,
    /// Private header bytes per buffer; always zero.
    pub private_hdr_size: u16,
}

/// CONNECT payload: the client's interface name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client interface name.
    pub name: String,
}

/// CONNECTED payload: the server's interface name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    /// Server interface name.
    pub name: String,
}

/// DISCONNECT payload: reason for teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Numeric disconnect code; zero in practice.
    pub code: u32,
    /// Human-readable reason.
    pub reason: String,
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Positive acknowledgement.
    Ack,
    /// Server greeting.
    Hello(Hello),
    /// Client identification.
    Init(Init),
    /// Region announcement.
    AddRegion(AddRegion),
    /// Ring announcement.
    AddRing(AddRing),
    /// Connection request.
    Connect(Connect),
    /// Connection confirmation.
    Connected(Connected),
    /// Teardown notice.
    Disconnect(Disconnect),
}

fn put_u16(buf: &mut [u8; MSG_SIZE], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8; MSG_SIZE], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8; MSG_SIZE], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(buf: &[u8; MSG_SIZE], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8; MSG_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn get_u64(buf: &[u8; MSG_SIZE], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(b)
}

/// Copies a string into a fixed field, truncating or zero-padding.
fn put_str(buf: &mut [u8; MSG_SIZE], offset: usize, len: usize, s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf[offset..offset + n].copy_from_slice(&bytes[..n]);
}

/// Reads a fixed text field, stopping at the first NUL.
fn get_str(buf: &[u8; MSG_SIZE], offset: usize, len: usize) -> String {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

impl ControlMsg {
    /// Returns the wire kind of this message.
    #[must_use]
    pub fn kind(&self) -> MsgKind {
        match self {
            Self::Ack => MsgKind::Ack,
            Self::Hello(_) => MsgKind::Hello,
            Self::Init(_) => MsgKind::Init,
            Self::AddRegion(_) => MsgKind::AddRegion,
            Self::AddRing(_) => MsgKind::AddRing,
            Self::Connect(_) => MsgKind::Connect,
            Self::Connected(_) => MsgKind::Connected,
            Self::Disconnect(_) => MsgKind::Disconnect,
        }
    }

    /// Returns true if this message kind must carry an ancillary fd.
    #[must_use]
    pub fn wants_fd(&self) -> bool {
        matches!(self, Self::AddRegion(_) | Self::AddRing(_))
    }

    /// Encodes the message into a 128-byte wire buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; MSG_SIZE] {
        let mut buf = [0u8; MSG_SIZE];
        put_u16(&mut buf, 0, self.kind() as u16);
        match self {
            Self::Ack => {}
            Self::Hello(m) => {
                put_str(&mut buf, 2, NAME_LEN, &m.name);
                put_u16(&mut buf, 34, m.version_min);
                put_u16(&mut buf, 36, m.version_max);
                put_u16(&mut buf, 38, m.max_region);
                put_u16(&mut buf, 40, m.max_ring_m2s);
                put_u16(&mut buf, 42, m.max_ring_s2m);
                buf[44] = m.max_log2_ring_size;
            }
            Self::Init(m) => {
                put_u16(&mut buf, 2, m.version);
                put_u32(&mut buf, 4, m.id);
                buf[8] = m.mode as u8;
                buf[9..33].copy_from_slice(&m.secret.0);
                put_str(&mut buf, 33, NAME_LEN, &m.name);
            }
            Self::AddRegion(m) => {
                put_u16(&mut buf, 2, m.index);
                put_u64(&mut buf, 4, m.size);
            }
            Self::AddRing(m) => {
                put_u16(&mut buf, 2, m.flags);
                put_u16(&mut buf, 4, m.index);
                put_u16(&mut buf, 6, m.region);
                put_u32(&mut buf, 8, m.offset);
                buf[12] = m.log2_ring_size;
                put_u16(&mut buf, 13, m.private_hdr_size);
            }
            Self::Connect(m) => {
                put_str(&mut buf, 2, NAME_LEN, &m.name);
            }
            Self::Connected(m) => {
                put_str(&mut buf, 2, NAME_LEN, &m.name);
            }
            Self::Disconnect(m) => {
                put_u32(&mut buf, 2, m.code);
                put_str(&mut buf, 6, REASON_LEN, &m.reason);
            }
        }
        buf
    }

    /// Decodes a 128-byte wire buffer.
    ///
    /// # Errors
    /// Returns [`Error::UnknownMessage`] for an unrecognised kind or
    /// mode byte. Higher-level validation (versions, ids, secrets)
    /// belongs to the control channel.
    pub fn decode(buf: &[u8; MSG_SIZE]) -> Result<Self> {
        let kind = get_u16(buf, 0);
        let kind = MsgKind::from_u16(kind).ok_or(Error::UnknownMessage(kind))?;
        let msg = match kind {
            MsgKind::Ack => Self::Ack,
            MsgKind::Hello => Self::Hello(Hello {
                name: get_str(buf, 2, NAME_LEN),
                version_min: get_u16(buf, 34),
                version_max: get_u16(buf, 36),
                max_region: get_u16(buf, 38),
                max_ring_m2s: get_u16(buf, 40),
                max_ring_s2m: get_u16(buf, 42),
                max_log2_ring_size: buf[44],
            }),
            MsgKind::Init => {
                let mut secret = Secret::default();
                secret.0.copy_from_slice(&buf[9..33]);
                Self::Init(Init {
                    version: get_u16(buf, 2),
                    id: get_u32(buf, 4),
                    mode: PortMode::from_u8(buf[8]).ok_or(Error::UnknownMessage(buf[8] as u16))?,
                    secret,
                    name: get_str(buf, 33, NAME_LEN),
                })
            }
            MsgKind::AddRegion => Self::AddRegion(AddRegion {
                index: get_u16(buf, 2),
                size: get_u64(buf, 4),
            }),
            MsgKind::AddRing => Self::AddRing(AddRing {
                flags: get_u16(buf, 2),
                index: get_u16(buf, 4),
                region: get_u16(buf, 6),
                offset: get_u32(buf, 8),
                log2_ring_size: buf[12],
                private_hdr_size: get_u16(buf, 13),
            }),
            MsgKind::Connect => Self::Connect(Connect {
                name: get_str(buf, 2, NAME_LEN),
            }),
            MsgKind::Connected => Self::Connected(Connected {
                name: get_str(buf, 2, NAME_LEN),
            }),
            MsgKind::Disconnect => Self::Disconnect(Disconnect {
                code: get_u32(buf, 2),
                reason: get_str(buf, 6, REASON_LEN),
            }),
        };
        Ok(msg)
    }
}
