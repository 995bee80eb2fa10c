//! Packet framing for the remote walk protocol
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +--------+---------+------------------+
//! | type   | length  | payload          |
//! | 1 byte | 4 bytes | variable         |
//! +--------+---------+------------------+
//! ```
//!
//! Payloads:
//! - STAT: JSON encoded [`Stat`], empty at end of walk
//! - REQ:  id:4
//! - DATA: id:4, content bytes (none at end of file)
//! - FIN:  no payload
//! - ERR:  UTF-8 message

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::stat::Stat;

/// Packet type identifiers
pub mod packet_type {
    pub const STAT: u8 = 0;
    pub const REQ: u8 = 1;
    pub const DATA: u8 = 2;
    pub const FIN: u8 = 3;
    pub const ERR: u8 = 4;
}

const HEADER_LEN: usize = 5;

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Next walk entry, or `None` at end of walk
    Stat(Option<Stat>),
    /// Request the content of file `id`
    Req { id: u32 },
    /// Content chunk for file `id`; empty at end of file
    Data { id: u32, data: Bytes },
    /// The receiver has everything it asked for
    Fin,
    /// Abort the stream
    Err(String),
}

/// tokio-util codec for [`Packet`]s
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_frame_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_size {
            return Err(SyncError::protocol_error(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame_size
            )));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut payload = src.split_to(len).freeze();

        let packet = match kind {
            packet_type::STAT if payload.is_empty() => Packet::Stat(None),
            packet_type::STAT => Packet::Stat(Some(serde_json::from_slice(&payload)?)),
            packet_type::REQ => Packet::Req { id: read_id(&mut payload)? },
            packet_type::DATA => {
                let id = read_id(&mut payload)?;
                Packet::Data { id, data: payload }
            }
            packet_type::FIN => Packet::Fin,
            packet_type::ERR => Packet::Err(String::from_utf8_lossy(&payload).into_owned()),
            other => {
                return Err(SyncError::protocol_error(format!("unknown packet type {}", other)));
            }
        };
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = SyncError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, payload) = match item {
            Packet::Stat(None) => (packet_type::STAT, Bytes::new()),
            Packet::Stat(Some(stat)) => (packet_type::STAT, Bytes::from(serde_json::to_vec(&stat)?)),
            Packet::Req { id } => (packet_type::REQ, Bytes::copy_from_slice(&id.to_be_bytes())),
            Packet::Data { id, data } => {
                let mut buf = BytesMut::with_capacity(4 + data.len());
                buf.put_u32(id);
                buf.put_slice(&data);
                (packet_type::DATA, buf.freeze())
            }
            Packet::Fin => (packet_type::FIN, Bytes::new()),
            Packet::Err(message) => (packet_type::ERR, Bytes::from(message.into_bytes())),
        };
        if payload.len() > self.max_frame_size {
            return Err(SyncError::protocol_error(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(kind);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

fn read_id(payload: &mut Bytes) -> Result<u32, SyncError> {
    if payload.len() < 4 {
        return Err(SyncError::protocol_error("packet too short for file id"));
    }
    Ok(payload.get_u32())
}

/// Outgoing half of a framed connection
pub type PacketSink<T> = SplitSink<Framed<T, PacketCodec>, Packet>;
/// Incoming half of a framed connection
pub type PacketStream<T> = SplitStream<Framed<T, PacketCodec>>;

/// Split a byte stream into a packet sink and a packet stream
pub fn framed<T>(io: T) -> (PacketSink<T>, PacketStream<T>)
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, PacketCodec::new()).split()
}

/// Like [`framed`], with a configured frame limit
pub fn framed_with_config<T>(io: T, config: &EngineConfig) -> (PacketSink<T>, PacketStream<T>)
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, PacketCodec::with_config(config)).split()
}
