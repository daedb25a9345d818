use std::mem::size_of;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// Bound on how far ahead of the local receive / send state an incoming sequence or ack
///  number may legitimately be. Anything outside this window is treated as spoofed or
///  badly stale and dropped in O(1), without per-peer cryptographic state.
pub const SEQUENCE_WINDOW: i64 = 128;

/// The fixed-layout header at the start of every UDPX datagram: a one-byte packet type tag
///  followed by the type's sequencing fields. The (opaque) application payload starts
///  immediately after the header.
///
/// Sequence numbers are `i32` big-endian on the wire; they are widened to `i64` on decoding
///  so that window arithmetic near the `i32` boundaries (the initial sequence number is
///  chosen randomly in the negative range) cannot overflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketHeader {
    /// connection request, carries the proposed initial send sequence
    Handshake { initial_sequence: i64 },
    /// accept, carries the acceptor's own initial send sequence
    HandshakeAck { initial_sequence: i64 },
    /// best-effort payload, no ordering / no retry
    Unsequenced,
    /// reliable payload; `receive_ack` piggybacks the sender's own receive sequence
    Sequenced { sequence: i64, receive_ack: i64 },
    /// "please resend the packet with this sequence"
    Request { sequence: i64 },
    /// liveness probe; also advertises the sender's highest sent sequence so the peer
    ///  can detect gaps without new data arriving
    KeepAlive { last_sent_sequence: i64, receive_ack: i64 },
    /// explicit termination, validated like a sequenced packet
    Disconnect { sequence: i64, receive_ack: i64 },
}

impl PacketHeader {
    const TYPE_HANDSHAKE: u8 = 0;
    const TYPE_HANDSHAKE_ACK: u8 = 1;
    const TYPE_UNSEQUENCED: u8 = 2;
    const TYPE_SEQUENCED: u8 = 3;
    const TYPE_REQUEST: u8 = 4;
    const TYPE_KEEP_ALIVE: u8 = 5;
    const TYPE_DISCONNECT: u8 = 6;

    /// tag byte plus two sequence fields
    pub const MAX_SERIALIZED_LEN: usize = 1 + 2 * size_of::<i32>();

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            PacketHeader::Handshake { initial_sequence } => {
                buf.put_u8(Self::TYPE_HANDSHAKE);
                buf.put_i32(*initial_sequence as i32);
            }
            PacketHeader::HandshakeAck { initial_sequence } => {
                buf.put_u8(Self::TYPE_HANDSHAKE_ACK);
                buf.put_i32(*initial_sequence as i32);
            }
            PacketHeader::Unsequenced => {
                buf.put_u8(Self::TYPE_UNSEQUENCED);
            }
            PacketHeader::Sequenced { sequence, receive_ack } => {
                buf.put_u8(Self::TYPE_SEQUENCED);
                buf.put_i32(*sequence as i32);
                buf.put_i32(*receive_ack as i32);
            }
            PacketHeader::Request { sequence } => {
                buf.put_u8(Self::TYPE_REQUEST);
                buf.put_i32(*sequence as i32);
            }
            PacketHeader::KeepAlive { last_sent_sequence, receive_ack } => {
                buf.put_u8(Self::TYPE_KEEP_ALIVE);
                buf.put_i32(*last_sent_sequence as i32);
                buf.put_i32(*receive_ack as i32);
            }
            PacketHeader::Disconnect { sequence, receive_ack } => {
                buf.put_u8(Self::TYPE_DISCONNECT);
                buf.put_i32(*sequence as i32);
                buf.put_i32(*receive_ack as i32);
            }
        }
    }

    /// Parses the header, leaving `buf` positioned at the start of the payload. Truncated
    ///  frames (shorter than the type's minimum header) fail, as do unknown type tags; the
    ///  caller is expected to drop the datagram silently.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let tag = buf.try_get_u8()?;
        match tag {
            Self::TYPE_HANDSHAKE => Ok(PacketHeader::Handshake {
                initial_sequence: buf.try_get_i32()? as i64,
            }),
            Self::TYPE_HANDSHAKE_ACK => Ok(PacketHeader::HandshakeAck {
                initial_sequence: buf.try_get_i32()? as i64,
            }),
            Self::TYPE_UNSEQUENCED => Ok(PacketHeader::Unsequenced),
            Self::TYPE_SEQUENCED => Ok(PacketHeader::Sequenced {
                sequence: buf.try_get_i32()? as i64,
                receive_ack: buf.try_get_i32()? as i64,
            }),
            Self::TYPE_REQUEST => Ok(PacketHeader::Request {
                sequence: buf.try_get_i32()? as i64,
            }),
            Self::TYPE_KEEP_ALIVE => Ok(PacketHeader::KeepAlive {
                last_sent_sequence: buf.try_get_i32()? as i64,
                receive_ack: buf.try_get_i32()? as i64,
            }),
            Self::TYPE_DISCONNECT => Ok(PacketHeader::Disconnect {
                sequence: buf.try_get_i32()? as i64,
                receive_ack: buf.try_get_i32()? as i64,
            }),
            other => anyhow::bail!("unknown packet type tag {}", other),
        }
    }
}
