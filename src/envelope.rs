use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::connection_id::ConnectionId;

/// The single wire message structure: one envelope per UDP datagram, carrying a connection
///  id and exactly one protocol variant. Envelopes are immutable once constructed - a
///  retransmission sends the stored envelope unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub connection_id: ConnectionId,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Opens (or re-requests, while the client is retrying) a connection.
    ConnectionRequest,
    /// Answer to a connection request. Sent every time a request arrives, so retransmitted
    ///  requests are answered idempotently.
    ConnectionAccept,
    /// 'There is nothing here for you': the answer to any envelope addressed to a connection
    ///  the receiver has no record of.
    NoConnection,
    /// Voluntary teardown. Sent once, never acknowledged.
    ConnectionClose,
    /// Resets the peer's inactivity timer, no other effect.
    KeepAlive,
    /// Ordered, acknowledged application data.
    SendReliable {
        reliable_sequence_number: u64,
        data: Vec<u8>,
    },
    /// Best-effort application data. `reliable_sequence_number` is the sender's reliable
    ///  checkpoint at the time of sending - the receiver discards the message unless it has
    ///  seen exactly that much reliable state.
    SendUnreliable {
        reliable_sequence_number: u64,
        unreliable_sequence_number: u64,
        data: Vec<u8>,
    },
    /// Cumulative ack: confirms all reliable sequence numbers up to and including this one.
    Acknowledgement { last_sequence_number_seen: u64 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum EnvelopeKind {
    ConnectionRequest = 1,
    ConnectionAccept = 2,
    NoConnection = 3,
    ConnectionClose = 4,
    KeepAlive = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    Acknowledgement = 8,
}

impl Envelope {
    fn kind(&self) -> EnvelopeKind {
        match self.payload {
            Payload::ConnectionRequest => EnvelopeKind::ConnectionRequest,
            Payload::ConnectionAccept => EnvelopeKind::ConnectionAccept,
            Payload::NoConnection => EnvelopeKind::NoConnection,
            Payload::ConnectionClose => EnvelopeKind::ConnectionClose,
            Payload::KeepAlive => EnvelopeKind::KeepAlive,
            Payload::SendReliable { .. } => EnvelopeKind::SendReliable,
            Payload::SendUnreliable { .. } => EnvelopeKind::SendUnreliable,
            Payload::Acknowledgement { .. } => EnvelopeKind::Acknowledgement,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        buf.put_u32_varint(self.connection_id.to_raw());

        match &self.payload {
            Payload::ConnectionRequest
            | Payload::ConnectionAccept
            | Payload::NoConnection
            | Payload::ConnectionClose
            | Payload::KeepAlive => {}
            Payload::SendReliable {
                reliable_sequence_number,
                data,
            } => {
                buf.put_u64_varint(*reliable_sequence_number);
                buf.put_usize_varint(data.len());
                buf.put_slice(data);
            }
            Payload::SendUnreliable {
                reliable_sequence_number,
                unreliable_sequence_number,
                data,
            } => {
                buf.put_u64_varint(*reliable_sequence_number);
                buf.put_u64_varint(*unreliable_sequence_number);
                buf.put_usize_varint(data.len());
                buf.put_slice(data);
            }
            Payload::Acknowledgement {
                last_sequence_number_seen,
            } => {
                buf.put_u64_varint(*last_sequence_number_seen);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        if !buf.has_remaining() {
            bail!("empty envelope");
        }
        let kind = EnvelopeKind::try_from(buf.get_u8())?;
        let connection_id = ConnectionId::from_raw(buf.try_get_u32_varint()?);

        let payload = match kind {
            EnvelopeKind::ConnectionRequest => Payload::ConnectionRequest,
            EnvelopeKind::ConnectionAccept => Payload::ConnectionAccept,
            EnvelopeKind::NoConnection => Payload::NoConnection,
            EnvelopeKind::ConnectionClose => Payload::ConnectionClose,
            EnvelopeKind::KeepAlive => Payload::KeepAlive,
            EnvelopeKind::SendReliable => Payload::SendReliable {
                reliable_sequence_number: buf.try_get_u64_varint()?,
                data: Self::deser_data(buf)?,
            },
            EnvelopeKind::SendUnreliable => Payload::SendUnreliable {
                reliable_sequence_number: buf.try_get_u64_varint()?,
                unreliable_sequence_number: buf.try_get_u64_varint()?,
                data: Self::deser_data(buf)?,
            },
            EnvelopeKind::Acknowledgement => Payload::Acknowledgement {
                last_sequence_number_seen: buf.try_get_u64_varint()?,
            },
        };

        Ok(Envelope {
            connection_id,
            payload,
        })
    }

    fn deser_data(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
        let len = buf.try_get_usize_varint()?;
        if buf.remaining() < len {
            bail!(
                "envelope data truncated: declared {} bytes, {} remaining",
                len,
                buf.remaining()
            );
        }
        let mut data = vec![0u8; len];
        buf.copy_to_slice(&mut data);
        Ok(data)
    }
}
