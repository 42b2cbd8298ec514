//! Wire envelope encoding and decoding.

use crate::types::{
    ReceiveError, Result, SendError, SendResult, ENVELOPE_HEADER_SIZE, ENVELOPE_VERSION,
};

const FLAG_SERVER_TIMESTAMP: u8 = 0x01;
const FLAG_SERVER_MESSAGE_ID: u8 = 0x02;

/// Kind of ciphertext carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    /// Sealed to a single recipient (the "unidentified sender" kind).
    SessionMessage,
    /// Sealed to a closed group's current key pair.
    ClosedGroupMessage,
    /// Any other tag; rejected by the receiver.
    Unknown(u8),
}

impl EnvelopeType {
    pub fn to_byte(self) -> u8 {
        match self {
            EnvelopeType::SessionMessage => 6,
            EnvelopeType::ClosedGroupMessage => 7,
            EnvelopeType::Unknown(tag) => tag,
        }
    }

    pub fn from_byte(tag: u8) -> Self {
        match tag {
            6 => EnvelopeType::SessionMessage,
            7 => EnvelopeType::ClosedGroupMessage,
            other => EnvelopeType::Unknown(other),
        }
    }
}

/// Message envelope as produced by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub envelope_type: EnvelopeType,
    /// Sender identity, or the group public key for closed-group messages.
    pub source: String,
    /// Session protocol ciphertext.
    pub content: Vec<u8>,
    /// Sent timestamp in milliseconds.
    pub timestamp: u64,
    pub server_timestamp: Option<u64>,
    pub server_message_id: Option<u64>,
}

impl Envelope {
    /// Encode the envelope to bytes.
    ///
    /// Format (11-byte header + optional fields + body):
    /// - [0]      version (0x01)
    /// - [1]      type
    /// - [2-9]    timestamp (u64, big-endian)
    /// - [10]     flags (0x01 serverTimestamp, 0x02 serverMessageId)
    /// - [..]     serverTimestamp (8 bytes, if flagged)
    /// - [..]     serverMessageId (8 bytes, if flagged)
    /// - [..]     source length (u16) ‖ source (UTF-8)
    /// - [..]     content length (u32) ‖ content
    ///
    /// Fails when the source or content does not fit its length prefix.
    pub fn encode(&self) -> SendResult<Vec<u8>> {
        let source_len =
            u16::try_from(self.source.len()).map_err(|_| SendError::ProtoConversionFailed)?;
        let content_len =
            u32::try_from(self.content.len()).map_err(|_| SendError::ProtoConversionFailed)?;

        let mut data =
            Vec::with_capacity(ENVELOPE_HEADER_SIZE + 22 + self.source.len() + self.content.len());
        data.push(ENVELOPE_VERSION);
        data.push(self.envelope_type.to_byte());
        data.extend_from_slice(&self.timestamp.to_be_bytes());

        let mut flags = 0u8;
        if self.server_timestamp.is_some() {
            flags |= FLAG_SERVER_TIMESTAMP;
        }
        if self.server_message_id.is_some() {
            flags |= FLAG_SERVER_MESSAGE_ID;
        }
        data.push(flags);

        if let Some(server_timestamp) = self.server_timestamp {
            data.extend_from_slice(&server_timestamp.to_be_bytes());
        }
        if let Some(server_message_id) = self.server_message_id {
            data.extend_from_slice(&server_message_id.to_be_bytes());
        }

        data.extend_from_slice(&source_len.to_be_bytes());
        data.extend_from_slice(self.source.as_bytes());
        data.extend_from_slice(&content_len.to_be_bytes());
        data.extend_from_slice(&self.content);
        Ok(data)
    }

    /// Decode bytes into an envelope.
    ///
    /// An envelope without content decodes successfully; the receiver
    /// rejects it with [`ReceiveError::NoData`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(ReceiveError::InvalidMessage);
        }
        if data[0] != ENVELOPE_VERSION {
            return Err(ReceiveError::InvalidMessage);
        }

        let mut reader = Reader { data, offset: 1 };
        let envelope_type = EnvelopeType::from_byte(reader.u8()?);
        let timestamp = reader.u64()?;
        let flags = reader.u8()?;

        let server_timestamp = if flags & FLAG_SERVER_TIMESTAMP != 0 {
            Some(reader.u64()?)
        } else {
            None
        };
        let server_message_id = if flags & FLAG_SERVER_MESSAGE_ID != 0 {
            Some(reader.u64()?)
        } else {
            None
        };

        let source_len = u16::from_be_bytes(reader.array()?) as usize;
        let source = String::from_utf8(reader.take(source_len)?.to_vec())
            .map_err(|_| ReceiveError::InvalidMessage)?;

        let content_len = u32::from_be_bytes(reader.array()?) as usize;
        let content = reader.take(content_len)?.to_vec();

        Ok(Self {
            envelope_type,
            source,
            content,
            timestamp,
            server_timestamp,
            server_message_id,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(ReceiveError::InvalidMessage)?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }
}
