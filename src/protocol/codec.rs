//! Protocol codec for encoding/decoding messages
//!
//! Handles serialization and framing of protocol messages.
//!
//! Application payloads are memoised per stream session: the encoder remembers
//! every `Arc` it has written and emits a back-reference when the same `Arc`
//! is written again. The decoder resolves that reference to the `Arc` it
//! produced the first time. A payload mutated in place (through interior
//! mutability) and resent without a reset therefore arrives stale. `reset`
//! clears both tables and is the mitigation.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::{DisconnectMessage, ForwardedMessage, Message, PeerId, StatusMessage, MAGIC_BYTES};

/// Maximum message size (10 MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Header size: magic(4) + type(1) + length(4) + sequence(4) = 13 bytes
const HEADER_SIZE: usize = 13;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Back-reference to unknown object handle {0}")]
    UnknownReference(u32),
}

/// Message frame with metadata
#[derive(Debug, Clone)]
pub struct Frame<T> {
    /// Sequence number for ordering
    pub sequence: u32,
    /// The actual message
    pub message: Message<T>,
}

impl<T> Frame<T> {
    pub fn new(sequence: u32, message: Message<T>) -> Self {
        Self { sequence, message }
    }
}

/// Serialized shape of a frame body. Encoded as `Wire<&T>`, decoded as `Wire<T>`.
#[derive(Serialize, Deserialize)]
enum Wire<B> {
    Hello(String),
    Welcome(PeerId),
    Acknowledge(String),
    Reset,
    Disconnect(DisconnectMessage),
    Status(StatusMessage),
    Application(Body<B>),
    Forwarded { sender_id: PeerId, body: Body<B> },
}

#[derive(Serialize, Deserialize)]
enum Body<B> {
    Object { handle: u32, value: B },
    Reference(u32),
}

/// Checks that `value` serializes and fits in one frame, without producing output.
///
/// Measured inside the largest wrapper a payload travels in (a forwarded
/// object), so a payload that passes here fits in every frame that carries it.
pub fn check_payload<T: Serialize>(value: &T) -> Result<(), CodecError> {
    let wrapped = Wire::Forwarded {
        sender_id: PeerId::new(u32::MAX),
        body: Body::Object {
            handle: u32::MAX,
            value,
        },
    };
    let size = bincode::serialized_size(&wrapped)? as usize;
    if size > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(size, MAX_MESSAGE_SIZE));
    }
    Ok(())
}

/// Encodes messages into the wire format
///
/// Every payload `Arc` written since the last reset stays alive in the memo,
/// and its decoded copy stays alive in the peer's decoder. With autoreset off
/// a long session grows both tables without bound, so callers should reset
/// periodically (for example between hands) or enable autoreset.
pub struct Encoder<T> {
    sequence: u32,
    /// Keyed by `Arc` address. Holding the `Arc` keeps the address from being reused.
    memo: HashMap<usize, (u32, Arc<T>)>,
    next_handle: u32,
}

impl<T> Encoder<T> {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            memo: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Number of payloads the encoder currently remembers
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }
}

impl<T: Serialize> Encoder<T> {
    /// Encode a message into a buffer
    pub fn encode(&mut self, message: &Message<T>, buf: &mut BytesMut) -> Result<(), CodecError> {
        let mut fresh = None;
        let wire: Wire<&T> = match message {
            Message::Hello(text) => Wire::Hello(text.clone()),
            Message::Welcome(id) => Wire::Welcome(*id),
            Message::Acknowledge(text) => Wire::Acknowledge(text.clone()),
            Message::Reset => return self.reset(buf),
            Message::Disconnect(msg) => Wire::Disconnect(msg.clone()),
            Message::Status(status) => Wire::Status(status.clone()),
            Message::Application(payload) => {
                let (body, inserted) = self.body(payload);
                if inserted {
                    fresh = Some(payload);
                }
                Wire::Application(body)
            }
            Message::Forwarded(forwarded) => {
                let (body, inserted) = self.body(&forwarded.payload);
                if inserted {
                    fresh = Some(&forwarded.payload);
                }
                Wire::Forwarded {
                    sender_id: forwarded.sender_id,
                    body,
                }
            }
        };

        let result = self.write_frame(message.type_id(), &wire, buf);
        if result.is_err() {
            // The peer never sees this object, so it must not be referenced later.
            if let Some(payload) = fresh {
                self.memo.remove(&(Arc::as_ptr(payload) as usize));
            }
        }
        result
    }

    /// Forget every memoised payload and tell the decoder to do the same.
    ///
    /// Writes nothing when the memo is already empty.
    pub fn reset(&mut self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.memo.is_empty() {
            return Ok(());
        }
        self.memo.clear();
        self.next_handle = 0;
        self.write_frame(Message::<T>::Reset.type_id(), &Wire::<&T>::Reset, buf)
    }

    fn body<'a>(&mut self, payload: &'a Arc<T>) -> (Body<&'a T>, bool) {
        let key = Arc::as_ptr(payload) as usize;
        if let Some((handle, _)) = self.memo.get(&key) {
            return (Body::Reference(*handle), false);
        }

        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.memo.insert(key, (handle, Arc::clone(payload)));
        (Body::Object { handle, value: &**payload }, true)
    }

    fn write_frame<S: Serialize>(
        &mut self,
        type_id: u8,
        wire: &S,
        buf: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let payload = bincode::serialize(wire)?;

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
        }

        // Write header
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(type_id);
        buf.put_u32(payload.len() as u32);
        buf.put_u32(self.sequence);

        // Write payload
        buf.put_slice(&payload);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

impl<T> Default for Encoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes messages from the wire format
pub struct Decoder<T> {
    state: DecodeState,
    table: HashMap<u32, Arc<T>>,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        length: usize,
        sequence: u32,
    },
}

impl<T> Decoder<T> {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
            table: HashMap::new(),
        }
    }

    /// True between frames
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header)
    }
}

impl<T: DeserializeOwned> Decoder<T> {
    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame<T>>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    // Check magic bytes
                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                    let sequence = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);

                    if length > MAX_MESSAGE_SIZE {
                        return Err(CodecError::MessageTooLarge(length, MAX_MESSAGE_SIZE));
                    }

                    buf.advance(HEADER_SIZE);

                    self.state = DecodeState::Payload { length, sequence };
                }
                DecodeState::Payload { length, sequence } => {
                    if buf.len() < *length {
                        return Ok(None);
                    }

                    let payload = buf.split_to(*length);
                    let seq = *sequence;
                    self.state = DecodeState::Header;

                    let wire: Wire<T> = bincode::deserialize(&payload)?;
                    let message = self.resolve(wire)?;

                    return Ok(Some(Frame::new(seq, message)));
                }
            }
        }
    }

    fn resolve(&mut self, wire: Wire<T>) -> Result<Message<T>, CodecError> {
        Ok(match wire {
            Wire::Hello(text) => Message::Hello(text),
            Wire::Welcome(id) => Message::Welcome(id),
            Wire::Acknowledge(text) => Message::Acknowledge(text),
            Wire::Reset => {
                self.table.clear();
                Message::Reset
            }
            Wire::Disconnect(msg) => Message::Disconnect(msg),
            Wire::Status(status) => Message::Status(status),
            Wire::Application(body) => Message::Application(self.object(body)?),
            Wire::Forwarded { sender_id, body } => Message::Forwarded(ForwardedMessage {
                sender_id,
                payload: self.object(body)?,
            }),
        })
    }

    fn object(&mut self, body: Body<T>) -> Result<Arc<T>, CodecError> {
        match body {
            Body::Object { handle, value } => {
                let value = Arc::new(value);
                self.table.insert(handle, Arc::clone(&value));
                Ok(value)
            }
            Body::Reference(handle) => self
                .table
                .get(&handle)
                .cloned()
                .ok_or(CodecError::UnknownReference(handle)),
        }
    }
}

impl<T> Default for Decoder<T> {
    fn default() -> Self {
        Self::new()
    }
}
