// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Implementation of the [Mobile Transport Protocol] message layer.
//!
//! This layer converts outgoing requests into (possibly containerized) messages,
//! and processes the plaintext of incoming payloads into responses, keeping
//! track of the session state (salt, sequence, time offset) in the process.
//! Encryption is performed elsewhere.
//!
//! [Mobile Transport Protocol]: https://core.telegram.org/mtproto/description
use std::fmt;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use flate2::write::GzDecoder;
use grammers_tl_types::{self as tl, Deserializable, Identifiable, Serializable};
use log::{debug, trace, warn};

use crate::errors::RpcError;

/// `msg_container#73f1f8dc messages:vector<%Message> = MessageContainer;`
const MSG_CONTAINER: u32 = 0x73f1f8dc;
/// `rpc_result#f35c6d01 req_msg_id:long result:Object = RpcResult;`
const RPC_RESULT: u32 = 0xf35c6d01;
/// `gzip_packed#3072cfa1 packed_data:string = Object;`
const GZIP_PACKED: u32 = 0x3072cfa1;

/// Size of the salt and session identifier preceding the messages.
const PAYLOAD_HEADER_LEN: usize = 16;
/// Size of the message identifier, sequence number and length preceding a message body.
const MESSAGE_HEADER_LEN: usize = 16;

/// Maximum amount of messages a single container may hold.
pub(crate) const MAX_CONTAINER_MESSAGES: usize = 100;
/// Roughly 1MB, above which the server would reject the container.
pub(crate) const MAX_CONTAINER_LEN: usize = 1024 * 1024 - 1024;

/// A message identifier assigned by this session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MsgId(pub i64);

/// The error type for the deserialization of server messages.
#[derive(Clone, Debug, PartialEq)]
pub enum DeserializeError {
    /// A plain message was received with an authorization key identifier other than zero.
    BadAuthKey { got: i64, expected: i64 },

    /// The server's message ID did not match our expectations.
    BadMessageId { got: i64 },

    /// The server's message length was not strictly positive.
    NegativeMessageLength { got: i32 },

    /// The server's message length was past the buffer.
    TooLongMessageLength { got: usize, max_length: usize },

    /// The received buffer is too small to contain a valid response message,
    /// or the response seemed valid at first but trying to deserialize it
    /// proved the buffer to be too small.
    MessageBufferTooSmall,

    /// The server responded with compressed data which we failed to decompress.
    DecompressionFailed,

    /// While deserializing the response types one of them had a constructor
    /// that did not match our expectations. The invalid ID is contained
    /// within this variant.
    UnexpectedConstructor { id: u32 },
}

impl std::error::Error for DeserializeError {}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadAuthKey { got, expected } => {
                write!(f, "bad server auth key (got {got}, expected {expected})")
            }
            Self::BadMessageId { got } => write!(f, "bad server message id (got {got})"),
            Self::NegativeMessageLength { got } => {
                write!(f, "bad server message length (got {got})")
            }
            Self::TooLongMessageLength { got, max_length } => write!(
                f,
                "bad server message length (got {got}, when at most it should be {max_length})"
            ),
            Self::MessageBufferTooSmall => write!(
                f,
                "server responded with a payload that's too small to fit a valid message"
            ),
            Self::DecompressionFailed => write!(f, "failed to decompress server's data"),
            Self::UnexpectedConstructor { id } => write!(f, "unexpected constructor: {id:08x}"),
        }
    }
}

impl From<tl::deserialize::Error> for DeserializeError {
    fn from(error: tl::deserialize::Error) -> Self {
        use tl::deserialize::Error as Err;

        match error {
            Err::UnexpectedEof => DeserializeError::MessageBufferTooSmall,
            Err::UnexpectedConstructor { id } => DeserializeError::UnexpectedConstructor { id },
        }
    }
}

/// Results from the deserialization of a response.
#[derive(Debug, PartialEq)]
pub(crate) enum Deserialization {
    /// Successful answer to the request with the given identifier.
    RpcResult { msg_id: MsgId, body: Vec<u8> },
    /// The request with the given identifier failed.
    RpcError { msg_id: MsgId, error: RpcError },
    /// The answer to the request could not be understood.
    Failure {
        msg_id: MsgId,
        error: DeserializeError,
    },
    /// The server ignored the message (or container) with the given identifier.
    BadMessage { msg_id: MsgId, code: i32 },
    /// Answer to a ping.
    Pong { msg_id: MsgId },
    /// The server created a new session. Messages sent before `first_msg_id` may be lost.
    NewSession { first_msg_id: i64 },
    /// Anything else is pushed by the server on its own.
    Update(Vec<u8>),
}

/// Whether the server may process the message again after it was ignored.
///
/// See [service messages about messages](https://core.telegram.org/mtproto/service_messages_about_messages).
pub(crate) fn bad_message_retryable(code: i32) -> bool {
    [16, 17, 32, 33, 48].contains(&code)
}

pub(crate) fn bad_message_description(code: i32) -> &'static str {
    match code {
        16 => "msg_id too low",
        17 => "msg_id too high",
        18 => "incorrect two lower order msg_id bits; this is a bug",
        19 => "container msg_id is the same as msg_id of a previously received message; this is a bug",
        20 => "message too old",
        32 => "msg_seqno too low",
        33 => "msg_seqno too high",
        34 => "an even msg_seqno expected; this may be a bug",
        35 => "odd msg_seqno expected; this may be a bug",
        48 => "incorrect server salt",
        64 => "invalid container; this is likely a bug",
        _ => "unknown explanation; please report this issue",
    }
}

/// Output of [`Mtp::serialize`].
pub(crate) struct Serialized {
    /// Plaintext to encrypt: salt, session identifier, and the message or container.
    pub payload: Vec<u8>,
    /// Identifiers assigned to each request, in order.
    pub msg_ids: Vec<MsgId>,
    /// Identifier of the container, if one was needed.
    pub container_msg_id: Option<MsgId>,
}

struct Message {
    msg_id: i64,
    seq_no: i32,
    body: Vec<u8>,
}

/// State of one MTProto session.
pub(crate) struct Mtp {
    session_id: i64,
    salt: i64,
    time_offset: i32,
    sequence: i32,
    last_msg_id: i64,
    pending_ack: Vec<i64>,
}

impl Mtp {
    pub fn new(session_id: i64) -> Self {
        Self {
            session_id,
            salt: 0,
            time_offset: 0,
            sequence: 0,
            last_msg_id: 0,
            pending_ack: Vec::new(),
        }
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Starts over with a different session identifier. The salt and time offset are kept.
    pub fn reset_session(&mut self, session_id: i64) {
        self.session_id = session_id;
        self.sequence = 0;
        self.pending_ack.clear();
    }

    pub fn set_salt(&mut self, salt: i64) {
        self.salt = salt;
    }

    pub fn set_time_offset(&mut self, time_offset: i32) {
        self.time_offset = time_offset;
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_ack.is_empty()
    }

    /// Generates a new unique message ID based on the current
    /// time (in ms) since epoch, applying a known time offset.
    pub fn new_msg_id(&mut self) -> MsgId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let seconds = (now.as_secs() as i32 + self.time_offset) as u64;
        let nanoseconds = now.subsec_nanos() as u64;
        let mut new_msg_id = ((seconds << 32) | (nanoseconds << 2)) as i64;

        if self.last_msg_id >= new_msg_id {
            new_msg_id = self.last_msg_id + 4;
        }

        self.last_msg_id = new_msg_id;
        MsgId(new_msg_id)
    }

    /// Generates the next sequence number depending on whether
    /// it should be for a content-related query or not.
    fn seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            self.sequence += 2;
            self.sequence - 1
        } else {
            self.sequence
        }
    }

    /// Corrects our time offset based on a message ID known to be correct.
    fn correct_time_offset(&mut self, msg_id: i64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i32;

        let correct = (msg_id >> 32) as i32;
        self.time_offset = correct - now;
    }

    fn write_message(&mut self, buffer: &mut Vec<u8>, msg_id: MsgId, content_related: bool, body: &[u8]) {
        let seq_no = self.seq_no(content_related);
        buffer.put_i64_le(msg_id.0);
        buffer.put_i32_le(seq_no);
        buffer.put_i32_le(body.len() as i32);
        buffer.put_slice(body);
    }

    fn payload_header(&self, capacity: usize) -> Vec<u8> {
        let mut payload = Vec::with_capacity(PAYLOAD_HEADER_LEN + capacity);
        payload.put_i64_le(self.salt);
        payload.put_i64_le(self.session_id);
        payload
    }

    fn take_ack_body(&mut self) -> Option<Vec<u8>> {
        if self.pending_ack.is_empty() {
            return None;
        }
        let msg_ids = std::mem::take(&mut self.pending_ack);
        let mut body = tl::types::MsgsAck::CONSTRUCTOR_ID.to_le_bytes().to_vec();
        body.extend(tl::types::MsgsAck { msg_ids }.to_bytes());
        Some(body)
    }

    /// Serializes the given requests, along with any pending acknowledgement,
    /// into a single payload. More than one message is wrapped in a container.
    ///
    /// Returns `None` if there was nothing to serialize.
    pub fn serialize(&mut self, requests: &[&[u8]]) -> Option<Serialized> {
        let mut messages = Vec::new();
        let mut msg_ids = Vec::with_capacity(requests.len());
        for body in requests {
            let msg_id = self.new_msg_id();
            self.write_message(&mut messages, msg_id, true, body);
            msg_ids.push(msg_id);
        }
        let mut count = requests.len();
        if let Some(ack) = self.take_ack_body() {
            let msg_id = self.new_msg_id();
            self.write_message(&mut messages, msg_id, false, &ack);
            count += 1;
        }

        if count == 0 {
            return None;
        }

        let mut payload = self.payload_header(MESSAGE_HEADER_LEN + 8 + messages.len());
        let container_msg_id = if count > 1 {
            // The container is given its identifier last, so it is greater than its contents.
            let msg_id = self.new_msg_id();
            let seq_no = self.seq_no(false);
            payload.put_i64_le(msg_id.0);
            payload.put_i32_le(seq_no);
            payload.put_i32_le((messages.len() + 8) as i32);
            payload.put_u32_le(MSG_CONTAINER);
            payload.put_i32_le(count as i32);
            Some(msg_id)
        } else {
            None
        };
        payload.put_slice(&messages);

        Some(Serialized {
            payload,
            msg_ids,
            container_msg_id,
        })
    }

    /// Serializes a single content-related message with a pre-assigned identifier.
    ///
    /// Used by requests whose body depends on their own message identifier.
    pub fn serialize_with_id(&mut self, msg_id: MsgId, body: &[u8]) -> Vec<u8> {
        let mut payload = self.payload_header(MESSAGE_HEADER_LEN + body.len());
        self.write_message(&mut payload, msg_id, true, body);
        payload
    }

    /// Serializes a plain (unencrypted) message, as used during key exchanges.
    pub fn serialize_plain(&mut self, body: &[u8]) -> Vec<u8> {
        let msg_id = self.new_msg_id();
        let mut packet = Vec::with_capacity(8 + MESSAGE_HEADER_LEN + body.len());
        packet.put_i64_le(0);
        packet.put_i64_le(msg_id.0);
        packet.put_i32_le(body.len() as i32);
        packet.put_slice(body);
        packet
    }

    /// Processes the decrypted plaintext of an incoming payload.
    pub fn deserialize(&mut self, plaintext: &[u8]) -> Result<Vec<Deserialization>, DeserializeError> {
        let mut buf = plaintext;
        if buf.remaining() < PAYLOAD_HEADER_LEN + MESSAGE_HEADER_LEN {
            return Err(DeserializeError::MessageBufferTooSmall);
        }
        let _salt = buf.get_i64_le();
        let session_id = buf.get_i64_le();
        if session_id != self.session_id {
            warn!(
                "ignoring payload for session {session_id:x} (ours is {:x})",
                self.session_id
            );
            return Ok(Vec::new());
        }

        let message = read_message(&mut buf)?;
        let mut results = Vec::new();
        self.process_message(message, &mut results)?;
        Ok(results)
    }

    fn process_message(
        &mut self,
        message: Message,
        results: &mut Vec<Deserialization>,
    ) -> Result<(), DeserializeError> {
        if message.seq_no & 1 != 0 {
            self.pending_ack.push(message.msg_id);
        }
        self.process_body(message.msg_id, message.body, results)
    }

    fn process_body(
        &mut self,
        msg_id: i64,
        body: Vec<u8>,
        results: &mut Vec<Deserialization>,
    ) -> Result<(), DeserializeError> {
        // Service messages:
        // * https://core.telegram.org/mtproto/service_messages
        // * https://core.telegram.org/mtproto/service_messages_about_messages
        match peek_constructor(&body)? {
            RPC_RESULT => self.handle_rpc_result(&body, results),
            MSG_CONTAINER => self.handle_container(&body, results),
            GZIP_PACKED => {
                let unpacked = gzip_decompress(&body)?;
                self.process_body(msg_id, unpacked, results)
            }
            tl::types::BadMsgNotification::CONSTRUCTOR_ID
            | tl::types::BadServerSalt::CONSTRUCTOR_ID => {
                self.handle_bad_notification(msg_id, &body, results)
            }
            tl::types::NewSessionCreated::CONSTRUCTOR_ID => {
                let mut buf = &body[4..];
                let first_msg_id = read_i64(&mut buf)?;
                let _unique_id = read_i64(&mut buf)?;
                self.salt = read_i64(&mut buf)?;
                debug!("new session created; first message id {first_msg_id}");
                results.push(Deserialization::NewSession { first_msg_id });
                Ok(())
            }
            tl::types::Pong::CONSTRUCTOR_ID => {
                let mut buf = &body[4..];
                let msg_id = MsgId(read_i64(&mut buf)?);
                results.push(Deserialization::Pong { msg_id });
                Ok(())
            }
            id @ (tl::types::MsgsAck::CONSTRUCTOR_ID
            | tl::types::MsgsStateReq::CONSTRUCTOR_ID
            | tl::types::MsgsStateInfo::CONSTRUCTOR_ID
            | tl::types::MsgsAllInfo::CONSTRUCTOR_ID
            | tl::types::MsgDetailedInfo::CONSTRUCTOR_ID
            | tl::types::MsgNewDetailedInfo::CONSTRUCTOR_ID
            | tl::types::MsgResendReq::CONSTRUCTOR_ID
            | tl::types::FutureSalts::CONSTRUCTOR_ID
            | tl::types::DestroySessionOk::CONSTRUCTOR_ID
            | tl::types::DestroySessionNone::CONSTRUCTOR_ID
            | tl::types::HttpWait::CONSTRUCTOR_ID) => {
                trace!("ignoring service message {}", tl::name_for_id(id));
                Ok(())
            }
            _ => {
                results.push(Deserialization::Update(body));
                Ok(())
            }
        }
    }

    fn handle_rpc_result(
        &mut self,
        body: &[u8],
        results: &mut Vec<Deserialization>,
    ) -> Result<(), DeserializeError> {
        let mut buf = &body[4..];
        let msg_id = MsgId(read_i64(&mut buf)?);
        let result = buf;

        // Any error inside the result belongs to the request, not to the payload.
        let outcome = match peek_constructor(result) {
            Err(error) => Deserialization::Failure { msg_id, error },
            Ok(tl::types::RpcError::CONSTRUCTOR_ID) => match tl::enums::RpcError::from_bytes(result) {
                Ok(tl::enums::RpcError::Error(error)) => Deserialization::RpcError {
                    msg_id,
                    error: error.into(),
                },
                Err(error) => Deserialization::Failure {
                    msg_id,
                    error: error.into(),
                },
            },
            Ok(GZIP_PACKED) => match gzip_decompress(result) {
                Ok(body) => Deserialization::RpcResult { msg_id, body },
                Err(error) => Deserialization::Failure { msg_id, error },
            },
            Ok(id) => {
                if id == tl::types::RpcAnswerUnknown::CONSTRUCTOR_ID
                    || id == tl::types::RpcAnswerDroppedRunning::CONSTRUCTOR_ID
                    || id == tl::types::RpcAnswerDropped::CONSTRUCTOR_ID
                {
                    return Ok(());
                }
                Deserialization::RpcResult {
                    msg_id,
                    body: result.to_vec(),
                }
            }
        };
        results.push(outcome);
        Ok(())
    }

    fn handle_container(
        &mut self,
        body: &[u8],
        results: &mut Vec<Deserialization>,
    ) -> Result<(), DeserializeError> {
        let mut buf = &body[4..];
        let count = read_i32(&mut buf)?;
        for _ in 0..count {
            let message = read_message(&mut buf)?;
            self.process_message(message, results)?;
        }
        Ok(())
    }

    fn handle_bad_notification(
        &mut self,
        msg_id: i64,
        body: &[u8],
        results: &mut Vec<Deserialization>,
    ) -> Result<(), DeserializeError> {
        let mut buf = body;
        let constructor = read_u32(&mut buf)?;
        let bad_msg_id = read_i64(&mut buf)?;
        let _bad_msg_seqno = read_i32(&mut buf)?;
        let code = read_i32(&mut buf)?;

        if constructor == tl::types::BadServerSalt::CONSTRUCTOR_ID {
            self.salt = read_i64(&mut buf)?;
        } else {
            match code {
                // Sent `msg_id` was too low or too high (our `time_offset` is wrong).
                16 | 17 => self.correct_time_offset(msg_id),
                // Sent `seq_no` was too low. Bump it by some large-ish value.
                32 => self.sequence += 64,
                // Sent `seq_no` was too high.
                33 => self.sequence -= 16,
                _ => {}
            }
        }

        debug!(
            "message {bad_msg_id} was ignored by the server: {}",
            bad_message_description(code)
        );
        results.push(Deserialization::BadMessage {
            msg_id: MsgId(bad_msg_id),
            code,
        });
        Ok(())
    }
}

/// Extracts the body of a plain (unencrypted) message.
pub(crate) fn deserialize_plain(packet: &[u8]) -> Result<Vec<u8>, DeserializeError> {
    let mut buf = packet;
    let auth_key_id = read_i64(&mut buf)?;
    if auth_key_id != 0 {
        return Err(DeserializeError::BadAuthKey {
            got: auth_key_id,
            expected: 0,
        });
    }

    let msg_id = read_i64(&mut buf)?;
    if msg_id == 0 {
        return Err(DeserializeError::BadMessageId { got: msg_id });
    }

    let len = read_i32(&mut buf)?;
    let len = check_len(len, buf.remaining())?;
    Ok(buf[..len].to_vec())
}

fn check_len(len: i32, remaining: usize) -> Result<usize, DeserializeError> {
    if len < 0 {
        return Err(DeserializeError::NegativeMessageLength { got: len });
    }
    let len = len as usize;
    if len > remaining {
        return Err(DeserializeError::TooLongMessageLength {
            got: len,
            max_length: remaining,
        });
    }
    Ok(len)
}

fn read_message(buf: &mut &[u8]) -> Result<Message, DeserializeError> {
    let msg_id = read_i64(buf)?;
    let seq_no = read_i32(buf)?;
    let len = check_len(read_i32(buf)?, buf.remaining())?;
    let body = buf[..len].to_vec();
    buf.advance(len);
    Ok(Message {
        msg_id,
        seq_no,
        body,
    })
}

fn peek_constructor(body: &[u8]) -> Result<u32, DeserializeError> {
    read_u32(&mut &body[..])
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, DeserializeError> {
    if buf.remaining() < 4 {
        return Err(DeserializeError::MessageBufferTooSmall);
    }
    Ok(buf.get_u32_le())
}

fn read_i32(buf: &mut &[u8]) -> Result<i32, DeserializeError> {
    if buf.remaining() < 4 {
        return Err(DeserializeError::MessageBufferTooSmall);
    }
    Ok(buf.get_i32_le())
}

fn read_i64(buf: &mut &[u8]) -> Result<i64, DeserializeError> {
    if buf.remaining() < 8 {
        return Err(DeserializeError::MessageBufferTooSmall);
    }
    Ok(buf.get_i64_le())
}

/// Unpacks a `gzip_packed` object (constructor included).
fn gzip_decompress(body: &[u8]) -> Result<Vec<u8>, DeserializeError> {
    let packed_data = Vec::<u8>::from_bytes(&body[4..])?;
    let mut decoder = GzDecoder::new(Vec::new());
    decoder
        .write_all(&packed_data)
        .map_err(|_| DeserializeError::DecompressionFailed)?;
    decoder
        .finish()
        .map_err(|_| DeserializeError::DecompressionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    const SESSION_ID: i64 = 0x1234_5678;

    fn server_payload(session_id: i64, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.put_i64_le(0);
        payload.put_i64_le(session_id);
        payload.put_i64_le(msg_id);
        payload.put_i32_le(seq_no);
        payload.put_i32_le(body.len() as i32);
        payload.put_slice(body);
        payload
    }

    fn rpc_result(req_msg_id: i64, result: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u32_le(RPC_RESULT);
        body.put_i64_le(req_msg_id);
        body.put_slice(result);
        body
    }

    fn container(messages: &[(i64, i32, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u32_le(MSG_CONTAINER);
        body.put_i32_le(messages.len() as i32);
        for (msg_id, seq_no, inner) in messages {
            body.put_i64_le(*msg_id);
            body.put_i32_le(*seq_no);
            body.put_i32_le(inner.len() as i32);
            body.put_slice(inner);
        }
        body
    }

    #[test]
    fn msg_ids_increase_and_are_aligned() {
        let mut mtp = Mtp::new(SESSION_ID);
        let mut last = 0;
        for _ in 0..100 {
            let MsgId(msg_id) = mtp.new_msg_id();
            assert_eq!(msg_id % 4, 0);
            assert!(msg_id > last);
            last = msg_id;
        }
    }

    #[test]
    fn single_request_is_not_containerized() {
        let mut mtp = Mtp::new(SESSION_ID);
        let serialized = mtp.serialize(&[&[1, 2, 3, 4]]).unwrap();
        assert!(serialized.container_msg_id.is_none());
        assert_eq!(serialized.msg_ids.len(), 1);

        let mut buf = &serialized.payload[..];
        assert_eq!(buf.get_i64_le(), 0);
        assert_eq!(buf.get_i64_le(), SESSION_ID);
        assert_eq!(buf.get_i64_le(), serialized.msg_ids[0].0);
        assert_eq!(buf.get_i32_le(), 1);
        assert_eq!(buf.get_i32_le(), 4);
        assert_eq!(buf, &[1, 2, 3, 4]);

        assert!(mtp.serialize(&[]).is_none());
    }

    #[test]
    fn pending_acks_share_a_container() {
        let mut mtp = Mtp::new(SESSION_ID);
        let update = 0x12345678_u32.to_le_bytes();
        mtp.deserialize(&server_payload(SESSION_ID, 44, 1, &update))
            .unwrap();
        assert!(mtp.has_pending_acks());

        let serialized = mtp.serialize(&[&[1, 2, 3, 4]]).unwrap();
        let container_msg_id = serialized.container_msg_id.unwrap();
        assert!(container_msg_id.0 > serialized.msg_ids[0].0);
        assert!(!mtp.has_pending_acks());

        let mut buf = &serialized.payload[PAYLOAD_HEADER_LEN..];
        assert_eq!(buf.get_i64_le(), container_msg_id.0);
        let _seq_no = buf.get_i32_le();
        let _len = buf.get_i32_le();
        assert_eq!(buf.get_u32_le(), MSG_CONTAINER);
        assert_eq!(buf.get_i32_le(), 2);
    }

    #[test]
    fn rpc_results_and_errors() {
        let mut mtp = Mtp::new(SESSION_ID);
        let error = tl::enums::RpcError::Error(tl::types::RpcError {
            error_code: 420,
            error_message: "FLOOD_WAIT_3".into(),
        })
        .to_bytes();
        let payload = server_payload(
            SESSION_ID,
            1 << 32,
            0,
            &container(&[
                (4 << 32, 1, rpc_result(100, &[5, 6, 7, 8])),
                (8 << 32, 1, rpc_result(104, &error)),
            ]),
        );

        let results = mtp.deserialize(&payload).unwrap();
        assert_eq!(
            results[0],
            Deserialization::RpcResult {
                msg_id: MsgId(100),
                body: vec![5, 6, 7, 8]
            }
        );
        match &results[1] {
            Deserialization::RpcError { msg_id, error } => {
                assert_eq!(*msg_id, MsgId(104));
                assert!(error.is("FLOOD_WAIT"));
                assert_eq!(error.value, Some(3));
            }
            other => panic!("unexpected deserialization: {other:?}"),
        }
    }

    #[test]
    fn gzip_results_are_unpacked() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[9, 9, 9, 9, 1, 2, 3, 4]).unwrap();
        let packed = encoder.finish().unwrap();
        let mut gzip = Vec::new();
        gzip.put_u32_le(GZIP_PACKED);
        gzip.extend(packed.to_bytes());

        let mut mtp = Mtp::new(SESSION_ID);
        let results = mtp
            .deserialize(&server_payload(SESSION_ID, 4, 1, &rpc_result(8, &gzip)))
            .unwrap();
        assert_eq!(
            results,
            vec![Deserialization::RpcResult {
                msg_id: MsgId(8),
                body: vec![9, 9, 9, 9, 1, 2, 3, 4]
            }]
        );
    }

    #[test]
    fn bad_server_salt_replaces_salt() {
        let mut mtp = Mtp::new(SESSION_ID);
        let mut body = Vec::new();
        body.put_u32_le(tl::types::BadServerSalt::CONSTRUCTOR_ID);
        body.put_i64_le(100);
        body.put_i32_le(1);
        body.put_i32_le(48);
        body.put_i64_le(777);

        let results = mtp
            .deserialize(&server_payload(SESSION_ID, 4, 0, &body))
            .unwrap();
        assert_eq!(
            results,
            vec![Deserialization::BadMessage {
                msg_id: MsgId(100),
                code: 48
            }]
        );

        let serialized = mtp.serialize(&[&[0; 4]]).unwrap();
        assert_eq!((&serialized.payload[..]).get_i64_le(), 777);
    }

    #[test]
    fn service_messages() {
        let mut mtp = Mtp::new(SESSION_ID);

        let mut pong = Vec::new();
        pong.put_u32_le(tl::types::Pong::CONSTRUCTOR_ID);
        pong.put_i64_le(40);
        pong.put_i64_le(1);

        let mut new_session = Vec::new();
        new_session.put_u32_le(tl::types::NewSessionCreated::CONSTRUCTOR_ID);
        new_session.put_i64_le(36);
        new_session.put_i64_le(2);
        new_session.put_i64_le(555);

        let mut ack = tl::types::MsgsAck::CONSTRUCTOR_ID.to_le_bytes().to_vec();
        ack.extend(tl::types::MsgsAck { msg_ids: vec![36] }.to_bytes());

        let results = mtp
            .deserialize(&server_payload(
                SESSION_ID,
                4,
                0,
                &container(&[(8, 0, pong), (12, 1, new_session), (16, 0, ack)]),
            ))
            .unwrap();
        assert_eq!(
            results,
            vec![
                Deserialization::Pong { msg_id: MsgId(40) },
                Deserialization::NewSession { first_msg_id: 36 },
            ]
        );
        assert!(mtp.has_pending_acks());
    }

    #[test]
    fn foreign_sessions_are_ignored() {
        let mut mtp = Mtp::new(SESSION_ID);
        let results = mtp
            .deserialize(&server_payload(SESSION_ID + 1, 4, 1, &[1, 2, 3, 4]))
            .unwrap();
        assert!(results.is_empty());
        assert!(!mtp.has_pending_acks());
    }

    #[test]
    fn truncated_payloads_fail() {
        let mut mtp = Mtp::new(SESSION_ID);
        let mut payload = server_payload(SESSION_ID, 4, 1, &[1, 2, 3, 4]);
        payload.truncate(payload.len() - 2);
        assert_eq!(
            mtp.deserialize(&payload),
            Err(DeserializeError::TooLongMessageLength {
                got: 4,
                max_length: 2
            })
        );
    }

    #[test]
    fn plain_messages() {
        let mut mtp = Mtp::new(SESSION_ID);
        let packet = mtp.serialize_plain(&[1, 2, 3, 4]);
        assert_eq!(deserialize_plain(&packet), Ok(vec![1, 2, 3, 4]));

        let mut bad = packet.clone();
        bad[0] = 1;
        assert_eq!(
            deserialize_plain(&bad),
            Err(DeserializeError::BadAuthKey {
                got: 1,
                expected: 0
            })
        );
    }
}
