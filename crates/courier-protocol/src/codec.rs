//! Codec for encoding and decoding Courier messages.
//!
//! Text frames carry JSON. Binary frames carry the same structure encoded as
//! MessagePack with named fields, for clients that prefer a compact form.

use bytes::Bytes;
use thiserror::Error;

use crate::message::Message;

/// Maximum encoded message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    MessageTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Wire encoding of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// JSON, sent as a text frame.
    Json,
    /// MessagePack, sent as a binary frame.
    MessagePack,
}

/// Encode a message as JSON.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(message)?;
    check_size(data.len())?;
    Ok(Bytes::from(data))
}

/// Decode a JSON message.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid message.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    check_size(data.len())?;
    Ok(serde_json::from_slice(data)?)
}

/// Encode a message as MessagePack.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode_binary(message: &Message) -> Result<Bytes, ProtocolError> {
    let data = rmp_serde::to_vec_named(message)?;
    check_size(data.len())?;
    Ok(Bytes::from(data))
}

/// Decode a MessagePack message.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid message.
pub fn decode_binary(data: &[u8]) -> Result<Message, ProtocolError> {
    check_size(data.len())?;
    Ok(rmp_serde::from_slice(data)?)
}

/// Encode with the given encoding.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode_as(message: &Message, encoding: Encoding) -> Result<Bytes, ProtocolError> {
    match encoding {
        Encoding::Json => encode(message),
        Encoding::MessagePack => encode_binary(message),
    }
}

/// Decode with the given encoding.
///
/// # Errors
///
/// Returns an error if decoding fails.
pub fn decode_as(data: &[u8], encoding: Encoding) -> Result<Message, ProtocolError> {
    match encoding {
        Encoding::Json => decode(data),
        Encoding::MessagePack => decode_binary(data),
    }
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }
    Ok(())
}
