// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Seam to the cryptographic primitives.
//!
//! The network core never performs the actual math of MTProto. Instead it
//! relies on a [`CryptoProvider`] for encryption, decryption, and for the
//! [key exchange] used to create new authorization keys.
//!
//! [key exchange]: https://core.telegram.org/mtproto/auth_key
use std::fmt;
use std::time::Duration;

use tgnet_session::AuthKey;

/// The error type for failures in the cryptographic layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The server responded with something unexpected during a key exchange.
    InvalidResponse { reason: String },

    /// The payload could not be decrypted with the key in use.
    ///
    /// This may mean that the authorization key changed while messages were in flight.
    DecryptionFailed { reason: String },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidResponse { reason } => {
                write!(f, "key exchange failed: invalid response: {reason}")
            }
            Self::DecryptionFailed { reason } => write!(f, "decryption failed: {reason}"),
        }
    }
}

/// Result of a finished key exchange.
#[derive(Clone, Debug)]
pub struct GeneratedKey {
    pub auth_key: AuthKey,
    /// Difference between the server's clock and ours, in seconds.
    pub time_offset: i32,
    /// Salt to use in the first encrypted messages.
    pub first_salt: i64,
}

/// One step of an ongoing key exchange.
pub enum KeyExchangeStep {
    /// The given request must be sent as a plain message, and the response fed back.
    Send(Vec<u8>),
    /// The exchange finished.
    Done(GeneratedKey),
}

/// State machine of a single key exchange.
pub trait KeyExchange: Send {
    /// Advances the exchange.
    ///
    /// The first call receives `None`. Every later call receives the body of
    /// the plain response to the last [`KeyExchangeStep::Send`].
    fn step(&mut self, response: Option<&[u8]>) -> Result<KeyExchangeStep, Error>;
}

/// Cryptographic primitives used by the sessions.
pub trait CryptoProvider: Send + Sync {
    /// Begins a new key exchange.
    ///
    /// With `expires_in`, the exchange generates a temporary key valid for that long.
    fn key_exchange(&self, expires_in: Option<Duration>) -> Box<dyn KeyExchange>;

    /// Identifier of the key as known by the server.
    fn auth_key_id(&self, key: &AuthKey) -> i64;

    /// Encrypts a complete plaintext payload (salt, session, and messages) into a packet.
    fn encrypt(&self, key: &AuthKey, plaintext: &[u8]) -> Vec<u8>;

    /// Decrypts a packet into its plaintext payload.
    fn decrypt(&self, key: &AuthKey, packet: &[u8]) -> Result<Vec<u8>, Error>;

    /// Encrypts the serialized `bind_auth_key_inner` with the permanent key,
    /// as required by `auth.bindTempAuthKey`.
    ///
    /// `msg_id` is the identifier of the message carrying the bind request.
    fn encrypt_binding(&self, perm_key: &AuthKey, msg_id: i64, inner: &[u8]) -> Vec<u8>;
}
