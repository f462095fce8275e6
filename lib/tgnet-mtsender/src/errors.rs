// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use crate::{crypto, mtp, net};
use grammers_tl_types as tl;
use std::{fmt, io};

/// This error occurs when reading from the network fails.
#[derive(Debug)]
pub enum ReadError {
    /// Standard I/O error.
    Io(io::Error),
    /// Error propagated from the underlying [`net`] transport.
    Transport(net::Error),
    /// Error propagated from attempting to deserialize an invalid payload.
    Deserialize(mtp::DeserializeError),
    /// Error propagated from the [`crypto::CryptoProvider`], either while decrypting
    /// a payload or while negotiating a new authorization key.
    Crypto(crypto::Error),
}

impl std::error::Error for ReadError {}

impl Clone for ReadError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(
                e.raw_os_error()
                    .map(io::Error::from_raw_os_error)
                    .unwrap_or_else(|| io::Error::new(e.kind(), e.to_string())),
            ),
            Self::Transport(e) => Self::Transport(e.clone()),
            Self::Deserialize(e) => Self::Deserialize(e.clone()),
            Self::Crypto(e) => Self::Crypto(e.clone()),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "read error, IO failed: {err}"),
            Self::Transport(err) => write!(f, "read error, transport-level: {err}"),
            Self::Deserialize(err) => write!(f, "read error, bad response: {err}"),
            Self::Crypto(err) => write!(f, "read error, crypto failure: {err}"),
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<net::Error> for ReadError {
    fn from(error: net::Error) -> Self {
        Self::Transport(error)
    }
}

impl From<mtp::DeserializeError> for ReadError {
    fn from(error: mtp::DeserializeError) -> Self {
        Self::Deserialize(error)
    }
}

impl From<crypto::Error> for ReadError {
    fn from(error: crypto::Error) -> Self {
        Self::Crypto(error)
    }
}

impl From<tl::deserialize::Error> for ReadError {
    fn from(error: tl::deserialize::Error) -> Self {
        Self::Deserialize(error.into())
    }
}

/// The error type reported by the server when a request is misused.
///
/// These are returned when Telegram respond to an RPC with [`tl::types::RpcError`].
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// A numerical value similar to HTTP response status codes.
    pub code: i32,

    /// The ASCII error name, normally in screaming snake case.
    ///
    /// Digit words are removed from the name and put in the [`RpcError::value`] instead.
    /// ```
    /// use tgnet_mtsender::RpcError;
    /// let rpc_error = RpcError::from(grammers_tl_types::types::RpcError {
    ///         error_code: 303, error_message: "PHONE_MIGRATE_5".into() });
    /// assert_eq!(rpc_error.name, "PHONE_MIGRATE");
    /// assert_eq!(rpc_error.value, Some(5));
    /// ```
    pub name: String,

    /// If the error contained an additional integer value, it will be present here and removed from the [`RpcError::name`].
    pub value: Option<u32>,

    /// The constructor identifier of the request that triggered this error.
    /// Won't be present if the error was artificially constructed.
    pub caused_by: Option<u32>,
}

impl std::error::Error for RpcError {}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.name)?;
        if let Some(caused_by) = self.caused_by {
            write!(f, " caused by {}", tl::name_for_id(caused_by))?;
        }
        if let Some(value) = self.value {
            write!(f, " (value: {value})")?;
        }
        Ok(())
    }
}

impl From<tl::types::RpcError> for RpcError {
    fn from(error: tl::types::RpcError) -> Self {
        // Extract the numeric value in the error, if any
        if let Some((value, parsed_value)) = error
            .error_message
            .split(|c: char| !c.is_ascii_digit())
            .flat_map(|value| {
                value
                    .parse::<u32>()
                    .map(|parsed_value| (value, parsed_value))
            })
            .next()
        {
            let mut to_remove = String::with_capacity(1 + value.len());
            to_remove.push('_');
            to_remove.push_str(value);
            Self {
                code: error.error_code,
                name: error.error_message.replace(&to_remove, ""),
                value: Some(parsed_value),
                caused_by: None,
            }
        } else {
            Self {
                code: error.error_code,
                name: error.error_message.clone(),
                value: None,
                caused_by: None,
            }
        }
    }
}

impl RpcError {
    /// Builds the error reported for requests that are known to still be flood-waited
    /// without contacting the server.
    pub fn flood_wait(seconds: u32) -> Self {
        Self {
            code: 420,
            name: "FLOOD_WAIT".to_string(),
            value: Some(seconds),
            caused_by: None,
        }
    }

    /// Matches on the name of the RPC error (case-sensitive).
    ///
    /// Useful in `match` arm guards. A single trailing or leading asterisk (`'*'`) is allowed,
    /// and will instead check if the error name starts (or ends with) the input parameter.
    ///
    /// # Examples
    ///
    /// ```
    /// # let request_result = Result::<(), _>::Err(tgnet_mtsender::RpcError {
    /// #     code: 303, name: "USER_MIGRATE".to_string(), value: Some(4), caused_by: None });
    /// #
    /// match request_result {
    ///     Err(rpc_err) if rpc_err.is("FLOOD_WAIT") => panic!(),
    ///     Err(rpc_err) if rpc_err.is("*_MIGRATE") => {},
    ///     _ => panic!()
    /// }
    /// ```
    pub fn is(&self, rpc_error: &str) -> bool {
        if let Some(rpc_error) = rpc_error.strip_suffix('*') {
            self.name.starts_with(rpc_error)
        } else if let Some(rpc_error) = rpc_error.strip_prefix('*') {
            self.name.ends_with(rpc_error)
        } else {
            self.name == rpc_error
        }
    }

    /// Attaches the constructor identifier of the request that caused this error
    /// to the error information.
    pub fn with_caused_by(mut self, constructor_id: u32) -> Self {
        self.caused_by = Some(constructor_id);
        self
    }
}

/// This error occurs when a Remote Procedure call was unsuccessful.
#[derive(Debug)]
pub enum InvocationError {
    /// The request invocation failed because it was invalid or the server
    /// could not process it successfully. If the server is suffering from
    /// temporary issues, the request may be retried after some time.
    Rpc(RpcError),

    /// Standard I/O error when reading the response.
    ///
    /// Telegram may kill the connection at any moment, but it is generally valid to retry
    /// the request at least once immediately, which will be done through a new connection.
    Io(io::Error),

    /// Error propagated from attempting to deserialize an invalid response.
    Deserialize(mtp::DeserializeError),

    /// Error propagated from the underlying [`net`] transport.
    ///
    /// The most common variant is [`net::Error::BadStatus`], which can occur when
    /// there's no valid Authorization Key (404) or too many connections have been made (429).
    Transport(net::Error),

    /// The server ignored the message for the given [bad message notification] code,
    /// and it cannot be safely sent again.
    ///
    /// [bad message notification]: https://core.telegram.org/mtproto/service_messages_about_messages#notice-of-ignored-error-message
    BadMessage { code: i32 },

    /// The request was cancelled or dropped, and the results won't arrive.
    /// This may mean that the connection it was sent through has been destroyed.
    Dropped,

    /// No response arrived within the timeout configured for the call.
    ///
    /// The request may still be processed by the server.
    Timeout,

    /// The network manager has not been connected to any datacenter yet.
    NotConnected,

    /// The request was invoked in a datacenter that does not exist or is not known by the configuration.
    InvalidDc,

    /// A new Authorization Key had to be negotiated, but the process failed.
    Authentication(crypto::Error),
}

impl std::error::Error for InvocationError {}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(err) => write!(f, "request error: {err}"),
            Self::Io(err) => write!(f, "request error: {err}"),
            Self::Deserialize(err) => write!(f, "request error: {err}"),
            Self::Transport(err) => write!(f, "request error: {err}"),
            Self::BadMessage { code } => write!(f, "request error: bad message (code {code})"),
            Self::Dropped => write!(f, "request error: dropped (cancelled)"),
            Self::Timeout => write!(f, "request error: timed out"),
            Self::NotConnected => write!(f, "request error: not connected to any dc"),
            Self::InvalidDc => write!(f, "request error: invalid dc"),
            Self::Authentication(err) => write!(f, "request error: {err}"),
        }
    }
}

impl Clone for InvocationError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => ReadError::Io(io::Error::new(e.kind(), e.to_string())).into(),
            Self::Rpc(e) => Self::Rpc(e.clone()),
            Self::Deserialize(e) => Self::Deserialize(e.clone()),
            Self::Transport(e) => Self::Transport(e.clone()),
            Self::BadMessage { code } => Self::BadMessage { code: *code },
            Self::Dropped => Self::Dropped,
            Self::Timeout => Self::Timeout,
            Self::NotConnected => Self::NotConnected,
            Self::InvalidDc => Self::InvalidDc,
            Self::Authentication(e) => Self::Authentication(e.clone()),
        }
    }
}

impl From<ReadError> for InvocationError {
    fn from(error: ReadError) -> Self {
        match error {
            ReadError::Io(error) => Self::from(error),
            ReadError::Transport(error) => Self::from(error),
            ReadError::Deserialize(error) => Self::from(error),
            ReadError::Crypto(error) => Self::Authentication(error),
        }
    }
}

impl From<mtp::DeserializeError> for InvocationError {
    fn from(error: mtp::DeserializeError) -> Self {
        Self::Deserialize(error)
    }
}

impl From<net::Error> for InvocationError {
    fn from(error: net::Error) -> Self {
        Self::Transport(error)
    }
}

impl From<tl::deserialize::Error> for InvocationError {
    fn from(error: tl::deserialize::Error) -> Self {
        Self::Deserialize(error.into())
    }
}

impl From<io::Error> for InvocationError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<crypto::Error> for InvocationError {
    fn from(error: crypto::Error) -> Self {
        Self::Authentication(error)
    }
}

impl InvocationError {
    /// Matches on the name of the RPC error (case-sensitive).
    ///
    /// Useful in `match` arm guards. A single trailing or leading asterisk (`'*'`) is allowed,
    /// and will instead check if the error name starts (or ends with) the input parameter.
    ///
    /// If the error is not a RPC error, returns `false`.
    #[inline]
    pub fn is(&self, rpc_error: &str) -> bool {
        match self {
            Self::Rpc(rpc) => rpc.is(rpc_error),
            _ => false,
        }
    }
}
