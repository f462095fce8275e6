// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transports carry whole MTProto packets between a session and a datacenter.
//!
//! The byte framing used on the wire is up to each [`TransportFactory`]. The
//! [`IntermediateTcp`] factory implements the [intermediate transport] over
//! a plain TCP socket.
//!
//! [intermediate transport]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
mod tcp;

use std::fmt;
use std::io;
use std::net::SocketAddr;

use futures_util::future::BoxFuture;

use crate::errors::ReadError;
pub use tcp::IntermediateTcp;

/// The error type reported by the transports when the framing is wrong.
///
/// The connection should not continue after any of these.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The length is either too short or too long to represent a valid packet.
    BadLen { got: i32 },

    /// A negative length was received, indicating a [transport-level error].
    /// The absolute value of this length behaves like an [HTTP status code]:
    ///
    /// * 404, if the authorization key used was not found, meaning that the
    ///   server is not aware of the key used by the client, so it cannot be
    ///   used to securely communicate with it.
    ///
    /// * 429, if too many transport connections are established to the same
    ///   IP address in a too-short lapse of time.
    ///
    /// [transport-level error]: https://core.telegram.org/mtproto/mtproto-transports#transport-errors
    /// [HTTP status code]: https://developer.mozilla.org/en-US/docs/Web/HTTP/Status
    BadStatus { status: u32 },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: ")?;
        match self {
            Error::BadLen { got } => write!(f, "bad len (got {got})"),
            Error::BadStatus { status } => write!(f, "bad status (negative length -{status})"),
        }
    }
}

/// Where a transport should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Datacenter the address belongs to.
    pub dc_id: i32,
    /// Socket address of the datacenter option.
    pub address: SocketAddr,
    /// Whether the option only serves media.
    pub media: bool,
    /// Whether the test servers are in use.
    pub test_mode: bool,
}

/// Receiving half of a connected transport.
pub trait PacketReader: Send {
    /// Waits for the next whole packet.
    ///
    /// A closed connection is reported as [`io::ErrorKind::UnexpectedEof`].
    fn read_packet(&mut self) -> BoxFuture<'_, Result<Vec<u8>, ReadError>>;
}

/// Sending half of a connected transport.
pub trait PacketWriter: Send {
    /// Frames and writes a whole packet.
    fn write_packet(&mut self, packet: Vec<u8>) -> BoxFuture<'_, io::Result<()>>;
}

/// A connected transport, split into both directions.
pub struct Connection {
    pub reader: Box<dyn PacketReader>,
    pub writer: Box<dyn PacketWriter>,
}

/// Opens transports. Each session connection opens (and re-opens) its own.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, addr: &ServerAddr) -> BoxFuture<'static, io::Result<Connection>>;
}
