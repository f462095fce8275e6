// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library maintains the encrypted connections to Telegram's datacenters.
//!
//! The [`NetworkManager`] is the entry point. It knows which datacenter is the
//! primary one, creates a [`DcConnectionManager`] for every other datacenter
//! that is needed, and executes requests with [`NetworkManager::call`], which
//! takes care of flood waits, migrations and authorization exports.
//!
//! Every datacenter has four [`MultiSessionConnection`] pools, one per
//! [`ConnectionKind`], and each pool holds a number of [`SessionConnection`].
//! Only the main pool generates authorization keys; the rest reuse them.
//!
//! The actual cryptography and key exchange are provided by a [`CryptoProvider`],
//! and the byte transport by a [`TransportFactory`]. Keys and the default
//! datacenter are persisted through a [`tgnet_session::Session`].

#![deny(unsafe_code)]

mod config_manager;
mod configuration;
pub mod crypto;
mod dc_manager;
mod errors;
mod mtp;
mod multi_session;
pub mod net;
mod network_manager;
mod reconnection;
mod session_connection;
mod utils;

pub use config_manager::{
    ConfigManager, ConfigSource, DcOptionQuery, ServerConfig, SubscriptionId, select_option,
};
pub use configuration::{
    ConnectionCountDelegate, ConnectionKind, ConnectionParams, NetworkParams, RpcCallOptions,
    default_connection_count,
};
pub use crypto::{CryptoProvider, KeyExchange};
pub use dc_manager::DcConnectionManager;
pub use errors::{InvocationError, ReadError, RpcError};
pub use mtp::DeserializeError;
pub use multi_session::MultiSessionConnection;
pub use net::{IntermediateTcp, ServerAddr, TransportFactory};
pub use network_manager::{NetworkEvent, NetworkManager};
pub use reconnection::{FixedReconnect, LinearBackoff, NoReconnect, ReconnectionPolicy};
pub use session_connection::{SessionConnection, SessionEvent, SessionObserver, TEMP_KEY_LIFETIME};
