// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Session type definitions.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

/// Capability flags of a [`DcOption`], as advertised by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DcFlags {
    /// The option belongs to a content delivery network datacenter.
    pub cdn: bool,
    /// The option should only be used to download media.
    pub media: bool,
    /// The address is an IPv6 address.
    pub ipv6: bool,
    /// The address is stable and may be saved for future connections.
    pub static_address: bool,
    /// The option only supports the obfuscated TCP transport.
    pub tcpo_only: bool,
}

/// A datacenter option.
///
/// This is very similar to Telegram's own `dcOption` type, and serves as a stable
/// interface to describe where a connection to a datacenter should be made.
///
/// Options are immutable once fetched, and are replaced wholesale on configuration updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcOption {
    /// Datacenter identifier.
    ///
    /// The primary datacenters have IDs from 1 to 5 inclusive.
    pub id: i32,
    /// IP address of this option.
    pub address: IpAddr,
    /// Port of this option.
    pub port: u16,
    /// Capabilities of this option.
    pub flags: DcFlags,
}

impl DcOption {
    /// Socket address to connect to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Opaque authorization key material shared with a datacenter.
///
/// The key is never printed in full, only its length, to prevent it from leaking to logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey(Box<[u8; 256]>);

impl AuthKey {
    /// Wraps raw key material.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        Self(Box::new(data))
    }

    /// Copies the raw key material out.
    pub fn to_bytes(&self) -> [u8; 256] {
        *self.0
    }

    /// Borrows the raw key material.
    pub fn as_bytes(&self) -> &[u8; 256] {
        &self.0
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthKey")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

/// A temporary authorization key, used when Perfect Forward Secrecy is enabled.
///
/// While valid, the temporary key is the one used to encrypt traffic,
/// and it is bound to the permanent key of the same datacenter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempAuthKey {
    /// Key material.
    pub key: AuthKey,
    /// Moment after which the server will no longer accept the key.
    pub expires_at: SystemTime,
}

impl TempAuthKey {
    /// Whether the key can still be used at the given moment.
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }
}

/// Minimal information about the logged-in account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelfUser {
    /// Identifier of the account.
    pub id: i64,
    /// Whether the account is a bot account.
    pub is_bot: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn auth_key_debug_does_not_leak() {
        let key = AuthKey::from_bytes([0x41; 256]);
        let printed = format!("{key:?}");
        assert!(!printed.contains("65"));
        assert!(printed.contains("256"));
    }

    #[test]
    fn temp_key_expiry() {
        let now = SystemTime::now();
        let key = TempAuthKey {
            key: AuthKey::from_bytes([1; 256]),
            expires_at: now + Duration::from_secs(10),
        };
        assert!(key.is_valid_at(now));
        assert!(!key.is_valid_at(now + Duration::from_secs(10)));
    }
}
