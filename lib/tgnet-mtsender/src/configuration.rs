// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use grammers_tl_types as tl;
use log::debug;

use crate::dc_manager::DcConnectionManager;
use crate::net::{IntermediateTcp, TransportFactory};
use crate::reconnection::{LinearBackoff, ReconnectionPolicy};

const DEFAULT_LOCALE: &str = "en";

/// Purpose of a connection pool. Every datacenter has one pool of each kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Regular requests. The only kind that negotiates keys and receives updates.
    #[default]
    Main,
    Upload,
    Download,
    /// Downloads of small files, such as thumbnails or profile photos.
    DownloadSmall,
}

impl ConnectionKind {
    pub const ALL: [ConnectionKind; 4] = [
        ConnectionKind::Main,
        ConnectionKind::Upload,
        ConnectionKind::Download,
        ConnectionKind::DownloadSmall,
    ];
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Main => "main",
            Self::Upload => "upload",
            Self::Download => "download",
            Self::DownloadSmall => "download-small",
        })
    }
}

/// Decides how many connections a pool should hold, given its kind,
/// the datacenter identifier and whether the account is premium.
pub type ConnectionCountDelegate = Arc<dyn Fn(ConnectionKind, i32, bool) -> usize + Send + Sync>;

/// Default amount of connections per pool.
///
/// DCs 2 and 4 get fewer upload connections unless the account is premium.
pub fn default_connection_count(kind: ConnectionKind, dc_id: i32, is_premium: bool) -> usize {
    match kind {
        ConnectionKind::Main => 1,
        ConnectionKind::Upload => {
            if is_premium || (dc_id != 2 && dc_id != 4) {
                8
            } else {
                4
            }
        }
        ConnectionKind::Download => {
            if is_premium {
                8
            } else {
                2
            }
        }
        ConnectionKind::DownloadSmall => 2,
    }
}

/// Metadata sent to the server in `initConnection` by every new session.
///
/// The host application is expected to fill the device and system information.
#[derive(Clone, Debug)]
pub struct ConnectionParams {
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub system_lang_code: String,
    pub lang_code: String,
    pub lang_pack: String,
    #[doc(hidden)]
    pub __non_exhaustive: (),
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            device_model: "Unknown".to_string(),
            system_version: "Unknown".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            system_lang_code: DEFAULT_LOCALE.to_string(),
            lang_code: DEFAULT_LOCALE.to_string(),
            lang_pack: String::new(),
            __non_exhaustive: (),
        }
    }
}

/// Configuration of the whole network core.
#[derive(Clone)]
pub struct NetworkParams {
    /// Developer's API ID, required to interact with the Telegram's API.
    pub api_id: i32,

    pub connection_params: ConnectionParams,

    /// Flood wait errors up to this many seconds are slept through and the request retried.
    /// Can be overridden per call.
    pub flood_sleep_threshold: u32,

    /// How many times a call is attempted before its last error is returned.
    /// Can be overridden per call.
    pub max_retry_count: usize,

    /// Whether to connect to the test servers.
    pub test_mode: bool,

    /// Layer advertised in `invokeWithLayer`.
    pub layer: i32,

    /// Whether IPv6 datacenter options may be used.
    pub use_ipv6: bool,

    /// Whether the account is premium. Changes the default pool sizes.
    pub is_premium: bool,

    /// Whether temporary keys bound to the permanent ones are used to encrypt traffic.
    pub use_pfs: bool,

    /// Whether push updates should be dropped instead of delivered.
    pub disable_updates: bool,

    /// Connections with no pending requests for this long are closed.
    /// Does not apply to the main pool of the primary datacenter.
    pub inactivity_timeout: Duration,

    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,

    pub connection_count: ConnectionCountDelegate,

    /// Runs when the primary datacenter has not produced updates for a long time.
    /// Normally used to fetch the difference.
    pub keep_alive_action: Arc<dyn Fn() + Send + Sync>,

    pub transport: Arc<dyn TransportFactory>,

    #[doc(hidden)]
    pub __non_exhaustive: (),
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            api_id: 0,
            connection_params: ConnectionParams::default(),
            flood_sleep_threshold: 60,
            max_retry_count: 5,
            test_mode: false,
            layer: tl::LAYER,
            use_ipv6: false,
            is_premium: false,
            use_pfs: false,
            disable_updates: false,
            inactivity_timeout: Duration::from_secs(60),
            reconnection_policy: Arc::new(LinearBackoff),
            connection_count: Arc::new(default_connection_count),
            keep_alive_action: Arc::new(|| debug!("no keep-alive action configured")),
            transport: Arc::new(IntermediateTcp),
            __non_exhaustive: (),
        }
    }
}

/// Per-call overrides.
#[derive(Clone, Default)]
pub struct RpcCallOptions {
    /// Overrides [`NetworkParams::flood_sleep_threshold`] for this call.
    pub flood_sleep_threshold: Option<u32>,
    /// Overrides [`NetworkParams::max_retry_count`] for this call.
    pub max_retry_count: Option<usize>,
    /// Bounds the wait of each attempt.
    pub timeout: Option<Duration>,
    /// Pool to send the request through.
    pub kind: ConnectionKind,
    /// Datacenter to send the request to, instead of the primary one.
    pub dc_id: Option<i32>,
    /// Exact manager to use. Takes precedence over `dc_id`.
    pub manager: Option<DcConnectionManager>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_sizes() {
        use ConnectionKind::*;
        assert_eq!(default_connection_count(Main, 2, false), 1);
        assert_eq!(default_connection_count(Upload, 2, false), 4);
        assert_eq!(default_connection_count(Upload, 4, false), 4);
        assert_eq!(default_connection_count(Upload, 1, false), 8);
        assert_eq!(default_connection_count(Upload, 2, true), 8);
        assert_eq!(default_connection_count(Download, 1, false), 2);
        assert_eq!(default_connection_count(Download, 1, true), 8);
        assert_eq!(default_connection_count(DownloadSmall, 5, true), 2);
    }

    #[test]
    fn default_thresholds() {
        let params = NetworkParams::default();
        assert_eq!(params.flood_sleep_threshold, 60);
        assert_eq!(params.max_retry_count, 5);
        assert_eq!(params.inactivity_timeout, Duration::from_secs(60));
        assert_eq!(params.layer, tl::LAYER);
    }
}
