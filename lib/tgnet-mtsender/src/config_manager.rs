// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use grammers_tl_types as tl;
use log::{debug, info, warn};
use tgnet_session::{DcFlags, DcOption};

use crate::errors::InvocationError;

/// The parts of the server configuration that the network core cares about.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// Datacenter that answered the configuration request.
    pub this_dc: i32,
    /// Every known way to reach every datacenter.
    pub dc_options: Vec<DcOption>,
    /// How many main connections the server would like the client to keep.
    pub tmp_sessions: Option<i32>,
    /// Moment after which the configuration should be fetched again.
    pub expires_at: SystemTime,
}

impl ServerConfig {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= SystemTime::now()
    }
}

impl From<tl::types::Config> for ServerConfig {
    fn from(config: tl::types::Config) -> Self {
        let dc_options = config
            .dc_options
            .into_iter()
            .filter_map(|tl::enums::DcOption::Option(option)| {
                let address = match option.ip_address.parse::<IpAddr>() {
                    Ok(address) => address,
                    Err(_) => {
                        warn!("skipping dc option with bad address: {}", option.ip_address);
                        return None;
                    }
                };
                Some(DcOption {
                    id: option.id,
                    flags: DcFlags {
                        cdn: option.cdn,
                        media: option.media_only,
                        ipv6: address.is_ipv6(),
                        static_address: option.r#static,
                        tcpo_only: option.tcpo_only,
                    },
                    address,
                    port: option.port as u16,
                })
            })
            .collect();

        Self {
            this_dc: config.this_dc,
            dc_options,
            tmp_sessions: config.tmp_sessions,
            expires_at: UNIX_EPOCH + Duration::from_secs(config.expires.max(0) as u64),
        }
    }
}

/// Where the configuration comes from.
pub trait ConfigSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<ServerConfig, InvocationError>>;
}

/// Criteria used by [`ConfigManager::find_option`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DcOptionQuery {
    pub dc_id: i32,
    pub allow_ipv6: bool,
    pub prefer_ipv6: bool,
    pub allow_media: bool,
    pub prefer_media: bool,
    /// Whether content delivery network options are acceptable.
    pub cdn: bool,
}

/// Handle returned by [`ConfigManager::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&ServerConfig) + Send + Sync>;

/// Caches the server configuration and notifies about its updates.
pub struct ConfigManager {
    source: Box<dyn ConfigSource>,
    cached: Mutex<Option<Arc<ServerConfig>>>,
    fetching: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

impl ConfigManager {
    pub fn new(source: Box<dyn ConfigSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
            fetching: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Cached configuration, regardless of whether it has expired.
    pub fn get_now(&self) -> Option<Arc<ServerConfig>> {
        self.cached.lock().unwrap().clone()
    }

    fn get_fresh(&self) -> Option<Arc<ServerConfig>> {
        self.get_now().filter(|config| !config.is_expired())
    }

    /// Configuration, fetching it if there is none or if it expired.
    pub async fn get(&self) -> Result<Arc<ServerConfig>, InvocationError> {
        if let Some(config) = self.get_fresh() {
            return Ok(config);
        }

        let _guard = self.fetching.lock().await;
        // Someone else may have fetched it while we waited.
        if let Some(config) = self.get_fresh() {
            return Ok(config);
        }
        self.fetch_locked().await
    }

    /// Fetches the configuration if it expired, or unconditionally if `force` is set.
    pub async fn update(&self, force: bool) -> Result<(), InvocationError> {
        if force {
            let _guard = self.fetching.lock().await;
            self.fetch_locked().await.map(drop)
        } else {
            self.get().await.map(drop)
        }
    }

    /// Drops the cached configuration, so the next use fetches it again.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap() = None;
    }

    async fn fetch_locked(&self) -> Result<Arc<ServerConfig>, InvocationError> {
        debug!("fetching server configuration");
        let config = Arc::new(self.source.fetch().await?);
        info!(
            "got configuration from dc {} with {} options",
            config.this_dc,
            config.dc_options.len()
        );
        *self.cached.lock().unwrap() = Some(Arc::clone(&config));

        let listeners = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(&config);
        }
        Ok(config)
    }

    /// Registers a listener that is called after every successful fetch.
    pub fn subscribe(&self, listener: impl Fn(&ServerConfig) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().unwrap().retain(|(other, _)| *other != id);
    }

    /// Best option to reach the queried datacenter, or `None` if it is not known.
    pub async fn find_option(&self, query: &DcOptionQuery) -> Result<Option<DcOption>, InvocationError> {
        let config = self.get().await?;
        Ok(select_option(&config.dc_options, query))
    }
}

/// Picks the option for [`ConfigManager::find_option`].
///
/// Unless something specific is preferred, the least specialized option wins,
/// and among equals the first one in server order.
pub fn select_option(options: &[DcOption], query: &DcOptionQuery) -> Option<DcOption> {
    let candidates = options
        .iter()
        .filter(|option| {
            option.id == query.dc_id
                && !option.flags.tcpo_only
                && (query.allow_ipv6 || !option.flags.ipv6)
                && (query.allow_media || !option.flags.media)
                && (query.cdn || !option.flags.cdn)
        })
        .collect::<Vec<_>>();

    let find = |media: bool, ipv6: bool| {
        candidates
            .iter()
            .find(|option| (!media || option.flags.media) && (!ipv6 || option.flags.ipv6))
            .map(|option| (*option).clone())
    };

    if query.prefer_media && query.prefer_ipv6 {
        if let Some(option) = find(true, true) {
            return Some(option);
        }
    }
    if query.prefer_media {
        if let Some(option) = find(true, false) {
            return Some(option);
        }
    }
    if query.prefer_ipv6 {
        if let Some(option) = find(false, true) {
            return Some(option);
        }
    }

    candidates
        .into_iter()
        .min_by_key(|option| {
            option.flags.media as u8 + option.flags.ipv6 as u8 + option.flags.cdn as u8
        })
        .cloned()
}
