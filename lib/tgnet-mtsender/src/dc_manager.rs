// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connections to a single datacenter.
//!
//! Each datacenter gets four pools, one per [`ConnectionKind`]. Only the main
//! pool is trusted with the authorization state of the datacenter: the keys
//! it generates are persisted and copied over to the other pools.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tgnet_session::{DcOption, Session, TempAuthKey};

use crate::configuration::{ConnectionKind, NetworkParams};
use crate::crypto::CryptoProvider;
use crate::multi_session::MultiSessionConnection;
use crate::net::{ServerAddr, TransportFactory};
use crate::session_connection::{SessionEvent, SessionObserver, SessionParams};

/// Receives the events of every datacenter.
pub(crate) trait DcObserver: Send + Sync {
    fn on_dc_event(&self, dc_id: i32, kind: ConnectionKind, index: usize, event: SessionEvent);
}

/// Everything datacenters share, owned by the network manager.
pub(crate) struct DcContext {
    pub session: Arc<dyn Session>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub params: NetworkParams,
    pub init_prefix: Arc<[u8]>,
    pub transport: Mutex<Arc<dyn TransportFactory>>,
    pub observer: Arc<dyn DcObserver>,
}

/// Connection pools to one datacenter.
///
/// Cloning produces another handle to the same pools.
#[derive(Clone)]
pub struct DcConnectionManager(Arc<DcInner>);

struct DcInner {
    option: DcOption,
    ctx: Arc<DcContext>,
    is_primary: AtomicBool,
    is_premium: AtomicBool,
    /// Size of the main pool advertised by the server, only honored while primary.
    tmp_sessions: Mutex<Option<usize>>,
    main: MultiSessionConnection,
    upload: MultiSessionConnection,
    download: MultiSessionConnection,
    download_small: MultiSessionConnection,
}

struct DcRelay(Weak<DcInner>);

impl SessionObserver for DcRelay {
    fn on_session_event(&self, kind: ConnectionKind, index: usize, event: SessionEvent) {
        if let Some(dc) = self.0.upgrade() {
            dc.handle_event(kind, index, event);
        }
    }
}

impl DcInner {
    fn pool(&self, kind: ConnectionKind) -> &MultiSessionConnection {
        match kind {
            ConnectionKind::Main => &self.main,
            ConnectionKind::Upload => &self.upload,
            ConnectionKind::Download => &self.download,
            ConnectionKind::DownloadSmall => &self.download_small,
        }
    }

    fn siblings(&self) -> [&MultiSessionConnection; 3] {
        [&self.upload, &self.download, &self.download_small]
    }

    fn pool_count(&self, kind: ConnectionKind) -> usize {
        if kind == ConnectionKind::Main && self.is_primary.load(Ordering::SeqCst) {
            if let Some(count) = *self.tmp_sessions.lock().unwrap() {
                return count;
            }
        }
        (self.ctx.params.connection_count)(kind, self.option.id, self.is_premium.load(Ordering::SeqCst))
    }

    fn resize(&self) {
        for kind in ConnectionKind::ALL {
            self.pool(kind).set_count(self.pool_count(kind));
        }
    }

    fn handle_event(&self, kind: ConnectionKind, index: usize, event: SessionEvent) {
        let dc_id = self.option.id;
        if kind != ConnectionKind::Main {
            match event {
                SessionEvent::RequestAuth => {
                    info!("dc {dc_id} {kind} #{index} lost its key, asking main to authorize");
                    self.main.request_auth();
                }
                SessionEvent::KeyChange(_) | SessionEvent::TempKeyChange { .. } | SessionEvent::AuthBegin => {
                    warn!("ignoring key event from dc {dc_id} {kind} #{index}");
                    return;
                }
                SessionEvent::Usable | SessionEvent::Update(_) | SessionEvent::Error(_) => {}
            }
            self.ctx.observer.on_dc_event(dc_id, kind, index, event);
            return;
        }

        match &event {
            SessionEvent::KeyChange(key) => {
                debug!("dc {dc_id} got a new permanent key from #{index}");
                self.ctx.session.set_auth_key(dc_id, key.as_ref());
                for pool in self.siblings() {
                    pool.set_auth_key(key.clone(), None);
                    pool.notify_key_change();
                }
            }
            SessionEvent::TempKeyChange { key, expires_at } => {
                debug!("dc {dc_id} got a new temporary key from #{index}");
                self.ctx
                    .session
                    .set_temp_auth_key(dc_id, index, key.as_ref(), *expires_at);
                if index == 0 {
                    let temp = key.clone().map(|key| TempAuthKey {
                        key,
                        expires_at: *expires_at,
                    });
                    for pool in self.siblings() {
                        pool.set_temp_auth_key(temp.clone(), None);
                        pool.notify_key_change();
                    }
                }
            }
            SessionEvent::AuthBegin => {
                for pool in self.siblings() {
                    pool.reset_auth_keys();
                }
            }
            SessionEvent::RequestAuth => self.main.request_auth(),
            SessionEvent::Usable | SessionEvent::Update(_) | SessionEvent::Error(_) => {}
        }
        self.ctx.observer.on_dc_event(dc_id, kind, index, event);
    }
}

impl DcConnectionManager {
    pub(crate) fn new(option: DcOption, ctx: Arc<DcContext>, is_premium: bool) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<DcInner>| {
            let relay: Arc<dyn SessionObserver> = Arc::new(DcRelay(weak.clone()));
            let transport = Arc::clone(&ctx.transport.lock().unwrap());
            let inactivity_timeout = Some(ctx.params.inactivity_timeout);
            let pool = |kind| {
                let params = Arc::new(SessionParams {
                    kind,
                    addr: ServerAddr {
                        dc_id: option.id,
                        address: option.socket_addr(),
                        media: option.flags.media,
                        test_mode: ctx.params.test_mode,
                    },
                    crypto: Arc::clone(&ctx.crypto),
                    reconnection_policy: Arc::clone(&ctx.params.reconnection_policy),
                    init_prefix: Arc::clone(&ctx.init_prefix),
                    use_pfs: ctx.params.use_pfs,
                    disable_updates: ctx.params.disable_updates,
                });
                let count = (ctx.params.connection_count)(kind, option.id, is_premium);
                MultiSessionConnection::new(
                    params,
                    count,
                    Arc::clone(&transport),
                    inactivity_timeout,
                    Arc::clone(&relay),
                )
            };

            DcInner {
                main: pool(ConnectionKind::Main),
                upload: pool(ConnectionKind::Upload),
                download: pool(ConnectionKind::Download),
                download_small: pool(ConnectionKind::DownloadSmall),
                option: option.clone(),
                ctx: Arc::clone(&ctx),
                is_primary: AtomicBool::new(false),
                is_premium: AtomicBool::new(is_premium),
                tmp_sessions: Mutex::new(None),
            }
        });
        info!("created connection manager for dc {}", inner.option.id);
        Self(inner)
    }

    pub fn dc_id(&self) -> i32 {
        self.0.option.id
    }

    pub fn option(&self) -> &DcOption {
        &self.0.option
    }

    pub fn is_primary(&self) -> bool {
        self.0.is_primary.load(Ordering::SeqCst)
    }

    /// The primary datacenter keeps its main pool connected at all times.
    pub fn set_is_primary(&self, is_primary: bool) {
        self.0.is_primary.store(is_primary, Ordering::SeqCst);
        let timeout: Option<Duration> = if is_primary {
            None
        } else {
            Some(self.0.ctx.params.inactivity_timeout)
        };
        self.0.main.set_inactivity_timeout(timeout);
        self.0.resize();
        if is_primary {
            self.0.main.ensure_connected();
        }
    }

    pub fn set_is_premium(&self, is_premium: bool) {
        if self.0.is_premium.swap(is_premium, Ordering::SeqCst) != is_premium {
            self.0.resize();
        }
    }

    /// Amount of main sessions the server allows for this account, used while primary.
    pub fn set_tmp_sessions(&self, count: Option<usize>) {
        *self.0.tmp_sessions.lock().unwrap() = count.map(|count| count.max(1));
        self.0.resize();
    }

    /// Installs the stored keys on every pool.
    ///
    /// Returns whether a permanent key was stored.
    pub fn load_keys(&self) -> bool {
        let dc_id = self.0.option.id;
        let session = &self.0.ctx.session;
        let perm = session.auth_key(dc_id);
        for kind in ConnectionKind::ALL {
            self.0.pool(kind).set_auth_key(perm.clone(), None);
        }

        if self.0.ctx.params.use_pfs {
            for index in 0..self.0.main.pool_size() {
                self.0
                    .main
                    .set_temp_auth_key(session.temp_auth_key(dc_id, index), Some(index));
            }
            let temp = session.temp_auth_key(dc_id, 0);
            for pool in self.0.siblings() {
                pool.set_temp_auth_key(temp.clone(), None);
            }
        }

        debug!("loaded keys for dc {dc_id} (permanent key: {})", perm.is_some());
        perm.is_some()
    }

    pub fn pool(&self, kind: ConnectionKind) -> &MultiSessionConnection {
        self.0.pool(kind)
    }

    pub fn main(&self) -> &MultiSessionConnection {
        &self.0.main
    }

    pub fn reset_sessions(&self) {
        for kind in ConnectionKind::ALL {
            self.0.pool(kind).reset_sessions();
        }
    }

    pub fn change_transport(&self, transport: Arc<dyn TransportFactory>) {
        for kind in ConnectionKind::ALL {
            self.0.pool(kind).change_transport(Arc::clone(&transport));
        }
    }

    pub fn destroy(&self) {
        debug!("destroying connection manager for dc {}", self.0.option.id);
        for kind in ConnectionKind::ALL {
            self.0.pool(kind).destroy();
        }
    }

    /// Whether both handles point to the same manager.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
