// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use grammers_tl_types::{self as tl, Deserializable, RemoteCall};
use log::{debug, info, warn};
use tgnet_session::{DcOption, SelfUser, Session};
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config_manager::{ConfigManager, ConfigSource, DcOptionQuery, ServerConfig, SubscriptionId};
use crate::configuration::{ConnectionKind, NetworkParams, RpcCallOptions};
use crate::crypto::CryptoProvider;
use crate::dc_manager::{DcConnectionManager, DcContext, DcObserver};
use crate::errors::{InvocationError, RpcError};
use crate::net::TransportFactory;
use crate::session_connection::{SessionEvent, init_connection_prefix};

/// RPC error codes that mean the request itself was refused.
/// Any other code is considered a temporary problem on the server's side.
const CLIENT_ERRORS: [i32; 7] = [400, 401, 403, 404, 420, 303, 406];

/// Cached flood waits this close to expiring are not waited for.
const FLOOD_WAIT_IGNORED: Duration = Duration::from_secs(3);
const WORKER_BUSY_DELAY: Duration = Duration::from_secs(1);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Telegram asks clients to fetch the difference after this long without updates.
const NO_UPDATES_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Something that happened to one of the sessions of a datacenter.
#[derive(Clone, Debug)]
pub struct NetworkEvent {
    pub dc_id: i32,
    pub kind: ConnectionKind,
    pub index: usize,
    pub event: SessionEvent,
}

/// Entry point to the network: keeps track of the datacenters in use and
/// executes requests against them.
///
/// Cloning produces another handle to the same network. The connections are
/// only closed by [`NetworkManager::destroy`] or once every handle is dropped.
#[derive(Clone)]
pub struct NetworkManager(Arc<NetworkInner>);

struct NetworkInner {
    ctx: Arc<DcContext>,
    config: ConfigManager,
    dcs: Mutex<HashMap<i32, Arc<OnceCell<DcConnectionManager>>>>,
    primary: Mutex<Option<DcConnectionManager>>,
    switching: tokio::sync::Mutex<()>,
    /// Method name to the moment it can be called again.
    flood_waits: Mutex<HashMap<&'static str, Instant>>,
    last_update: Mutex<Instant>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
    is_premium: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

/// Fetches the configuration with `help.getConfig` on the primary datacenter.
struct RemoteConfig(Weak<NetworkInner>);

impl ConfigSource for RemoteConfig {
    fn fetch(&self) -> BoxFuture<'_, Result<ServerConfig, InvocationError>> {
        let inner = self.0.upgrade();
        async move {
            let network = NetworkManager(inner.ok_or(InvocationError::Dropped)?);
            let tl::enums::Config::Config(config) = network
                .call(&tl::functions::help::GetConfig {}, RpcCallOptions::default())
                .await?;
            Ok(config.into())
        }
        .boxed()
    }
}

struct NetworkRelay(Weak<NetworkInner>);

impl DcObserver for NetworkRelay {
    fn on_dc_event(&self, dc_id: i32, kind: ConnectionKind, index: usize, event: SessionEvent) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_event(dc_id, kind, index, event);
        }
    }
}

fn method_name(body: &[u8]) -> (u32, &'static str) {
    match body.get(..4) {
        Some(id) => {
            let id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
            (id, tl::name_for_id(id))
        }
        None => (0, "(empty)"),
    }
}

impl NetworkInner {
    fn primary(&self) -> Option<DcConnectionManager> {
        self.primary.lock().unwrap().clone()
    }

    fn cell(&self, dc_id: i32) -> Arc<OnceCell<DcConnectionManager>> {
        Arc::clone(self.dcs.lock().unwrap().entry(dc_id).or_default())
    }

    fn managers(&self) -> Vec<DcConnectionManager> {
        self.dcs
            .lock()
            .unwrap()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    fn create_dc(&self, option: DcOption) -> DcConnectionManager {
        DcConnectionManager::new(option, Arc::clone(&self.ctx), self.is_premium.load(Ordering::SeqCst))
    }

    fn option_query(&self, dc_id: i32, allow_media: bool) -> DcOptionQuery {
        let use_ipv6 = self.ctx.params.use_ipv6;
        DcOptionQuery {
            dc_id,
            allow_ipv6: use_ipv6,
            prefer_ipv6: use_ipv6,
            allow_media,
            prefer_media: allow_media,
            cdn: false,
        }
    }

    fn switch_primary(&self, dc: DcConnectionManager) {
        let previous = self.primary.lock().unwrap().replace(dc.clone());
        if let Some(previous) = previous {
            if !previous.ptr_eq(&dc) {
                previous.set_is_primary(false);
            }
        }

        info!("dc {} is now the primary datacenter", dc.dc_id());
        if let Some(config) = self.config.get_now() {
            dc.set_tmp_sessions(config.tmp_sessions.map(|count| count.max(1) as usize));
        }
        dc.load_keys();
        dc.set_is_primary(true);
    }

    fn handle_event(self: &Arc<Self>, dc_id: i32, kind: ConnectionKind, index: usize, event: SessionEvent) {
        let from_primary_main = kind == ConnectionKind::Main
            && index == 0
            && self.primary().is_some_and(|primary| primary.dc_id() == dc_id);

        match &event {
            SessionEvent::Usable if from_primary_main => self.on_primary_usable(),
            SessionEvent::Update(_) => *self.last_update.lock().unwrap() = Instant::now(),
            _ => {}
        }

        let _ = self.events.send(NetworkEvent {
            dc_id,
            kind,
            index,
            event,
        });
    }

    fn on_primary_usable(self: &Arc<Self>) {
        *self.last_update.lock().unwrap() = Instant::now();

        let weak = Arc::downgrade(self);
        let ticker = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let expired = {
                    let mut last_update = inner.last_update.lock().unwrap();
                    let expired = last_update.elapsed() > NO_UPDATES_TIMEOUT;
                    if expired {
                        *last_update = Instant::now();
                    }
                    expired
                };
                if expired {
                    info!("no updates received in a while, running keep-alive action");
                    (inner.ctx.params.keep_alive_action)();
                }
            }
        });
        if let Some(previous) = self.keep_alive.lock().unwrap().replace(ticker) {
            previous.abort();
        }

        // Bots may be granted more than one main session.
        if self.ctx.session.self_user().is_some_and(|user| user.is_bot) {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.config.update(true).await {
                        warn!("failed to refresh configuration: {e}");
                    }
                }
            });
        }
    }

    fn on_config(&self, config: &ServerConfig) {
        if let Some(primary) = self.primary() {
            primary.set_tmp_sessions(config.tmp_sessions.map(|count| count.max(1) as usize));
        }
    }

    /// Waits out or fails on a cached flood wait for the method.
    async fn check_flood_wait(&self, method: &'static str, threshold: u32) -> Result<(), InvocationError> {
        let until = self.flood_waits.lock().unwrap().get(method).copied();
        let Some(until) = until else {
            return Ok(());
        };

        let remaining = until.saturating_duration_since(Instant::now());
        if remaining > Duration::from_secs(threshold.into()) && remaining > FLOOD_WAIT_IGNORED {
            let seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            info!("{method} is still flood-waited for {seconds}s");
            return Err(InvocationError::Rpc(RpcError::flood_wait(seconds as u32)));
        }
        if remaining > FLOOD_WAIT_IGNORED {
            info!("sleeping {remaining:?} until {method} can be called again");
            tokio::time::sleep(remaining).await;
        }

        let mut flood_waits = self.flood_waits.lock().unwrap();
        if flood_waits.get(method) == Some(&until) {
            flood_waits.remove(method);
        }
        Ok(())
    }
}

impl NetworkManager {
    /// Creates a network whose configuration is fetched from the primary datacenter.
    ///
    /// Nothing is connected until [`NetworkManager::connect`] is called.
    /// Events of every session are delivered through the returned receiver.
    pub fn new(
        session: Arc<dyn Session>,
        crypto: Arc<dyn CryptoProvider>,
        params: NetworkParams,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        Self::build(session, crypto, params, None)
    }

    /// Like [`NetworkManager::new`], but with a custom configuration source.
    pub fn with_config_source(
        session: Arc<dyn Session>,
        crypto: Arc<dyn CryptoProvider>,
        params: NetworkParams,
        source: Box<dyn ConfigSource>,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        Self::build(session, crypto, params, Some(source))
    }

    fn build(
        session: Arc<dyn Session>,
        crypto: Arc<dyn CryptoProvider>,
        params: NetworkParams,
        source: Option<Box<dyn ConfigSource>>,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<NetworkInner>| {
            let source = source.unwrap_or_else(|| Box::new(RemoteConfig(weak.clone())));
            let init_prefix = init_connection_prefix(params.api_id, &params.connection_params, params.layer);
            NetworkInner {
                ctx: Arc::new(DcContext {
                    session,
                    crypto,
                    init_prefix,
                    transport: Mutex::new(Arc::clone(&params.transport)),
                    observer: Arc::new(NetworkRelay(weak.clone())),
                    params: params.clone(),
                }),
                config: ConfigManager::new(source),
                dcs: Mutex::new(HashMap::new()),
                primary: Mutex::new(None),
                switching: tokio::sync::Mutex::new(()),
                flood_waits: Mutex::new(HashMap::new()),
                last_update: Mutex::new(Instant::now()),
                keep_alive: Mutex::new(None),
                is_premium: AtomicBool::new(params.is_premium),
                subscription: Mutex::new(None),
                events,
            }
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner.config.subscribe(move |config| {
            if let Some(inner) = weak.upgrade() {
                inner.on_config(config);
            }
        });
        *inner.subscription.lock().unwrap() = Some(subscription);

        (Self(inner), rx)
    }

    pub fn config(&self) -> &ConfigManager {
        &self.0.config
    }

    /// Connects to the initial datacenter, normally [`Session::default_dc`], and makes it primary.
    ///
    /// Connecting again to the same datacenter does nothing.
    pub async fn connect(&self, option: DcOption) -> Result<(), InvocationError> {
        let _guard = self.0.switching.lock().await;
        if self.0.primary().is_some_and(|primary| primary.dc_id() == option.id) {
            return Ok(());
        }

        let dc = self
            .0
            .cell(option.id)
            .get_or_init(|| async { self.0.create_dc(option.clone()) })
            .await
            .clone();
        self.0.switch_primary(dc);
        Ok(())
    }

    /// Makes another datacenter the primary one, remembering it in the session.
    pub async fn change_primary_dc(&self, dc_id: i32) -> Result<(), InvocationError> {
        let _guard = self.0.switching.lock().await;
        if self.primary_dc_id() == Some(dc_id) {
            return Ok(());
        }

        let option = self
            .0
            .config
            .find_option(&self.0.option_query(dc_id, false))
            .await?
            .ok_or(InvocationError::InvalidDc)?;
        let dc = self
            .0
            .cell(dc_id)
            .get_or_init(|| async { self.0.create_dc(option.clone()) })
            .await
            .clone();

        self.0.ctx.session.set_default_dc(&option);
        self.0.switch_primary(dc);
        Ok(())
    }

    /// Manager for a datacenter other than the primary, created on first use.
    ///
    /// Concurrent callers asking for the same datacenter share a single creation.
    pub async fn other_dc(&self, dc_id: i32) -> Result<DcConnectionManager, InvocationError> {
        let cell = self.0.cell(dc_id);
        let dc = cell
            .get_or_try_init(|| async {
                debug!("creating connection manager for dc {dc_id}");
                let option = self
                    .0
                    .config
                    .find_option(&self.0.option_query(dc_id, true))
                    .await?
                    .ok_or(InvocationError::InvalidDc)?;
                let dc = self.0.create_dc(option);
                if !dc.load_keys() {
                    dc.main().request_auth();
                }
                Ok::<_, InvocationError>(dc)
            })
            .await?;
        Ok(dc.clone())
    }

    pub fn primary_dc_id(&self) -> Option<i32> {
        self.0.primary().map(|primary| primary.dc_id())
    }

    /// Manager of the given datacenter, if it was already created.
    pub fn dc(&self, dc_id: i32) -> Option<DcConnectionManager> {
        self.0
            .dcs
            .lock()
            .unwrap()
            .get(&dc_id)
            .and_then(|cell| cell.get().cloned())
    }

    /// Invokes a request, handling flood waits, migrations and authorization
    /// exports along the way.
    pub async fn call<R: RemoteCall>(&self, request: &R, options: RpcCallOptions) -> Result<R::Return, InvocationError> {
        let response = self.call_raw(request.to_bytes(), options).await?;
        Ok(R::Return::from_bytes(&response)?)
    }

    /// [`NetworkManager::call`] with an already-serialized request.
    pub async fn call_raw(&self, body: Vec<u8>, options: RpcCallOptions) -> Result<Vec<u8>, InvocationError> {
        let primary = self.0.primary().ok_or(InvocationError::NotConnected)?;
        let threshold = options
            .flood_sleep_threshold
            .unwrap_or(self.0.ctx.params.flood_sleep_threshold);
        let max_retry_count = options
            .max_retry_count
            .unwrap_or(self.0.ctx.params.max_retry_count);
        let (constructor_id, method) = method_name(&body);

        self.0.check_flood_wait(method, threshold).await?;

        let mut manager = match (&options.manager, options.dc_id) {
            (Some(manager), _) => manager.clone(),
            (None, Some(dc_id)) if dc_id != primary.dc_id() => self.other_dc(dc_id).await?,
            (None, _) => primary,
        };

        let mut last_error = None;
        for _ in 0..max_retry_count {
            let error = match manager
                .pool(options.kind)
                .send_rpc(body.clone(), options.timeout)
                .await
            {
                Ok(response) => {
                    if options.kind == ConnectionKind::Main {
                        *self.0.last_update.lock().unwrap() = Instant::now();
                    }
                    return Ok(response);
                }
                Err(InvocationError::Rpc(error)) => error,
                Err(error) => {
                    debug!("{method} failed, retrying: {error}");
                    last_error = Some(error);
                    continue;
                }
            };

            if !CLIENT_ERRORS.contains(&error.code) {
                warn!("telegram is having internal issues with {method}: {error}, retrying");
                if error.is("WORKER_BUSY_TOO_LONG_RETRY") {
                    tokio::time::sleep(WORKER_BUSY_DELAY).await;
                }
                last_error = Some(InvocationError::Rpc(error));
                continue;
            }

            if error.is("FLOOD_WAIT") || error.is("SLOWMODE_WAIT") || error.is("FLOOD_TEST_PHONE_WAIT") {
                // Observed as zero in the test servers; retrying immediately makes it worse.
                let seconds = error.value.unwrap_or(0).max(1);
                // Slow mode applies to a chat, not to the method.
                if !error.is("SLOWMODE_WAIT") {
                    self.0
                        .flood_waits
                        .lock()
                        .unwrap()
                        .insert(method, Instant::now() + Duration::from_secs(seconds.into()));
                }
                let error = RpcError {
                    value: Some(seconds),
                    ..error
                };
                if seconds > threshold {
                    return Err(InvocationError::Rpc(error));
                }
                info!("sleeping on {} for {seconds}s before retrying {method}", error.name);
                tokio::time::sleep(Duration::from_secs(seconds.into())).await;
                last_error = Some(InvocationError::Rpc(error));
                continue;
            }

            if manager.is_primary() {
                if error.is("PHONE_MIGRATE") || error.is("NETWORK_MIGRATE") || error.is("USER_MIGRATE") {
                    let Some(dc_id) = error.value else {
                        return Err(InvocationError::Rpc(error));
                    };
                    info!("{method} asked to migrate to dc {dc_id}");
                    self.change_primary_dc(dc_id as i32).await?;
                    manager = self.0.primary().ok_or(InvocationError::NotConnected)?;
                    last_error = Some(InvocationError::Rpc(error));
                    continue;
                }
            } else if error.is("AUTH_KEY_UNREGISTERED") {
                warn!("dc {} does not know our authorization, exporting it again", manager.dc_id());
                self.export_auth_to(&manager).await?;
                last_error = Some(InvocationError::Rpc(error));
                continue;
            }

            return Err(InvocationError::Rpc(error.with_caused_by(constructor_id)));
        }

        Err(last_error.unwrap_or(InvocationError::Dropped))
    }

    /// Copies the authorization of the primary datacenter into another one.
    pub fn export_auth_to<'a>(&'a self, manager: &'a DcConnectionManager) -> BoxFuture<'a, Result<(), InvocationError>> {
        async move {
            debug!("exporting authorization to dc {}", manager.dc_id());
            let tl::enums::auth::ExportedAuthorization::Authorization(exported) = self
                .call(
                    &tl::functions::auth::ExportAuthorization {
                        dc_id: manager.dc_id(),
                    },
                    RpcCallOptions::default(),
                )
                .await?;

            let imported = self
                .call(
                    &tl::functions::auth::ImportAuthorization {
                        id: exported.id,
                        bytes: exported.bytes,
                    },
                    RpcCallOptions {
                        manager: Some(manager.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            match imported {
                tl::enums::auth::Authorization::Authorization(_) => {}
                _ => warn!("dc {} asked to sign up after importing authorization", manager.dc_id()),
            }
            Ok(())
        }
        .boxed()
    }

    /// Exports the authorization to every known datacenter, so that requests
    /// sent to them later are already authorized.
    pub async fn export_auth(&self) -> Result<(), InvocationError> {
        let primary_id = self.primary_dc_id().ok_or(InvocationError::NotConnected)?;
        let config = self.0.config.get().await?;
        let dc_ids = config
            .dc_options
            .iter()
            .filter(|option| !option.flags.cdn && option.id != primary_id)
            .map(|option| option.id)
            .collect::<BTreeSet<_>>();

        for dc_id in dc_ids {
            let manager = self.other_dc(dc_id).await?;
            self.export_auth_to(&manager).await?;
        }
        Ok(())
    }

    /// Reacts to a successful sign in: remembers the account, applies its
    /// limits and exports the authorization to the other datacenters.
    pub async fn notify_logged_in(&self, auth: &tl::enums::auth::Authorization) -> Result<(), InvocationError> {
        let tl::enums::auth::Authorization::Authorization(auth) = auth else {
            return Ok(());
        };
        let tl::enums::User::User(user) = &auth.user else {
            return Ok(());
        };

        self.0.ctx.session.set_self_user(Some(SelfUser {
            id: user.id,
            is_bot: user.bot,
        }));
        if let (Some(count), Some(primary)) = (auth.tmp_sessions, self.0.primary()) {
            primary.set_tmp_sessions(Some(count.max(1) as usize));
        }
        self.set_is_premium(user.premium);
        self.export_auth().await
    }

    pub fn set_is_premium(&self, is_premium: bool) {
        debug!("setting premium to {is_premium}");
        self.0.is_premium.store(is_premium, Ordering::SeqCst);
        for dc in self.0.managers() {
            dc.set_is_premium(is_premium);
        }
    }

    /// Starts new sessions in every pool of the primary datacenter.
    pub fn reset_sessions(&self) {
        if let Some(primary) = self.0.primary() {
            primary.reset_sessions();
        }
    }

    /// Size of the given pool, or the size it would have if the datacenter is not in use.
    pub fn pool_size(&self, kind: ConnectionKind, dc_id: Option<i32>) -> Result<usize, InvocationError> {
        let primary = self.0.primary().ok_or(InvocationError::NotConnected)?;
        let dc = match dc_id {
            Some(dc_id) => self.dc(dc_id),
            None => Some(primary.clone()),
        };
        Ok(match dc {
            Some(dc) => dc.pool(kind).pool_size(),
            None => (self.0.ctx.params.connection_count)(
                kind,
                dc_id.unwrap_or(primary.dc_id()),
                self.0.is_premium.load(Ordering::SeqCst),
            ),
        })
    }

    /// Reconnects every session through a different transport.
    pub fn change_transport(&self, transport: Arc<dyn TransportFactory>) {
        *self.0.ctx.transport.lock().unwrap() = Arc::clone(&transport);
        for dc in self.0.managers() {
            dc.change_transport(Arc::clone(&transport));
        }
    }

    /// Closes every connection. Pending requests fail with [`InvocationError::Dropped`].
    pub fn destroy(&self) {
        info!("destroying network");
        for dc in self.0.managers() {
            dc.destroy();
        }
        if let Some(ticker) = self.0.keep_alive.lock().unwrap().take() {
            ticker.abort();
        }
        if let Some(subscription) = self.0.subscription.lock().unwrap().take() {
            self.0.config.unsubscribe(subscription);
        }
    }
}
