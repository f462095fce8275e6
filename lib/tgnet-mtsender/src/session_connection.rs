// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A single encrypted session with a datacenter.
//!
//! Every [`SessionConnection`] is a cheap handle to an actor task that owns
//! the transport, the MTProto state and the queue of in-flight requests.
//! The handle talks to the task through a command channel, except for the
//! authorization keys, which live in a shared [`watch`] slot so that they
//! can be replaced synchronously from any thread.
use std::borrow::Cow;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BufMut;
use grammers_tl_types::{self as tl, Serializable};
use log::{debug, info, trace, warn};
use tgnet_session::{AuthKey, TempAuthKey};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::configuration::{ConnectionKind, ConnectionParams};
use crate::crypto::{self, CryptoProvider, GeneratedKey, KeyExchangeStep};
use crate::errors::{InvocationError, ReadError};
use crate::mtp::{self, Deserialization, MsgId, Mtp};
use crate::net::{self, PacketWriter, ServerAddr, TransportFactory};
use crate::reconnection::ReconnectionPolicy;
use crate::utils;

const PING_INTERVAL: Duration = Duration::from_secs(60);
const PING_DISCONNECT_DELAY: i32 = 75;
const KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
const BIND_ATTEMPTS: usize = 3;

/// How long generated temporary keys are valid for.
pub const TEMP_KEY_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// `bind_auth_key_inner#75a3f765 nonce:long temp_auth_key_id:long perm_auth_key_id:long
/// temp_session_id:long expires_at:int = BindAuthKeyInner;`
const BIND_AUTH_KEY_INNER: u32 = 0x75a3f765;

/// Something that happened to a session.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// A new permanent key was generated (or the key was lost, with `None`).
    KeyChange(Option<AuthKey>),
    /// A new temporary key was generated and bound.
    TempKeyChange {
        key: Option<AuthKey>,
        expires_at: SystemTime,
    },
    /// A permanent key is about to be generated.
    AuthBegin,
    /// The session lost its key but is not allowed to generate one.
    RequestAuth,
    /// The session is connected and holds a key, so requests will be sent.
    Usable,
    /// The server pushed something that was not an answer to a request.
    Update(Vec<u8>),
    /// The transport failed.
    Error(ReadError),
}

/// Receives the events of sessions.
///
/// Called from within the session task, so implementations must not block.
pub trait SessionObserver: Send + Sync {
    fn on_session_event(&self, kind: ConnectionKind, index: usize, event: SessionEvent);
}

/// Authorization keys available to a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Keys {
    pub perm: Option<AuthKey>,
    pub temp: Option<TempAuthKey>,
}

/// Settings shared by all the sessions of a pool.
pub(crate) struct SessionParams {
    pub kind: ConnectionKind,
    pub addr: ServerAddr,
    pub crypto: Arc<dyn CryptoProvider>,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub init_prefix: Arc<[u8]>,
    pub use_pfs: bool,
    pub disable_updates: bool,
}

/// Serializes `invokeWithLayer(initConnection(...))` up to, but not including,
/// the inner query. Appending any request produces its wrapped form.
pub(crate) fn init_connection_prefix(api_id: i32, params: &ConnectionParams, layer: i32) -> Arc<[u8]> {
    let mut prefix = tl::functions::InvokeWithLayer {
        layer,
        query: tl::functions::InitConnection {
            api_id,
            device_model: params.device_model.clone(),
            system_version: params.system_version.clone(),
            app_version: params.app_version.clone(),
            system_lang_code: params.system_lang_code.clone(),
            lang_pack: params.lang_pack.clone(),
            lang_code: params.lang_code.clone(),
            proxy: None,
            params: None,
            query: tl::functions::help::GetConfig {},
        },
    }
    .to_bytes();
    // `help.getConfig` has no parameters, so only its constructor is at the end.
    prefix.truncate(prefix.len() - 4);
    prefix.into()
}

enum Command {
    Invoke {
        body: Vec<u8>,
        tx: oneshot::Sender<Result<Vec<u8>, InvocationError>>,
    },
    ResetSession(i64),
    NotifyKeyChange,
    RequestAuth,
    SetInactivityTimeout(Option<Duration>),
    ChangeTransport(Arc<dyn TransportFactory>),
    EnsureConnected,
    Destroy,
}

/// Handle to one session. Dropping every clone of it stops the session.
#[derive(Clone)]
pub struct SessionConnection {
    kind: ConnectionKind,
    index: usize,
    commands: mpsc::UnboundedSender<Command>,
    keys: Arc<watch::Sender<Keys>>,
    session_id: Arc<AtomicI64>,
}

impl SessionConnection {
    pub(crate) fn spawn(
        params: Arc<SessionParams>,
        index: usize,
        keys: Keys,
        transport: Arc<dyn TransportFactory>,
        inactivity_timeout: Option<Duration>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (keys_tx, keys_rx) = watch::channel(keys);
        let keys_tx = Arc::new(keys_tx);
        let session_id = utils::random_i64();
        let shared_session_id = Arc::new(AtomicI64::new(session_id));
        let kind = params.kind;
        let now = Instant::now();

        let actor = Actor {
            tag: format!("[dc {} {kind} #{index}]", params.addr.dc_id),
            index,
            params,
            transport,
            observer,
            commands,
            keys_tx: Arc::clone(&keys_tx),
            keys_rx,
            session_id: Arc::clone(&shared_session_id),
            mtp: Mtp::new(session_id),
            active_key: None,
            requests: Vec::new(),
            link: None,
            inactivity_timeout,
            last_activity: now,
            next_ping: now + PING_INTERVAL,
            attempts: 0,
            retry_at: None,
            keep_connected: false,
            destroyed: false,
        };
        tokio::spawn(actor.run());

        Self {
            kind,
            index,
            commands: commands_tx,
            keys: keys_tx,
            session_id: shared_session_id,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Position of this session inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identifier of the current MTProto session.
    pub fn session_id(&self) -> i64 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub fn auth_key(&self) -> Option<AuthKey> {
        self.keys.borrow().perm.clone()
    }

    pub fn temp_auth_key(&self) -> Option<TempAuthKey> {
        self.keys.borrow().temp.clone()
    }

    pub(crate) fn keys(&self) -> Keys {
        self.keys.borrow().clone()
    }

    fn send(&self, command: Command) {
        // The task only stops after being destroyed, at which point commands are moot.
        let _ = self.commands.send(command);
    }

    /// Sends a serialized request and waits for its serialized response.
    ///
    /// With a `timeout`, the wait ends with [`InvocationError::Timeout`],
    /// although the request is not taken back from the server.
    pub async fn invoke(&self, body: Vec<u8>, timeout: Option<Duration>) -> Result<Vec<u8>, InvocationError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Invoke { body, tx })
            .map_err(|_| InvocationError::Dropped)?;

        let response = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| InvocationError::Timeout)?,
            None => rx.await,
        };
        response.map_err(|_| InvocationError::Dropped)?
    }

    pub fn set_auth_key(&self, key: Option<AuthKey>) {
        self.keys.send_modify(|keys| keys.perm = key);
    }

    pub fn set_temp_auth_key(&self, key: Option<TempAuthKey>) {
        self.keys.send_modify(|keys| keys.temp = key);
    }

    /// Forgets both keys. Takes effect before any further request is sent.
    pub fn reset_auth_keys(&self) {
        self.keys.send_replace(Keys::default());
    }

    /// Starts a new MTProto session with a fresh identifier.
    pub fn reset_session(&self) {
        let session_id = utils::random_i64();
        self.session_id.store(session_id, Ordering::SeqCst);
        self.send(Command::ResetSession(session_id));
    }

    /// Re-sends in-flight requests, since they may have used a key that is no longer valid.
    pub fn notify_key_change(&self) {
        self.send(Command::NotifyKeyChange);
    }

    /// Discards the keys and generates new ones. Only main sessions are able to.
    ///
    /// Under forward secrecy only the temporary key is replaced.
    pub fn request_auth(&self) {
        self.send(Command::RequestAuth);
    }

    pub fn set_inactivity_timeout(&self, timeout: Option<Duration>) {
        self.send(Command::SetInactivityTimeout(timeout));
    }

    pub fn change_transport(&self, transport: Arc<dyn TransportFactory>) {
        self.send(Command::ChangeTransport(transport));
    }

    /// Connects even if there are no requests to send.
    pub fn ensure_connected(&self) {
        self.send(Command::EnsureConnected);
    }

    /// Closes the connection and fails every pending request with [`InvocationError::Dropped`].
    pub fn destroy(&self) {
        self.send(Command::Destroy);
    }
}

enum RequestState {
    NotSerialized,
    Sent {
        msg_id: MsgId,
        container_msg_id: Option<MsgId>,
    },
}

struct Request {
    body: Vec<u8>,
    state: RequestState,
    result: oneshot::Sender<Result<Vec<u8>, InvocationError>>,
    ping: bool,
    /// Whether it was sent inside `initConnection`.
    wrapped: bool,
}

impl Request {
    fn is_sent_as(&self, id: MsgId) -> bool {
        match self.state {
            RequestState::Sent {
                msg_id,
                container_msg_id,
            } => msg_id == id || container_msg_id == Some(id),
            RequestState::NotSerialized => false,
        }
    }
}

struct Link {
    writer: Box<dyn PacketWriter>,
    packets: mpsc::UnboundedReceiver<Result<Vec<u8>, ReadError>>,
    reader: JoinHandle<()>,
    /// Whether `initConnection` was already sent through this link.
    initialized: bool,
    usable: bool,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

enum Wake {
    Command(Option<Command>),
    Packet(Option<Result<Vec<u8>, ReadError>>),
    KeysChanged,
    Ping,
    Idle,
    Retry,
}

enum BindOutcome {
    Bound,
    Retry,
    Failed(String),
}

struct Actor {
    tag: String,
    index: usize,
    params: Arc<SessionParams>,
    transport: Arc<dyn TransportFactory>,
    observer: Arc<dyn SessionObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    keys_tx: Arc<watch::Sender<Keys>>,
    keys_rx: watch::Receiver<Keys>,
    session_id: Arc<AtomicI64>,
    mtp: Mtp,
    /// Key the current session encrypts with.
    active_key: Option<AuthKey>,
    requests: Vec<Request>,
    link: Option<Link>,
    inactivity_timeout: Option<Duration>,
    last_activity: Instant,
    next_ping: Instant,
    attempts: usize,
    retry_at: Option<Instant>,
    keep_connected: bool,
    destroyed: bool,
}

fn not_connected() -> ReadError {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not connected").into()
}

async fn recv_within(
    packets: &mut mpsc::UnboundedReceiver<Result<Vec<u8>, ReadError>>,
    duration: Duration,
) -> Result<Vec<u8>, ReadError> {
    match tokio::time::timeout(duration, packets.recv()).await {
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "server did not respond in time").into()),
        Ok(None) => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        Ok(Some(packet)) => packet,
    }
}

impl Actor {
    async fn run(mut self) {
        debug!("{} session started", self.tag);
        while !self.destroyed {
            if let Err(error) = self.step().await {
                self.on_link_failure(error);
            }
        }
        self.link = None;
        for request in self.requests.drain(..) {
            let _ = request.result.send(Err(InvocationError::Dropped));
        }
        debug!("{} session stopped", self.tag);
    }

    async fn step(&mut self) -> Result<(), ReadError> {
        self.sync_keys();
        self.ensure_link().await?;
        self.flush().await?;
        self.wait().await
    }

    fn emit(&self, event: SessionEvent) {
        self.observer
            .on_session_event(self.params.kind, self.index, event);
    }

    fn is_main(&self) -> bool {
        self.params.kind == ConnectionKind::Main
    }

    fn encryption_key(&self) -> Option<AuthKey> {
        let keys = self.keys_rx.borrow();
        if self.params.use_pfs {
            keys.temp
                .as_ref()
                .filter(|temp| temp.is_valid_at(SystemTime::now()))
                .map(|temp| temp.key.clone())
        } else {
            keys.perm.clone()
        }
    }

    /// Whether this session may generate the key it needs on its own.
    fn can_prepare_keys(&self) -> bool {
        if !self.is_main() {
            return false;
        }
        self.index == 0 || (self.params.use_pfs && self.keys_rx.borrow().perm.is_some())
    }

    fn has_live_requests(&self) -> bool {
        self.requests
            .iter()
            .any(|request| !request.ping && !request.result.is_closed())
    }

    fn wants_link(&self) -> bool {
        (self.has_live_requests() || self.keep_connected)
            && (self.encryption_key().is_some() || self.can_prepare_keys())
    }

    /// Picks up key changes made through the handles.
    fn sync_keys(&mut self) {
        self.keys_rx.borrow_and_update();
        let key = self.encryption_key();
        if key == self.active_key {
            return;
        }

        if self.active_key.is_some() && key.is_some() {
            debug!("{} key changed, starting a new session", self.tag);
            self.start_new_session(utils::random_i64());
        }
        if key.is_none() {
            if let Some(link) = self.link.as_mut() {
                link.usable = false;
            }
        }
        self.active_key = key;
    }

    fn start_new_session(&mut self, session_id: i64) {
        self.session_id.store(session_id, Ordering::SeqCst);
        self.mtp.reset_session(session_id);
        if let Some(link) = self.link.as_mut() {
            link.initialized = false;
        }
        self.requeue_sent();
    }

    /// Makes every sent request pending again, so that it is sent once more.
    fn requeue_sent(&mut self) {
        self.requests.retain_mut(|request| {
            if let RequestState::Sent { .. } = request.state {
                if request.ping || request.result.is_closed() {
                    return false;
                }
                request.state = RequestState::NotSerialized;
                request.wrapped = false;
            }
            true
        });
    }

    async fn ensure_link(&mut self) -> Result<(), ReadError> {
        if self.retry_at.is_some() || !self.wants_link() {
            return Ok(());
        }
        if self.link.is_none() {
            self.connect().await?;
        }
        self.prepare_keys().await?;
        self.sync_keys();

        let became_usable = match self.link.as_mut() {
            Some(link) if !link.usable && self.active_key.is_some() => {
                link.usable = true;
                true
            }
            _ => false,
        };
        if became_usable {
            debug!("{} session is usable", self.tag);
            self.next_ping = Instant::now() + PING_INTERVAL;
            self.emit(SessionEvent::Usable);
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), ReadError> {
        let connection = self.transport.connect(&self.params.addr).await?;
        let (tx, packets) = mpsc::unbounded_channel();
        let mut reader = connection.reader;
        let reader = tokio::spawn(async move {
            loop {
                let packet = reader.read_packet().await;
                let failed = packet.is_err();
                if tx.send(packet).is_err() || failed {
                    break;
                }
            }
        });

        self.link = Some(Link {
            writer: connection.writer,
            packets,
            reader,
            initialized: false,
            usable: false,
        });
        self.last_activity = Instant::now();
        info!("{} connected", self.tag);
        Ok(())
    }

    /// Generates the keys a main session is missing.
    async fn prepare_keys(&mut self) -> Result<(), ReadError> {
        if !self.is_main() {
            return Ok(());
        }

        let perm = self.keys_rx.borrow().perm.clone();
        let perm = match perm {
            Some(perm) => perm,
            None if self.index == 0 => {
                info!("{} generating new authorization key", self.tag);
                self.emit(SessionEvent::AuthBegin);
                let generated = self.negotiate(None).await?;
                self.apply_generated(&generated);
                let key = generated.auth_key;
                self.keys_tx.send_modify(|keys| {
                    keys.perm = Some(key.clone());
                    keys.temp = None;
                });
                self.emit(SessionEvent::KeyChange(Some(key.clone())));
                key
            }
            None => return Ok(()),
        };

        if self.params.use_pfs && self.encryption_key().is_none() {
            info!("{} generating new temporary authorization key", self.tag);
            let generated = self.negotiate(Some(TEMP_KEY_LIFETIME)).await?;
            let expires_at = SystemTime::now() + TEMP_KEY_LIFETIME;
            self.apply_generated(&generated);
            self.bind_temp_key(&perm, &generated.auth_key, expires_at)
                .await?;

            let temp = TempAuthKey {
                key: generated.auth_key,
                expires_at,
            };
            self.keys_tx
                .send_modify(|keys| keys.temp = Some(temp.clone()));
            self.emit(SessionEvent::TempKeyChange {
                key: Some(temp.key),
                expires_at,
            });
        }
        Ok(())
    }

    fn apply_generated(&mut self, generated: &GeneratedKey) {
        self.mtp.set_salt(generated.first_salt);
        self.mtp.set_time_offset(generated.time_offset);
    }

    async fn negotiate(&mut self, expires_in: Option<Duration>) -> Result<GeneratedKey, ReadError> {
        let mut exchange = self.params.crypto.key_exchange(expires_in);
        let mut response = None::<Vec<u8>>;
        loop {
            match exchange.step(response.as_deref())? {
                KeyExchangeStep::Send(request) => {
                    let packet = self.mtp.serialize_plain(&request);
                    let link = self.link.as_mut().ok_or_else(not_connected)?;
                    link.writer.write_packet(packet).await?;
                    let packet = recv_within(&mut link.packets, KEY_EXCHANGE_TIMEOUT).await?;
                    response = Some(mtp::deserialize_plain(&packet)?);
                }
                KeyExchangeStep::Done(generated) => return Ok(generated),
            }
        }
    }

    /// Binds a freshly generated temporary key to the permanent one with `auth.bindTempAuthKey`.
    async fn bind_temp_key(
        &mut self,
        perm: &AuthKey,
        temp: &AuthKey,
        expires_at: SystemTime,
    ) -> Result<(), ReadError> {
        let crypto = Arc::clone(&self.params.crypto);
        let expires_at = expires_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i32;
        let perm_auth_key_id = crypto.auth_key_id(perm);

        for _ in 0..BIND_ATTEMPTS {
            let nonce = utils::random_i64();
            let msg_id = self.mtp.new_msg_id();
            let mut inner = Vec::with_capacity(40);
            inner.put_u32_le(BIND_AUTH_KEY_INNER);
            inner.put_i64_le(nonce);
            inner.put_i64_le(crypto.auth_key_id(temp));
            inner.put_i64_le(perm_auth_key_id);
            inner.put_i64_le(self.mtp.session_id());
            inner.put_i32_le(expires_at);

            let request = tl::functions::auth::BindTempAuthKey {
                perm_auth_key_id,
                nonce,
                expires_at,
                encrypted_message: crypto.encrypt_binding(perm, msg_id.0, &inner),
            }
            .to_bytes();
            let payload = self.mtp.serialize_with_id(msg_id, &request);
            let link = self.link.as_mut().ok_or_else(not_connected)?;
            link.writer.write_packet(crypto.encrypt(temp, &payload)).await?;

            let outcome = loop {
                let link = self.link.as_mut().ok_or_else(not_connected)?;
                let packet = recv_within(&mut link.packets, KEY_EXCHANGE_TIMEOUT).await?;
                let plaintext = crypto.decrypt(temp, &packet)?;

                let mut outcome = None;
                for item in self.mtp.deserialize(&plaintext)? {
                    match item {
                        Deserialization::RpcResult { msg_id: id, .. } if id == msg_id => {
                            outcome = Some(BindOutcome::Bound);
                        }
                        Deserialization::RpcError { msg_id: id, error } if id == msg_id => {
                            outcome = Some(BindOutcome::Failed(error.to_string()));
                        }
                        Deserialization::BadMessage { msg_id: id, code } if id == msg_id => {
                            outcome = Some(if mtp::bad_message_retryable(code) {
                                BindOutcome::Retry
                            } else {
                                BindOutcome::Failed(mtp::bad_message_description(code).to_string())
                            });
                        }
                        item => self.handle_item(item),
                    }
                }
                if let Some(outcome) = outcome {
                    break outcome;
                }
            };

            match outcome {
                BindOutcome::Bound => {
                    debug!("{} temporary key bound", self.tag);
                    return Ok(());
                }
                BindOutcome::Retry => continue,
                BindOutcome::Failed(reason) => {
                    return Err(crypto::Error::InvalidResponse { reason }.into());
                }
            }
        }

        Err(crypto::Error::InvalidResponse {
            reason: "temporary key could not be bound".to_string(),
        }
        .into())
    }

    /// Serializes, encrypts and writes every pending request.
    async fn flush(&mut self) -> Result<(), ReadError> {
        let Some(key) = self.active_key.clone() else {
            return Ok(());
        };
        if !self.link.as_ref().is_some_and(|link| link.usable) {
            return Ok(());
        }

        // Requests nobody waits for anymore need not be sent at all.
        self.requests.retain(|request| {
            request.ping
                || !matches!(request.state, RequestState::NotSerialized)
                || !request.result.is_closed()
        });

        loop {
            let mut batch = Vec::new();
            let mut size = 0;
            let mut remaining = false;
            for (i, request) in self.requests.iter().enumerate() {
                if !matches!(request.state, RequestState::NotSerialized) {
                    continue;
                }
                if batch.len() == mtp::MAX_CONTAINER_MESSAGES
                    || (!batch.is_empty() && size + request.body.len() > mtp::MAX_CONTAINER_LEN)
                {
                    remaining = true;
                    break;
                }
                size += request.body.len();
                batch.push(i);
            }
            if batch.is_empty() && !self.mtp.has_pending_acks() {
                return Ok(());
            }

            let link = self.link.as_mut().ok_or_else(not_connected)?;
            let mut wrap_index = None;
            let serialized = {
                let bodies = batch
                    .iter()
                    .map(|&i| {
                        let request = &self.requests[i];
                        if !request.ping && !link.initialized {
                            link.initialized = true;
                            wrap_index = Some(i);
                            let mut wrapped = self.params.init_prefix.to_vec();
                            wrapped.extend_from_slice(&request.body);
                            Cow::Owned(wrapped)
                        } else {
                            Cow::Borrowed(&request.body[..])
                        }
                    })
                    .collect::<Vec<_>>();
                let bodies = bodies.iter().map(|body| body.as_ref()).collect::<Vec<_>>();
                self.mtp.serialize(&bodies)
            };
            let Some(serialized) = serialized else {
                return Ok(());
            };

            for (&i, &msg_id) in batch.iter().zip(serialized.msg_ids.iter()) {
                let request = &mut self.requests[i];
                request.state = RequestState::Sent {
                    msg_id,
                    container_msg_id: serialized.container_msg_id,
                };
                request.wrapped = wrap_index == Some(i);
            }

            trace!(
                "{} sending {} messages ({} bytes)",
                self.tag,
                batch.len(),
                serialized.payload.len()
            );
            let packet = self.params.crypto.encrypt(&key, &serialized.payload);
            link.writer.write_packet(packet).await?;

            if !remaining {
                return Ok(());
            }
        }
    }

    async fn wait(&mut self) -> Result<(), ReadError> {
        let idle_deadline = match self.inactivity_timeout {
            Some(timeout) if self.link.is_some() && !self.has_live_requests() => {
                Some(self.last_activity + timeout)
            }
            _ => None,
        };
        let ping_deadline = self
            .link
            .as_ref()
            .filter(|link| link.usable)
            .map(|_| self.next_ping);
        let retry_deadline = self.retry_at;

        let wake = {
            let packets = self.link.as_mut().map(|link| &mut link.packets);
            tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                packet = utils::recv_from(packets) => Wake::Packet(packet),
                _ = self.keys_rx.changed() => Wake::KeysChanged,
                _ = utils::sleep_until(ping_deadline) => Wake::Ping,
                _ = utils::sleep_until(idle_deadline) => Wake::Idle,
                _ = utils::sleep_until(retry_deadline) => Wake::Retry,
            }
        };

        match wake {
            Wake::Command(Some(command)) => self.handle_command(command),
            Wake::Command(None) => self.destroyed = true,
            Wake::Packet(Some(packet)) => return self.on_packet(packet?),
            Wake::Packet(None) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Wake::KeysChanged => self.sync_keys(),
            Wake::Ping => {
                let (result, _) = oneshot::channel();
                let body = tl::functions::PingDelayDisconnect {
                    ping_id: utils::random_i64(),
                    disconnect_delay: PING_DISCONNECT_DELAY,
                }
                .to_bytes();
                self.requests.push(Request {
                    body,
                    state: RequestState::NotSerialized,
                    result,
                    ping: true,
                    wrapped: false,
                });
                self.next_ping = Instant::now() + PING_INTERVAL;
            }
            Wake::Idle => {
                debug!("{} inactive for too long, disconnecting", self.tag);
                self.link = None;
                self.keep_connected = false;
                self.requests.retain(|request| !request.result.is_closed());
            }
            Wake::Retry => self.retry_at = None,
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Invoke { body, tx } => {
                self.last_activity = Instant::now();
                self.requests.push(Request {
                    body,
                    state: RequestState::NotSerialized,
                    result: tx,
                    ping: false,
                    wrapped: false,
                });
            }
            Command::ResetSession(session_id) => {
                debug!("{} resetting session", self.tag);
                self.start_new_session(session_id);
            }
            Command::NotifyKeyChange => {
                self.sync_keys();
                self.requeue_sent();
            }
            Command::RequestAuth => {
                if !self.is_main() || self.index != 0 {
                    warn!("{} cannot generate keys, ignoring request", self.tag);
                    return;
                }
                // Under PFS the permanent key stays, only the shared temporary key is lost.
                let use_pfs = self.params.use_pfs;
                self.keys_tx.send_modify(|keys| {
                    if use_pfs && keys.perm.is_some() {
                        info!("{} dropping temporary key on request", self.tag);
                        keys.temp = None;
                    } else {
                        info!("{} dropping keys on request", self.tag);
                        *keys = Keys::default();
                    }
                });
                self.link = None;
                self.keep_connected = true;
                self.retry_at = None;
                self.sync_keys();
                self.requeue_sent();
            }
            Command::SetInactivityTimeout(timeout) => {
                self.inactivity_timeout = timeout;
                self.last_activity = Instant::now();
            }
            Command::ChangeTransport(transport) => {
                self.transport = transport;
                if self.link.take().is_some() {
                    info!("{} transport changed, reconnecting", self.tag);
                    self.requeue_sent();
                }
            }
            Command::EnsureConnected => {
                self.keep_connected = true;
                self.last_activity = Instant::now();
            }
            Command::Destroy => {
                self.destroyed = true;
            }
        }
    }

    fn on_packet(&mut self, packet: Vec<u8>) -> Result<(), ReadError> {
        let Some(key) = self.active_key.clone() else {
            debug!("{} dropping packet received without a key", self.tag);
            return Ok(());
        };
        let plaintext = self.params.crypto.decrypt(&key, &packet)?;
        let items = self.mtp.deserialize(&plaintext)?;
        self.attempts = 0;
        for item in items {
            self.handle_item(item);
        }
        Ok(())
    }

    fn take_sent(&mut self, msg_id: MsgId) -> Option<Request> {
        let index = self.requests.iter().position(|request| {
            matches!(request.state, RequestState::Sent { msg_id: id, .. } if id == msg_id)
        })?;
        Some(self.requests.remove(index))
    }

    fn handle_item(&mut self, item: Deserialization) {
        match item {
            Deserialization::RpcResult { msg_id, body } => match self.take_sent(msg_id) {
                Some(request) => {
                    self.last_activity = Instant::now();
                    let _ = request.result.send(Ok(body));
                }
                None => debug!("{} got result for unknown message {}", self.tag, msg_id.0),
            },
            Deserialization::RpcError { msg_id, error } => match self.take_sent(msg_id) {
                Some(request) => {
                    self.last_activity = Instant::now();
                    let error = match request.body.get(..4) {
                        Some(id) => error.with_caused_by(u32::from_le_bytes([id[0], id[1], id[2], id[3]])),
                        None => error,
                    };
                    let _ = request.result.send(Err(InvocationError::Rpc(error)));
                }
                None => debug!("{} got error for unknown message {}: {error}", self.tag, msg_id.0),
            },
            Deserialization::Failure { msg_id, error } => {
                if let Some(request) = self.take_sent(msg_id) {
                    let _ = request.result.send(Err(InvocationError::Deserialize(error)));
                }
            }
            Deserialization::BadMessage { msg_id, code } => {
                let retryable = mtp::bad_message_retryable(code);
                let mut reinit = false;
                let mut i = 0;
                while i < self.requests.len() {
                    if !self.requests[i].is_sent_as(msg_id) {
                        i += 1;
                        continue;
                    }
                    if retryable {
                        let request = &mut self.requests[i];
                        request.state = RequestState::NotSerialized;
                        reinit |= request.wrapped;
                        request.wrapped = false;
                        i += 1;
                    } else {
                        let request = self.requests.remove(i);
                        warn!(
                            "{} request failed: {}",
                            self.tag,
                            mtp::bad_message_description(code)
                        );
                        let _ = request.result.send(Err(InvocationError::BadMessage { code }));
                    }
                }
                if reinit {
                    if let Some(link) = self.link.as_mut() {
                        link.initialized = false;
                    }
                }
            }
            Deserialization::Pong { msg_id } => {
                self.take_sent(msg_id);
            }
            Deserialization::NewSession { .. } => {}
            Deserialization::Update(body) => {
                if self.is_main() && !self.params.disable_updates {
                    self.emit(SessionEvent::Update(body));
                } else {
                    trace!("{} dropping update", self.tag);
                }
            }
        }
    }

    fn on_link_failure(&mut self, error: ReadError) {
        self.link = None;
        self.requeue_sent();
        self.requests.retain(|request| !request.ping);

        if let ReadError::Transport(net::Error::BadStatus { status: 404 }) = error {
            warn!("{} server does not know our authorization key", self.tag);
            let use_pfs = self.params.use_pfs;
            self.keys_tx.send_modify(|keys| {
                if use_pfs {
                    keys.temp = None;
                } else {
                    keys.perm = None;
                }
            });
            self.sync_keys();
            if !self.can_prepare_keys() {
                self.emit(SessionEvent::RequestAuth);
            }
            return;
        }

        warn!("{} connection failed: {error}", self.tag);
        self.emit(SessionEvent::Error(error.clone()));
        self.attempts += 1;
        match self.params.reconnection_policy.should_retry(self.attempts) {
            ControlFlow::Continue(delay) => {
                debug!("{} reconnecting in {delay:?}", self.tag);
                self.retry_at = Some(Instant::now() + delay);
            }
            ControlFlow::Break(()) => {
                info!("{} giving up on reconnecting", self.tag);
                self.attempts = 0;
                self.keep_connected = false;
                for request in self.requests.drain(..) {
                    let _ = request.result.send(Err(error.clone().into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_prefix_wraps_requests() {
        let prefix = init_connection_prefix(6, &ConnectionParams::default(), tl::LAYER);
        let query = tl::functions::help::GetNearestDc {}.to_bytes();

        let mut wrapped = prefix.to_vec();
        wrapped.extend_from_slice(&query);

        let expected = tl::functions::InvokeWithLayer {
            layer: tl::LAYER,
            query: tl::functions::InitConnection {
                api_id: 6,
                device_model: "Unknown".to_string(),
                system_version: "Unknown".to_string(),
                app_version: env!("CARGO_PKG_VERSION").to_string(),
                system_lang_code: "en".to_string(),
                lang_pack: String::new(),
                lang_code: "en".to_string(),
                proxy: None,
                params: None,
                query: tl::functions::help::GetNearestDc {},
            },
        }
        .to_bytes();
        assert_eq!(wrapped, expected);
    }
}
