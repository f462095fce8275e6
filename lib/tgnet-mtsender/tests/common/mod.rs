// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-process datacenters for the integration tests.
//!
//! Encryption is replaced by prefixing the plaintext with the key identifier,
//! and key exchanges by a single round trip in which the server picks the key.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::{Buf, BufMut};
use futures_util::future::{BoxFuture, FutureExt};
use grammers_tl_types::{self as tl, Identifiable, Serializable};
use simple_logger::SimpleLogger;
use tgnet_mtsender::crypto::{self, GeneratedKey, KeyExchangeStep};
use tgnet_mtsender::net::{self, Connection, PacketReader, PacketWriter};
use tgnet_mtsender::{
    ConfigSource, ConnectionKind, CryptoProvider, InvocationError, KeyExchange, NetworkEvent,
    NetworkManager, NetworkParams, ReadError, ServerAddr, ServerConfig, SessionEvent,
    TransportFactory,
};
use tgnet_session::storages::MemorySession;
use tgnet_session::{AuthKey, KNOWN_DC_OPTIONS, Session, known_dc_option};
use tokio::sync::mpsc;

const KEY_REQUEST: &[u8] = b"key?";
const MSG_CONTAINER: u32 = 0x73f1f8dc;
const RPC_RESULT: u32 = 0xf35c6d01;
/// `-404` as sent by the intermediate transport.
const STATUS_404: [u8; 4] = (-404i32).to_le_bytes();

pub fn init_logging() {
    let _ = SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

/// A request as seen by a mock datacenter.
#[derive(Clone, Debug)]
pub struct Received {
    pub dc_id: i32,
    pub session_id: i64,
    pub key_id: i64,
    /// Body without the `invokeWithLayer(initConnection(...))` wrapper.
    pub body: Vec<u8>,
    pub wrapped: bool,
}

impl Received {
    pub fn constructor_id(&self) -> u32 {
        u32::from_le_bytes([self.body[0], self.body[1], self.body[2], self.body[3]])
    }

    pub fn is<R: Identifiable>(&self) -> bool {
        self.constructor_id() == R::CONSTRUCTOR_ID
    }
}

pub enum Reply {
    Result(Vec<u8>),
    Error(i32, &'static str),
    /// Never answer.
    Ignore,
}

impl Reply {
    pub fn ok<S: Serializable>(value: &S) -> Self {
        Self::Result(value.to_bytes())
    }
}

type Responder = Arc<dyn Fn(&Received) -> Reply + Send + Sync>;

pub fn nearest_dc(dc_id: i32) -> tl::enums::NearestDc {
    tl::enums::NearestDc::Dc(tl::types::NearestDc {
        country: "ES".to_string(),
        this_dc: dc_id,
        nearest_dc: dc_id,
    })
}

pub fn exported_authorization(dc_id: i32) -> tl::enums::auth::ExportedAuthorization {
    tl::enums::auth::ExportedAuthorization::Authorization(tl::types::auth::ExportedAuthorization {
        id: i64::from(dc_id),
        bytes: vec![dc_id as u8; 8],
    })
}

/// `auth.authorizationSignUpRequired` with no terms of service.
pub fn sign_up_required() -> Vec<u8> {
    let mut body = Vec::new();
    body.put_u32_le(0x44747e9a);
    body.put_u32_le(0);
    body
}

pub fn default_reply(request: &Received) -> Reply {
    if request.is::<tl::functions::help::GetNearestDc>() {
        Reply::ok(&nearest_dc(request.dc_id))
    } else if request.is::<tl::functions::auth::ExportAuthorization>() {
        let mut buf = &request.body[4..];
        Reply::ok(&exported_authorization(buf.get_i32_le()))
    } else if request.is::<tl::functions::auth::ImportAuthorization>() {
        Reply::Result(sign_up_required())
    } else {
        Reply::ok(&true)
    }
}

#[derive(Default)]
pub struct MockServer {
    responders: Mutex<HashMap<i32, Responder>>,
    received: Mutex<Vec<Received>>,
    key_exchanges: Mutex<HashMap<i32, usize>>,
    forgotten_keys: Mutex<HashSet<i64>>,
    connections: AtomicUsize,
    open: Mutex<HashMap<i32, usize>>,
    next_key: AtomicU8,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_key: AtomicU8::new(1),
            ..Default::default()
        })
    }

    /// Replaces how the given datacenter answers requests.
    pub fn respond(&self, dc_id: i32, responder: impl Fn(&Received) -> Reply + Send + Sync + 'static) {
        self.responders
            .lock()
            .unwrap()
            .insert(dc_id, Arc::new(responder));
    }

    /// Every request received so far, in order.
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Requests of the given type received by the given datacenter.
    pub fn received_by<R: Identifiable>(&self, dc_id: i32) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|request| request.dc_id == dc_id && request.is::<R>())
            .collect()
    }

    pub fn key_exchanges(&self, dc_id: i32) -> usize {
        self.key_exchanges
            .lock()
            .unwrap()
            .get(&dc_id)
            .copied()
            .unwrap_or(0)
    }

    /// Connections ever made, to any datacenter.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Connections to the datacenter that are still open.
    pub fn open_connections(&self, dc_id: i32) -> usize {
        self.open.lock().unwrap().get(&dc_id).copied().unwrap_or(0)
    }

    /// Makes every datacenter answer `-404` to packets encrypted with the key.
    pub fn forget_key(&self, key: &AuthKey) {
        self.forgotten_keys.lock().unwrap().insert(key_id(key));
    }

    fn reply_for(&self, request: &Received) -> Reply {
        let responder = self.responders.lock().unwrap().get(&request.dc_id).cloned();
        match responder {
            Some(responder) => responder(request),
            None => default_reply(request),
        }
    }

    async fn serve(
        self: Arc<Self>,
        dc_id: i32,
        mut packets: mpsc::UnboundedReceiver<Vec<u8>>,
        out: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let mut next_msg_id = 1i64;
        let mut msg_id = move || {
            next_msg_id += 4;
            next_msg_id
        };

        while let Some(packet) = packets.recv().await {
            let mut buf = &packet[..];
            let key_id = buf.get_i64_le();

            if key_id == 0 {
                let _msg_id = buf.get_i64_le();
                let len = buf.get_i32_le() as usize;
                assert!(buf[..len].starts_with(KEY_REQUEST));
                *self.key_exchanges.lock().unwrap().entry(dc_id).or_default() += 1;

                let key = [self.next_key.fetch_add(1, Ordering::SeqCst); 256];
                let mut reply = Vec::new();
                reply.put_i64_le(0);
                reply.put_i64_le(msg_id());
                reply.put_i32_le(key.len() as i32);
                reply.put_slice(&key);
                let _ = out.send(reply);
                continue;
            }

            if self.forgotten_keys.lock().unwrap().contains(&key_id) {
                let _ = out.send(STATUS_404.to_vec());
                continue;
            }

            let salt = buf.get_i64_le();
            let session_id = buf.get_i64_le();
            let mut messages = Vec::new();
            read_messages(&mut buf, &mut messages);

            for (req_msg_id, body) in messages {
                let constructor = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let reply_body = if constructor == tl::types::MsgsAck::CONSTRUCTOR_ID {
                    continue;
                } else if constructor == tl::functions::PingDelayDisconnect::CONSTRUCTOR_ID {
                    let mut pong = Vec::new();
                    pong.put_u32_le(tl::types::Pong::CONSTRUCTOR_ID);
                    pong.put_i64_le(req_msg_id);
                    pong.put_slice(&body[4..12]);
                    pong
                } else if constructor == tl::functions::auth::BindTempAuthKey::CONSTRUCTOR_ID {
                    rpc_result(req_msg_id, &true.to_bytes())
                } else {
                    let (body, wrapped) = unwrap_init_connection(body);
                    let request = Received {
                        dc_id,
                        session_id,
                        key_id,
                        body,
                        wrapped,
                    };
                    self.received.lock().unwrap().push(request.clone());
                    match self.reply_for(&request) {
                        Reply::Result(result) => rpc_result(req_msg_id, &result),
                        Reply::Error(code, message) => rpc_result(
                            req_msg_id,
                            &tl::enums::RpcError::Error(tl::types::RpcError {
                                error_code: code,
                                error_message: message.to_string(),
                            })
                            .to_bytes(),
                        ),
                        Reply::Ignore => continue,
                    }
                };

                let mut reply = Vec::new();
                reply.put_i64_le(key_id);
                reply.put_i64_le(salt);
                reply.put_i64_le(session_id);
                reply.put_i64_le(msg_id());
                reply.put_i32_le(1);
                reply.put_i32_le(reply_body.len() as i32);
                reply.put_slice(&reply_body);
                let _ = out.send(reply);
            }
        }
        *self.open.lock().unwrap().entry(dc_id).or_default() -= 1;
    }
}

fn rpc_result(req_msg_id: i64, result: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_u32_le(RPC_RESULT);
    body.put_i64_le(req_msg_id);
    body.put_slice(result);
    body
}

fn read_messages(buf: &mut &[u8], messages: &mut Vec<(i64, Vec<u8>)>) {
    let msg_id = buf.get_i64_le();
    let _seq_no = buf.get_i32_le();
    let len = buf.get_i32_le() as usize;
    let body = buf[..len].to_vec();
    buf.advance(len);

    let mut inner = &body[..];
    if inner.get_u32_le() == MSG_CONTAINER {
        let count = inner.get_i32_le();
        for _ in 0..count {
            read_messages(&mut inner, messages);
        }
    } else {
        messages.push((msg_id, body));
    }
}

fn skip_tl_string(buf: &mut &[u8]) {
    let (len, header) = match buf.get_u8() {
        254 => {
            let len = buf.get_u8() as usize | (buf.get_u8() as usize) << 8 | (buf.get_u8() as usize) << 16;
            (len, 4)
        }
        len => (len as usize, 1),
    };
    let padding = (4 - (header + len) % 4) % 4;
    buf.advance(len + padding);
}

/// Strips `invokeWithLayer(initConnection(...))`, assuming no proxy nor params were given.
fn unwrap_init_connection(body: Vec<u8>) -> (Vec<u8>, bool) {
    type Query = tl::functions::help::GetConfig;
    let mut buf = &body[..];
    if buf.get_u32_le() != tl::functions::InvokeWithLayer::<Query>::CONSTRUCTOR_ID {
        return (body, false);
    }
    let _layer = buf.get_i32_le();
    assert_eq!(buf.get_u32_le(), tl::functions::InitConnection::<Query>::CONSTRUCTOR_ID);
    assert_eq!(buf.get_u32_le(), 0, "unexpected initConnection flags");
    let _api_id = buf.get_i32_le();
    for _ in 0..6 {
        skip_tl_string(&mut buf);
    }
    (buf.to_vec(), true)
}

struct ChannelReader(mpsc::UnboundedReceiver<Vec<u8>>);

impl PacketReader for ChannelReader {
    fn read_packet(&mut self) -> BoxFuture<'_, Result<Vec<u8>, ReadError>> {
        async move {
            let packet = self
                .0
                .recv()
                .await
                .ok_or_else(|| ReadError::from(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
            if packet.len() == 4 {
                let status = i32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
                return Err(net::Error::BadStatus {
                    status: status.unsigned_abs(),
                }
                .into());
            }
            Ok(packet)
        }
        .boxed()
    }
}

struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

impl PacketWriter for ChannelWriter {
    fn write_packet(&mut self, packet: Vec<u8>) -> BoxFuture<'_, io::Result<()>> {
        let result = self
            .0
            .send(packet)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe));
        async move { result }.boxed()
    }
}

/// Connects to the [`MockServer`] through in-memory channels.
pub struct MockTransport(pub Arc<MockServer>);

impl TransportFactory for MockTransport {
    fn connect(&self, addr: &ServerAddr) -> BoxFuture<'static, io::Result<Connection>> {
        let server = Arc::clone(&self.0);
        let dc_id = addr.dc_id;
        async move {
            let (client_tx, server_rx) = mpsc::unbounded_channel();
            let (server_tx, client_rx) = mpsc::unbounded_channel();
            server.connections.fetch_add(1, Ordering::SeqCst);
            *server.open.lock().unwrap().entry(dc_id).or_default() += 1;
            tokio::spawn(server.serve(dc_id, server_rx, server_tx));
            Ok(Connection {
                reader: Box::new(ChannelReader(client_rx)),
                writer: Box::new(ChannelWriter(client_tx)),
            })
        }
        .boxed()
    }
}

pub fn key_id(key: &AuthKey) -> i64 {
    let bytes = key.as_bytes();
    i64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

struct MockExchange;

impl KeyExchange for MockExchange {
    fn step(&mut self, response: Option<&[u8]>) -> Result<KeyExchangeStep, crypto::Error> {
        let Some(response) = response else {
            return Ok(KeyExchangeStep::Send(KEY_REQUEST.to_vec()));
        };
        let key: [u8; 256] = response
            .try_into()
            .map_err(|_| crypto::Error::InvalidResponse {
                reason: "bad key length".to_string(),
            })?;
        Ok(KeyExchangeStep::Done(GeneratedKey {
            auth_key: AuthKey::from_bytes(key),
            time_offset: 0,
            first_salt: 0,
        }))
    }
}

/// "Encrypts" by prefixing the key identifier.
pub struct MockCrypto;

impl CryptoProvider for MockCrypto {
    fn key_exchange(&self, _expires_in: Option<Duration>) -> Box<dyn KeyExchange> {
        Box::new(MockExchange)
    }

    fn auth_key_id(&self, key: &AuthKey) -> i64 {
        key_id(key)
    }

    fn encrypt(&self, key: &AuthKey, plaintext: &[u8]) -> Vec<u8> {
        let mut packet = key_id(key).to_le_bytes().to_vec();
        packet.extend_from_slice(plaintext);
        packet
    }

    fn decrypt(&self, key: &AuthKey, packet: &[u8]) -> Result<Vec<u8>, crypto::Error> {
        match packet.split_at_checked(8) {
            Some((id, plaintext)) if id == key_id(key).to_le_bytes() => Ok(plaintext.to_vec()),
            _ => Err(crypto::Error::DecryptionFailed {
                reason: "packet was not encrypted with our key".to_string(),
            }),
        }
    }

    fn encrypt_binding(&self, _perm_key: &AuthKey, _msg_id: i64, inner: &[u8]) -> Vec<u8> {
        inner.to_vec()
    }
}

/// Serves the statically known options.
#[derive(Default)]
pub struct StaticConfig {
    pub tmp_sessions: Option<i32>,
    /// Amount of times the configuration was requested.
    pub fetches: Arc<AtomicUsize>,
}

impl ConfigSource for StaticConfig {
    fn fetch(&self) -> BoxFuture<'_, Result<ServerConfig, InvocationError>> {
        async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(ServerConfig {
                this_dc: 2,
                dc_options: KNOWN_DC_OPTIONS.to_vec(),
                tmp_sessions: self.tmp_sessions,
                expires_at: SystemTime::now() + Duration::from_secs(3600),
            })
        }
        .boxed()
    }
}

pub struct Harness {
    pub server: Arc<MockServer>,
    pub session: Arc<MemorySession>,
    pub network: NetworkManager,
    pub events: mpsc::UnboundedReceiver<NetworkEvent>,
}

pub fn params(server: &Arc<MockServer>) -> NetworkParams {
    NetworkParams {
        api_id: 1,
        transport: Arc::new(MockTransport(Arc::clone(server))),
        ..Default::default()
    }
}

/// Network connected to dc 2 of the mock server.
pub async fn connect_with(params: NetworkParams, server: Arc<MockServer>, config: StaticConfig) -> Harness {
    connect_session(Arc::new(MemorySession::default()), params, server, config).await
}

/// Like [`connect_with`], but starting from an existing session.
pub async fn connect_session(
    session: Arc<MemorySession>,
    params: NetworkParams,
    server: Arc<MockServer>,
    config: StaticConfig,
) -> Harness {
    init_logging();
    let (network, events) = NetworkManager::with_config_source(
        Arc::clone(&session) as Arc<dyn Session>,
        Arc::new(MockCrypto),
        params,
        Box::new(config),
    );
    let option = known_dc_option(2, false).expect("dc 2 is known");
    network.connect(option).await.expect("connecting never fails");
    Harness {
        server,
        session,
        network,
        events,
    }
}

pub async fn connect() -> Harness {
    let server = MockServer::new();
    connect_with(params(&server), server, StaticConfig::default()).await
}

impl Harness {
    /// Waits until the given session of the datacenter is ready for requests.
    pub async fn usable(&mut self, dc_id: i32, kind: ConnectionKind, index: usize) {
        loop {
            let event = self.events.recv().await.expect("network is alive");
            if matches!(event.event, SessionEvent::Usable)
                && event.dc_id == dc_id
                && event.kind == kind
                && event.index == index
            {
                break;
            }
        }
    }
}
