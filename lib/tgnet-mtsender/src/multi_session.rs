// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::debug;
use tgnet_session::{AuthKey, TempAuthKey};

use crate::configuration::ConnectionKind;
use crate::errors::InvocationError;
use crate::net::TransportFactory;
use crate::session_connection::{Keys, SessionConnection, SessionEvent, SessionObserver, SessionParams};

/// A pool of sessions of the same kind to the same datacenter.
///
/// Requests are spread over the members in turns. Members are created and
/// destroyed as the pool is resized, and always start from the keys the pool
/// currently holds.
pub struct MultiSessionConnection(Arc<PoolInner>);

struct PoolInner {
    params: Arc<SessionParams>,
    members: Mutex<Vec<SessionConnection>>,
    next: AtomicUsize,
    transport: Mutex<Arc<dyn TransportFactory>>,
    inactivity_timeout: Mutex<Option<Duration>>,
    keep_connected: AtomicBool,
    destroyed: AtomicBool,
    observer: Arc<dyn SessionObserver>,
    relay: Arc<dyn SessionObserver>,
}

/// Sits between the members and the outer observer.
struct PoolRelay(Weak<PoolInner>);

impl SessionObserver for PoolRelay {
    fn on_session_event(&self, kind: ConnectionKind, index: usize, event: SessionEvent) {
        let Some(pool) = self.0.upgrade() else {
            return;
        };

        // Only the first main member negotiates permanent keys; everyone else reuses them.
        if let SessionEvent::KeyChange(key) = &event {
            if kind == ConnectionKind::Main {
                for (i, member) in pool.members.lock().unwrap().iter().enumerate() {
                    if i != index {
                        member.set_auth_key(key.clone());
                    }
                }
            }
        }
        pool.observer.on_session_event(kind, index, event);
    }
}

impl MultiSessionConnection {
    pub(crate) fn new(
        params: Arc<SessionParams>,
        count: usize,
        transport: Arc<dyn TransportFactory>,
        inactivity_timeout: Option<Duration>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| PoolInner {
            params,
            members: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            transport: Mutex::new(transport),
            inactivity_timeout: Mutex::new(inactivity_timeout),
            keep_connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            observer,
            relay: Arc::new(PoolRelay(weak.clone())),
        });
        let pool = Self(inner);
        pool.set_count(count);
        pool
    }

    pub fn kind(&self) -> ConnectionKind {
        self.0.params.kind
    }

    pub fn pool_size(&self) -> usize {
        self.0.members.lock().unwrap().len()
    }

    /// Grows or shrinks the pool. There is always at least one member.
    pub fn set_count(&self, count: usize) {
        if self.0.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let count = count.max(1);
        let mut members = self.0.members.lock().unwrap();
        if count == members.len() {
            return;
        }
        debug!(
            "resizing {} pool of dc {} from {} to {count}",
            self.0.params.kind,
            self.0.params.addr.dc_id,
            members.len()
        );

        if count < members.len() {
            for member in members.drain(count..) {
                member.destroy();
            }
            return;
        }

        let keys = match members.first() {
            Some(first) => {
                let mut keys = first.keys();
                // Main members under forward secrecy bind keys of their own.
                if self.0.params.kind == ConnectionKind::Main {
                    keys.temp = None;
                }
                keys
            }
            None => Keys::default(),
        };
        let transport = Arc::clone(&self.0.transport.lock().unwrap());
        let inactivity_timeout = *self.0.inactivity_timeout.lock().unwrap();
        let keep_connected = self.0.keep_connected.load(Ordering::SeqCst);
        for index in members.len()..count {
            let member = SessionConnection::spawn(
                Arc::clone(&self.0.params),
                index,
                keys.clone(),
                Arc::clone(&transport),
                inactivity_timeout,
                Arc::clone(&self.0.relay),
            );
            if keep_connected {
                member.ensure_connected();
            }
            members.push(member);
        }
    }

    fn for_each(&self, index: Option<usize>, f: impl Fn(&SessionConnection)) {
        let members = self.0.members.lock().unwrap();
        match index {
            Some(index) => members.get(index).into_iter().for_each(f),
            None => members.iter().for_each(f),
        }
    }

    /// Sets the permanent key of one member, or of all of them with a `None` index.
    pub fn set_auth_key(&self, key: Option<AuthKey>, index: Option<usize>) {
        self.for_each(index, |member| member.set_auth_key(key.clone()));
    }

    pub fn set_temp_auth_key(&self, key: Option<TempAuthKey>, index: Option<usize>) {
        self.for_each(index, |member| member.set_temp_auth_key(key.clone()));
    }

    pub fn auth_key(&self, index: usize) -> Option<AuthKey> {
        self.0.members.lock().unwrap().get(index)?.auth_key()
    }

    pub fn temp_auth_key(&self, index: usize) -> Option<TempAuthKey> {
        self.0.members.lock().unwrap().get(index)?.temp_auth_key()
    }

    pub fn reset_auth_keys(&self) {
        self.for_each(None, SessionConnection::reset_auth_keys);
    }

    pub fn reset_sessions(&self) {
        self.for_each(None, SessionConnection::reset_session);
    }

    pub fn notify_key_change(&self) {
        self.for_each(None, SessionConnection::notify_key_change);
    }

    /// Asks the first member to generate new keys.
    pub fn request_auth(&self) {
        self.for_each(Some(0), SessionConnection::request_auth);
    }

    pub fn set_inactivity_timeout(&self, timeout: Option<Duration>) {
        *self.0.inactivity_timeout.lock().unwrap() = timeout;
        self.for_each(None, |member| member.set_inactivity_timeout(timeout));
    }

    pub fn change_transport(&self, transport: Arc<dyn TransportFactory>) {
        *self.0.transport.lock().unwrap() = Arc::clone(&transport);
        self.for_each(None, |member| member.change_transport(Arc::clone(&transport)));
    }

    /// Keeps every member connected, including those created later.
    pub fn ensure_connected(&self) {
        self.0.keep_connected.store(true, Ordering::SeqCst);
        self.for_each(None, SessionConnection::ensure_connected);
    }

    pub fn destroy(&self) {
        self.0.destroyed.store(true, Ordering::SeqCst);
        for member in self.0.members.lock().unwrap().drain(..) {
            member.destroy();
        }
    }

    /// Identifiers of the current sessions of every member.
    pub fn session_ids(&self) -> Vec<i64> {
        self.0
            .members
            .lock()
            .unwrap()
            .iter()
            .map(SessionConnection::session_id)
            .collect()
    }

    /// Sends a serialized request through the next member in turn.
    pub async fn send_rpc(&self, body: Vec<u8>, timeout: Option<Duration>) -> Result<Vec<u8>, InvocationError> {
        let member = {
            let members = self.0.members.lock().unwrap();
            if members.is_empty() {
                return Err(InvocationError::Dropped);
            }
            let index = self.0.next.fetch_add(1, Ordering::Relaxed) % members.len();
            members[index].clone()
        };
        member.invoke(body, timeout).await
    }
}
