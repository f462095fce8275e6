// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::Mutex;
use std::time::SystemTime;

use log::debug;

use crate::defs::{AuthKey, DcOption, SelfUser, TempAuthKey};
use crate::{Session, SessionData};

/// In-memory session interface.
///
/// Does not actually offer direct ways to persist the state anywhere,
/// so it should only be used in very few select cases.
///
/// Generating authorization keys has a high cost in terms of flood wait errors,
/// so the state really should be persisted by other means.
#[derive(Default)]
pub struct MemorySession(Mutex<SessionData>);

impl From<SessionData> for MemorySession {
    fn from(session_data: SessionData) -> Self {
        Self(Mutex::new(session_data))
    }
}

impl MemorySession {
    /// Snapshot of the current contents.
    pub fn data(&self) -> SessionData {
        self.0.lock().unwrap().clone()
    }
}

impl Session for MemorySession {
    fn auth_key(&self, dc_id: i32) -> Option<AuthKey> {
        self.0.lock().unwrap().auth_keys.get(&dc_id).cloned()
    }

    fn set_auth_key(&self, dc_id: i32, key: Option<&AuthKey>) {
        debug!("storing permanent key for dc {dc_id} (present: {})", key.is_some());
        let mut data = self.0.lock().unwrap();
        match key {
            Some(key) => {
                data.auth_keys.insert(dc_id, key.clone());
            }
            None => {
                data.auth_keys.remove(&dc_id);
            }
        }
    }

    fn temp_auth_key(&self, dc_id: i32, index: usize) -> Option<TempAuthKey> {
        self.0
            .lock()
            .unwrap()
            .temp_auth_keys
            .get(&(dc_id, index))
            .filter(|temp| temp.is_valid_at(SystemTime::now()))
            .cloned()
    }

    fn set_temp_auth_key(
        &self,
        dc_id: i32,
        index: usize,
        key: Option<&AuthKey>,
        expires_at: SystemTime,
    ) {
        debug!("storing temporary key for dc {dc_id} index {index} (present: {})", key.is_some());
        let mut data = self.0.lock().unwrap();
        match key {
            Some(key) => {
                data.temp_auth_keys.insert(
                    (dc_id, index),
                    TempAuthKey {
                        key: key.clone(),
                        expires_at,
                    },
                );
            }
            None => {
                data.temp_auth_keys.remove(&(dc_id, index));
            }
        }
    }

    fn self_user(&self) -> Option<SelfUser> {
        self.0.lock().unwrap().self_user
    }

    fn set_self_user(&self, user: Option<SelfUser>) {
        self.0.lock().unwrap().self_user = user;
    }

    fn default_dc(&self) -> DcOption {
        self.0.lock().unwrap().default_dc.clone()
    }

    fn set_default_dc(&self, option: &DcOption) {
        self.0.lock().unwrap().default_dc = option.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expired_temp_keys_are_hidden() {
        let session = MemorySession::default();
        let key = AuthKey::from_bytes([7; 256]);
        let past = SystemTime::now() - Duration::from_secs(1);
        let future = SystemTime::now() + Duration::from_secs(3600);

        session.set_temp_auth_key(2, 0, Some(&key), past);
        assert_eq!(session.temp_auth_key(2, 0), None);

        session.set_temp_auth_key(2, 1, Some(&key), future);
        assert_eq!(session.temp_auth_key(2, 1).map(|t| t.key), Some(key));
        assert_eq!(session.temp_auth_key(2, 0), None);
    }

    #[test]
    fn import_copies_keys_and_default_dc() {
        let mut data = SessionData::test_servers();
        data.auth_keys.insert(4, AuthKey::from_bytes([4; 256]));
        data.self_user = Some(SelfUser {
            id: 123,
            is_bot: true,
        });

        let session = MemorySession::default();
        data.import_to(&session);

        assert_eq!(session.default_dc(), data.default_dc);
        assert_eq!(session.auth_key(4), Some(AuthKey::from_bytes([4; 256])));
        assert_eq!(session.auth_key(2), None);
        assert!(session.self_user().unwrap().is_bot);

        session.set_auth_key(4, None);
        assert_eq!(session.auth_key(4), None);
    }
}
