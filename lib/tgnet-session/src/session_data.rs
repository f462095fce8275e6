// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;

use crate::defs::{AuthKey, DcOption, SelfUser, TempAuthKey};
use crate::{DEFAULT_DC, Session, known_dc_option};

/// Plain representation of everything a [`Session`] stores.
///
/// Useful to move data between storages.
#[derive(Clone, Debug)]
pub struct SessionData {
    pub default_dc: DcOption,
    pub auth_keys: HashMap<i32, AuthKey>,
    pub temp_auth_keys: HashMap<(i32, usize), TempAuthKey>,
    pub self_user: Option<SelfUser>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            default_dc: known_dc_option(DEFAULT_DC, false)
                .expect("default datacenter to be statically known"),
            auth_keys: HashMap::new(),
            temp_auth_keys: HashMap::new(),
            self_user: None,
        }
    }
}

impl SessionData {
    /// Session data pointing at the test servers instead of production.
    pub fn test_servers() -> Self {
        Self {
            default_dc: known_dc_option(DEFAULT_DC, true)
                .expect("default test datacenter to be statically known"),
            ..Self::default()
        }
    }

    pub fn import_to<S: Session>(&self, session: &S) {
        session.set_default_dc(&self.default_dc);
        self.auth_keys
            .iter()
            .for_each(|(dc_id, key)| session.set_auth_key(*dc_id, Some(key)));
        self.temp_auth_keys
            .iter()
            .for_each(|((dc_id, index), temp)| {
                session.set_temp_auth_key(*dc_id, *index, Some(&temp.key), temp.expires_at)
            });
        session.set_self_user(self.self_user);
    }
}
