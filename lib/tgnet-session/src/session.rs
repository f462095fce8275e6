// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::time::SystemTime;

use crate::defs::{AuthKey, DcOption, SelfUser, TempAuthKey};

/// The main interface to interact with the different [`crate::storages`].
///
/// All methods are synchronous and infallible because the network core is
/// not equipped to deal with the arbitrary errors that a dynamic `Session`
/// could produce. Storages that can fail should log and carry on.
///
/// Authorization keys and the default datacenter stored here must survive
/// process restarts for the connections to be resumed without re-authorizing.
pub trait Session: Send + Sync {
    /// Permanent authorization key for the given datacenter, if any.
    fn auth_key(&self, dc_id: i32) -> Option<AuthKey>;

    /// Replaces (or removes, with `None`) the permanent authorization key of a datacenter.
    fn set_auth_key(&self, dc_id: i32, key: Option<&AuthKey>);

    /// Temporary authorization key for the given datacenter and main session index.
    ///
    /// Keys past their expiration date must not be returned.
    fn temp_auth_key(&self, dc_id: i32, index: usize) -> Option<TempAuthKey>;

    /// Replaces (or removes, with `None`) a temporary authorization key.
    fn set_temp_auth_key(&self, dc_id: i32, index: usize, key: Option<&AuthKey>, expires_at: SystemTime);

    /// Information about the logged-in account, if known.
    fn self_user(&self) -> Option<SelfUser>;

    /// Remembers the logged-in account.
    fn set_self_user(&self, user: Option<SelfUser>);

    /// Datacenter that should be connected to first on startup.
    ///
    /// If no datacenter was saved yet, a statically-known option should be returned.
    fn default_dc(&self) -> DcOption;

    /// Changes the [`Session::default_dc`] after finding out the actual datacenter
    /// to which main queries should be executed against.
    fn set_default_dc(&self, option: &DcOption);
}
