// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library serves as the session interface for the data that the
//! network core needs to survive process restarts:
//! - The datacenter to connect to first.
//! - Permanent Authorization Keys bound to each datacenter.
//! - Temporary Authorization Keys, when Perfect Forward Secrecy is used.
//! - Basic information about the logged-in account.
//!
//! To use with other libraries, you will want to instantiate one of the
//! [`storages`], which are what implement the [`Session`] trait.
//!
//! To convert between storages, you can use the [`SessionData`] as an
//! intermediate step, together with [`SessionData::import_to`].

#![deny(unsafe_code)]

mod dc_options;
pub mod defs;
mod session;
mod session_data;
pub mod storages;

pub use dc_options::{DEFAULT_DC, KNOWN_DC_OPTIONS, KNOWN_TEST_DC_OPTIONS, known_dc_option};
pub use defs::{AuthKey, DcFlags, DcOption, SelfUser, TempAuthKey};
pub use session::Session;
pub use session_data::SessionData;
