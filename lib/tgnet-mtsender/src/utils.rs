// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use getrandom::getrandom;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Secure random identifier, used for sessions, pings and nonces.
pub(crate) fn random_i64() -> i64 {
    let mut buffer = [0; 8];
    getrandom(&mut buffer).expect("failed to generate a secure random identifier");
    i64::from_le_bytes(buffer)
}

/// `tokio::time::sleep_until`, or never if there is no deadline.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Receives from the channel, or waits forever if there is none.
pub(crate) async fn recv_from<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
