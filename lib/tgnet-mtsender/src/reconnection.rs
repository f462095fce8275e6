// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::ops::ControlFlow;
use std::time::Duration;

/// Decides what a session does after its connection fails.
///
/// `attempts` counts the consecutive failures, starting at 1.
/// Returning [`ControlFlow::Break`] gives up and fails every pending request.
pub trait ReconnectionPolicy: Send + Sync {
    fn should_retry(&self, attempts: usize) -> ControlFlow<(), Duration>;
}

/// Never reconnect.
pub struct NoReconnect;

impl ReconnectionPolicy for NoReconnect {
    fn should_retry(&self, _: usize) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Reconnect a fixed amount of times, always waiting the same delay.
pub struct FixedReconnect {
    pub attempts: usize,
    pub delay: Duration,
}

impl ReconnectionPolicy for FixedReconnect {
    fn should_retry(&self, attempts: usize) -> ControlFlow<(), Duration> {
        if attempts <= self.attempts {
            ControlFlow::Continue(self.delay)
        } else {
            ControlFlow::Break(())
        }
    }
}

/// Always reconnect, waiting one more second after every failure, up to five.
pub struct LinearBackoff;

impl ReconnectionPolicy for LinearBackoff {
    fn should_retry(&self, attempts: usize) -> ControlFlow<(), Duration> {
        ControlFlow::Continue(Duration::from_secs(attempts.clamp(1, 5) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_gives_up() {
        let policy = FixedReconnect {
            attempts: 2,
            delay: Duration::from_millis(50),
        };
        assert_eq!(
            policy.should_retry(2),
            ControlFlow::Continue(Duration::from_millis(50))
        );
        assert_eq!(policy.should_retry(3), ControlFlow::Break(()));
        assert_eq!(NoReconnect.should_retry(1), ControlFlow::Break(()));
    }

    #[test]
    fn linear_is_capped() {
        assert_eq!(
            LinearBackoff.should_retry(1),
            ControlFlow::Continue(Duration::from_secs(1))
        );
        assert_eq!(
            LinearBackoff.should_retry(60),
            ControlFlow::Continue(Duration::from_secs(5))
        );
    }
}
