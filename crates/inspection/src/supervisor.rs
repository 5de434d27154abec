//! Keeps the orchestrator running across trigger channel failures.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use tracing::{error, info, warn};
use trigger_link::{ChannelError, TriggerChannel};

use crate::orchestrator::Orchestrator;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Bounded exponential backoff for reopening the trigger channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reopen attempts after a failure; 0 gives up immediately.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500))
    }
}

impl ReconnectPolicy {
    pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

    pub fn new(attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            attempts,
            initial_backoff,
            max_backoff: Self::MAX_BACKOFF,
        }
    }

    /// Wait before attempt `attempt` (zero-based): doubles each time, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Open a channel, retrying per `policy`. `Ok(None)` means shutdown was
/// requested while waiting.
pub fn connect<C, F>(
    mut open: F,
    policy: &ReconnectPolicy,
    shutdown: &AtomicBool,
) -> Result<Option<C>, ChannelError>
where
    F: FnMut() -> Result<C, ChannelError>,
{
    let mut attempt = 0;
    loop {
        match open() {
            Ok(channel) => return Ok(Some(channel)),
            Err(err) if attempt < policy.attempts => {
                let delay = policy.delay(attempt);
                attempt += 1;
                warn!(
                    "trigger channel unavailable ({err}); retry {attempt}/{} in {delay:?}",
                    policy.attempts
                );
                if !sleep_unless_shutdown(delay, shutdown) {
                    return Ok(None);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run `orchestrator` until `shutdown` is raised. A failed channel is reopened
/// per `policy`; the error is returned once the attempts are used up.
pub fn supervise<C: TriggerChannel>(
    orchestrator: &mut Orchestrator<C>,
    policy: &ReconnectPolicy,
    shutdown: &AtomicBool,
) -> Result<(), ChannelError> {
    loop {
        let err = match orchestrator.run_until(shutdown) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        error!("trigger channel failed: {err}");
        if policy.attempts == 0 {
            return Err(err);
        }

        let channel = orchestrator.channel_mut();
        let reopened = connect(|| channel.reopen(), policy, shutdown)?;
        if reopened.is_none() {
            return Ok(());
        }
        metrics::counter!("inspection_channel_reconnects_total").increment(1);
        info!("trigger channel reopened");
    }
}

/// Sleep for `delay`, waking early on shutdown. Returns `false` on shutdown.
fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SHUTDOWN_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = ReconnectPolicy::new(10, Duration::from_millis(500));
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn connect_retries_then_succeeds() {
        let policy = ReconnectPolicy::new(3, Duration::from_millis(1));
        let mut calls = 0;
        let opened = connect(
            || {
                calls += 1;
                if calls < 3 {
                    Err(ChannelError::Disconnected { port: "mock".into() })
                } else {
                    Ok(calls)
                }
            },
            &policy,
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(opened, Some(3));
    }

    #[test]
    fn connect_gives_up_after_attempts() {
        let policy = ReconnectPolicy::new(2, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<Option<()>, _> = connect(
            || {
                calls += 1;
                Err(ChannelError::Disconnected { port: "mock".into() })
            },
            &policy,
            &AtomicBool::new(false),
        );
        assert!(matches!(result, Err(ChannelError::Disconnected { .. })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn connect_stops_on_shutdown() {
        let policy = ReconnectPolicy::new(5, Duration::from_secs(10));
        let result: Result<Option<()>, _> = connect(
            || Err(ChannelError::Disconnected { port: "mock".into() }),
            &policy,
            &AtomicBool::new(true),
        );
        assert!(matches!(result, Ok(None)));
    }
}
