use std::{thread, time::Duration};

use crate::{DEFAULT_MAX_CHUNK_POLLS, DEFAULT_POLL_INTERVAL, DfuError};

/// How long to keep asking the device for its status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Fixed delay between two polls
    pub interval: Duration,
    /// Give up with [DfuError::Timeout] after this many polls; `None` polls
    /// until the device settles.
    pub max_polls: Option<u32>,
}

impl PollPolicy {
    pub const fn bounded(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls: Some(max_polls),
        }
    }

    pub const fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_polls: None,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::bounded(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_CHUNK_POLLS)
    }
}

/// Calls `fetch` until `done` accepts its result.
///
/// Errors returned by `fetch` end the loop immediately.
pub(crate) fn poll_until<T, F, P>(
    policy: &PollPolicy,
    mut fetch: F,
    done: P,
) -> Result<T, DfuError>
where
    F: FnMut() -> Result<T, DfuError>,
    P: Fn(&T) -> bool,
{
    let mut polls: u32 = 0;
    loop {
        let value = fetch()?;
        if done(&value) {
            return Ok(value);
        }
        polls += 1;
        if policy.max_polls.is_some_and(|max| polls >= max) {
            return Err(DfuError::Timeout);
        }
        if !policy.interval.is_zero() {
            thread::sleep(policy.interval);
        }
    }
}
