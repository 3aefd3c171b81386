//! Poll and retry primitives. Every wait in the engine goes through these, so
//! timeout and backoff behaviour lives in one place.

use std::fmt::Display;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{AutomationError, Result};
use crate::surface::{ControlHandle, UiSurface};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            backoff_factor,
        }
    }

    /// Sleeps taken between attempts when every attempt fails.
    pub fn schedule(&self) -> Vec<Duration> {
        let attempts = self.max_retries.max(1);
        let mut delay = self.initial_delay;
        let mut out = Vec::with_capacity(attempts as usize - 1);
        for _ in 1..attempts {
            out.push(delay);
            delay = delay.mul_f64(self.backoff_factor.max(0.0));
        }
        out
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), 2.0)
    }
}

/// Runs `check` until it yields a value or `timeout` elapses. The check runs
/// at least once, and once more at the deadline.
pub fn poll_until<T>(
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> Option<T> {
    let start = clock.now();
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if clock.elapsed_since(start) >= timeout {
            return None;
        }
        clock.sleep(interval);
    }
}

fn is_ready(ui: &dyn UiSurface, target: &ControlHandle, need_enabled: bool) -> Result<bool> {
    if !ui.exists(target)? || !ui.is_visible(target)? {
        return Ok(false);
    }
    if need_enabled {
        return ui.is_enabled(target);
    }
    Ok(true)
}

/// Polls until `target` exists and is visible.
pub fn wait_for_element(
    ui: &dyn UiSurface,
    clock: &dyn Clock,
    target: &ControlHandle,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<bool> {
    let found = poll_until(clock, timeout, poll_interval, || {
        match is_ready(ui, target, false) {
            Ok(true) => Some(()),
            Ok(false) => None,
            Err(err) => {
                log::debug!("error checking {target}: {err}");
                None
            }
        }
    });
    match found {
        Some(()) => {
            log::debug!("{target} is ready");
            Ok(true)
        }
        None => {
            log::error!("{target} did not appear within {timeout:?}");
            Err(AutomationError::timeout(target.to_string(), timeout))
        }
    }
}

/// Like [`wait_for_element`] but also requires the control to be enabled, and
/// reports a timeout as `false`.
pub fn verify_element_state(
    ui: &dyn UiSurface,
    clock: &dyn Clock,
    target: &ControlHandle,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    poll_until(clock, timeout, poll_interval, || {
        match is_ready(ui, target, true) {
            Ok(true) => Some(()),
            Ok(false) => None,
            Err(err) => {
                log::debug!("error verifying {target}: {err}");
                None
            }
        }
    })
    .is_some()
}

/// Invokes `action` up to `policy.max_retries` times (at least once), sleeping
/// `d, d*b, d*b^2, ...` between failed attempts. No jitter.
pub fn retry_action<T, E: Display>(
    clock: &dyn Clock,
    policy: RetryPolicy,
    mut action: impl FnMut(u32) -> std::result::Result<T, E>,
) -> Result<T> {
    let attempts = policy.max_retries.max(1);
    let mut delay = policy.initial_delay;
    let mut last = String::from("no attempt made");

    for attempt in 1..=attempts {
        match action(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                last = err.to_string();
                if attempt < attempts {
                    log::warn!(
                        "attempt {attempt}/{attempts} failed: {last}; retrying in {delay:?}"
                    );
                    clock.sleep(delay);
                    delay = delay.mul_f64(policy.backoff_factor.max(0.0));
                } else {
                    log::warn!("attempt {attempt}/{attempts} failed: {last}");
                }
            }
        }
    }

    Err(AutomationError::Exhausted { attempts, last })
}
