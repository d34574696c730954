//! Breaker state machine shared by the local and distributed breakers.
//!
//! # State Transitions
//! ```text
//! Closed → Open:     failure_count >= failure_threshold, failures within monitoring_window
//! Open → HalfOpen:   first allowance check after open_timeout (lazy, no timer)
//! HalfOpen → Closed: success_threshold consecutive successes
//! HalfOpen → Open:   any failure
//! Closed → Closed:   a success clears failure_count
//! ```
//!
//! The failure counter is anchored on the most recent failure: a failure that
//! arrives more than `monitoring_window` after the previous one starts a new
//! count instead of adding to a stale one.
//!
//! Timestamps are epoch milliseconds so a record can be shared between
//! processes through a store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::store::StoreError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// A limited number of probes are let through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "halfOpen",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "halfOpen" => Ok(CircuitState::HalfOpen),
            other => Err(format!("unknown circuit state '{}'", other)),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures inside the monitoring window before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// Time spent Open before a probe is admitted.
    pub open_timeout: Duration,
    /// Maximum gap between failures that still counts toward the threshold.
    pub monitoring_window: Duration,
    /// Probes allowed in flight while HalfOpen.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(60),
            half_open_max_probes: 1,
        }
    }
}

impl BreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window = window;
        self
    }

    pub fn with_half_open_max_probes(mut self, probes: u32) -> Self {
        self.half_open_max_probes = probes.max(1);
        self
    }
}

/// A state change produced by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Persistent state of one named breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRecord {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<u64>,
    pub last_state_change_at: u64,
    pub half_open_in_flight: u32,
}

const FIELD_STATE: &str = "state";
const FIELD_FAILURES: &str = "failureCount";
const FIELD_SUCCESSES: &str = "successCount";
const FIELD_LAST_FAILURE: &str = "lastFailureAt";
const FIELD_LAST_CHANGE: &str = "lastStateChangeAt";
const FIELD_IN_FLIGHT: &str = "halfOpenInFlight";

impl CircuitRecord {
    /// A fresh Closed record.
    pub fn new(name: impl Into<String>, now_ms: u64) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_state_change_at: now_ms,
            half_open_in_flight: 0,
        }
    }

    /// Decide whether a call may proceed, promoting Open to HalfOpen once the
    /// open timeout has elapsed.
    pub fn try_acquire(&mut self, config: &BreakerConfig, now_ms: u64) -> (bool, Option<Transition>) {
        let open_for = now_ms.saturating_sub(self.last_state_change_at);
        let timeout_ms = config.open_timeout.as_millis() as u64;

        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                if open_for < timeout_ms {
                    return (false, None);
                }
                let transition = self.transition(CircuitState::HalfOpen, now_ms);
                self.half_open_in_flight = 1;
                (true, Some(transition))
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight < config.half_open_max_probes {
                    self.half_open_in_flight += 1;
                    (true, None)
                } else if open_for >= timeout_ms {
                    // The previous probe never reported back; let a new one through.
                    self.last_state_change_at = now_ms;
                    self.half_open_in_flight = 1;
                    (true, None)
                } else {
                    (false, None)
                }
            }
        }
    }

    pub fn on_success(&mut self, config: &BreakerConfig, now_ms: u64) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.success_count += 1;
                if self.success_count >= config.success_threshold {
                    Some(self.transition(CircuitState::Closed, now_ms))
                } else {
                    None
                }
            }
            // Late result of a call admitted before the circuit opened.
            CircuitState::Open => None,
        }
    }

    pub fn on_failure(&mut self, config: &BreakerConfig, now_ms: u64) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                let window_ms = config.monitoring_window.as_millis() as u64;
                if let Some(last) = self.last_failure_at {
                    if now_ms.saturating_sub(last) > window_ms {
                        self.failure_count = 0;
                    }
                }
                self.failure_count += 1;
                self.last_failure_at = Some(now_ms);
                if self.failure_count >= config.failure_threshold {
                    Some(self.transition(CircuitState::Open, now_ms))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.last_failure_at = Some(now_ms);
                Some(self.transition(CircuitState::Open, now_ms))
            }
            CircuitState::Open => {
                self.last_failure_at = Some(now_ms);
                None
            }
        }
    }

    /// Move to `to` regardless of the transition graph.
    pub fn force(&mut self, to: CircuitState, now_ms: u64) -> Option<Transition> {
        if self.state == to {
            if to == CircuitState::Closed {
                self.failure_count = 0;
                self.success_count = 0;
                self.last_failure_at = None;
            }
            return None;
        }
        let transition = self.transition(to, now_ms);
        if to == CircuitState::Closed {
            self.last_failure_at = None;
        }
        Some(transition)
    }

    fn transition(&mut self, to: CircuitState, now_ms: u64) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_state_change_at = now_ms;
        self.success_count = 0;
        self.half_open_in_flight = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
        Transition { from, to }
    }

    /// Flatten into hash fields for a shared store.
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert(FIELD_STATE.to_string(), self.state.as_str().to_string());
        fields.insert(FIELD_FAILURES.to_string(), self.failure_count.to_string());
        fields.insert(FIELD_SUCCESSES.to_string(), self.success_count.to_string());
        fields.insert(
            FIELD_LAST_FAILURE.to_string(),
            self.last_failure_at.map(|t| t.to_string()).unwrap_or_default(),
        );
        fields.insert(FIELD_LAST_CHANGE.to_string(), self.last_state_change_at.to_string());
        fields.insert(FIELD_IN_FLIGHT.to_string(), self.half_open_in_flight.to_string());
        fields
    }

    /// Rebuild a record from hash fields read out of a shared store.
    pub fn from_fields(name: &str, key: &str, fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let malformed = |reason: String| StoreError::Malformed {
            key: key.to_string(),
            reason,
        };
        let number = |field: &str| -> Result<u64, StoreError> {
            match fields.get(field).map(String::as_str) {
                None | Some("") => Ok(0),
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|e| malformed(format!("{}: {}", field, e))),
            }
        };

        let count = |field: &str| -> Result<u32, StoreError> {
            u32::try_from(number(field)?).map_err(|e| malformed(format!("{}: {}", field, e)))
        };

        let state = fields
            .get(FIELD_STATE)
            .ok_or_else(|| malformed("missing state".to_string()))?
            .parse::<CircuitState>()
            .map_err(malformed)?;
        let last_failure_at = match fields.get(FIELD_LAST_FAILURE).map(String::as_str) {
            None | Some("") => None,
            Some(_) => Some(number(FIELD_LAST_FAILURE)?),
        };

        Ok(Self {
            name: name.to_string(),
            state,
            failure_count: count(FIELD_FAILURES)?,
            success_count: count(FIELD_SUCCESSES)?,
            last_failure_at,
            last_state_change_at: number(FIELD_LAST_CHANGE)?,
            half_open_in_flight: count(FIELD_IN_FLIGHT)?,
        })
    }
}

/// Epoch-millisecond clock driven by the tokio timer, so paused test time
/// moves breaker timestamps too.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch_ms: u64,
    started: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch_ms: epoch_millis(),
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_ms + self.started.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
