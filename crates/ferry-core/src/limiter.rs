//! Bandwidth limiting
//!
//! Throughput is accounted per direction (read/write) and per scope:
//! - **Global**: shared by every transfer of the host ([`BandwidthLimiter`])
//! - **Session**: one transfer ([`SessionLimiter`])
//!
//! Callers charge the bytes they are about to move, then sleep for the
//! returned delay and ask again until it reaches zero. The binding delay is
//! the larger of the session and global delays. Limits are read on every
//! check, so an administrative [`Limit`] update applies at the next re-check.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Longest single wait handed out to a caller
pub const MAX_WAIT: Duration = Duration::from_secs(1);

/// Per-host bandwidth policy, bytes per second (`0` = unlimited)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Limit {
    /// Host-wide read ceiling
    pub read_global_limit: u64,
    /// Host-wide write ceiling
    pub write_global_limit: u64,
    /// Per-transfer read ceiling
    pub read_session_limit: u64,
    /// Per-transfer write ceiling
    pub write_session_limit: u64,
    /// Milliseconds between throughput re-samples (`0` = every operation)
    pub delay_limit: u64,
}

impl Limit {
    /// No limit in any direction
    pub const UNLIMITED: Self = Self {
        read_global_limit: 0,
        write_global_limit: 0,
        read_session_limit: 0,
        write_session_limit: 0,
        delay_limit: 0,
    };

    fn global(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Read => self.read_global_limit,
            Direction::Write => self.write_global_limit,
        }
    }

    fn session(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Read => self.read_session_limit,
            Direction::Write => self.write_session_limit,
        }
    }

    fn resample(&self) -> Duration {
        Duration::from_millis(self.delay_limit)
    }
}

/// I/O direction being accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Reading from disk (push side)
    Read,
    /// Writing to disk (pull side)
    Write,
}

/// Bytes consumed since the start of the current sampling window
#[derive(Debug, Clone)]
struct RateWindow {
    start: Instant,
    consumed: u64,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            start: now,
            consumed: 0,
        }
    }

    fn charge(&mut self, bytes: u64, limit: u64, resample: Duration, now: Instant) -> Duration {
        if limit == 0 {
            *self = Self::new(now);
            return Duration::ZERO;
        }
        let elapsed = now.saturating_duration_since(self.start);
        // Only start a fresh window once the old one is paid off
        if elapsed >= resample && self.debt(limit, elapsed).is_zero() {
            *self = Self::new(now);
        }
        self.consumed = self.consumed.saturating_add(bytes);
        self.delay(limit, now)
    }

    fn delay(&self, limit: u64, now: Instant) -> Duration {
        if limit == 0 {
            return Duration::ZERO;
        }
        self.debt(limit, now.saturating_duration_since(self.start))
    }

    fn debt(&self, limit: u64, elapsed: Duration) -> Duration {
        let micros = u128::from(self.consumed) * 1_000_000 / u128::from(limit);
        let needed = Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX));
        needed.saturating_sub(elapsed)
    }
}

#[derive(Debug)]
struct DirectionState {
    window: Mutex<RateWindow>,
    total: AtomicU64,
}

impl DirectionState {
    fn new(now: Instant) -> Self {
        Self {
            window: Mutex::new(RateWindow::new(now)),
            total: AtomicU64::new(0),
        }
    }
}

/// Snapshot of host-wide limiter counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimiterStats {
    /// Bytes charged for reads
    pub bytes_read: u64,
    /// Bytes charged for writes
    pub bytes_written: u64,
}

/// Host-wide limiter shared by every transfer
#[derive(Debug)]
pub struct BandwidthLimiter {
    limit: RwLock<Limit>,
    read: DirectionState,
    write: DirectionState,
}

impl BandwidthLimiter {
    /// Create a limiter enforcing `limit`
    pub fn new(limit: Limit) -> Self {
        let now = Instant::now();
        Self {
            limit: RwLock::new(limit),
            read: DirectionState::new(now),
            write: DirectionState::new(now),
        }
    }

    /// Limiter that never delays
    pub fn unlimited() -> Self {
        Self::new(Limit::UNLIMITED)
    }

    /// Current policy
    pub fn limit(&self) -> Limit {
        *self.limit.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the policy; running transfers pick it up at their next check
    pub fn update_limit(&self, limit: Limit) {
        tracing::info!(
            "Bandwidth limit updated: read {}/{} write {}/{} B/s (global/session), delay {}ms",
            limit.read_global_limit,
            limit.read_session_limit,
            limit.write_global_limit,
            limit.write_session_limit,
            limit.delay_limit
        );
        *self.limit.write().unwrap_or_else(PoisonError::into_inner) = limit;
    }

    /// Open a session scope bound to this limiter
    pub fn session(self: &Arc<Self>) -> SessionLimiter {
        SessionLimiter::new(Arc::clone(self))
    }

    /// Host-wide counters
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            bytes_read: self.read.total.load(Ordering::Relaxed),
            bytes_written: self.write.total.load(Ordering::Relaxed),
        }
    }

    fn state(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    fn charge(&self, direction: Direction, bytes: u64, limit: &Limit, now: Instant) -> Duration {
        let state = self.state(direction);
        state.total.fetch_add(bytes, Ordering::Relaxed);
        state
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .charge(bytes, limit.global(direction), limit.resample(), now)
    }

    fn delay(&self, direction: Direction, limit: &Limit, now: Instant) -> Duration {
        self.state(direction)
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delay(limit.global(direction), now)
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Per-transfer limiter scope, owned by one state machine
#[derive(Debug)]
pub struct SessionLimiter {
    global: Arc<BandwidthLimiter>,
    read: RateWindow,
    write: RateWindow,
}

impl SessionLimiter {
    /// Create a session scope under `global`
    pub fn new(global: Arc<BandwidthLimiter>) -> Self {
        let now = Instant::now();
        Self {
            global,
            read: RateWindow::new(now),
            write: RateWindow::new(now),
        }
    }

    fn window(&mut self, direction: Direction) -> &mut RateWindow {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    /// Account `bytes` in both scopes and return the bounded wait
    pub fn charge(&mut self, direction: Direction, bytes: u64) -> Duration {
        let limit = self.global.limit();
        let now = Instant::now();
        let session = self.window(direction).charge(
            bytes,
            limit.session(direction),
            limit.resample(),
            now,
        );
        let global = self.global.charge(direction, bytes, &limit, now);
        session.max(global).min(MAX_WAIT)
    }

    /// Remaining bounded wait for bytes already charged
    pub fn pending_delay(&mut self, direction: Direction) -> Duration {
        let limit = self.global.limit();
        let now = Instant::now();
        let session = self.window(direction).delay(limit.session(direction), now);
        let global = self.global.delay(direction, &limit, now);
        session.max(global).min(MAX_WAIT)
    }

    /// Charge `bytes` then sleep until both scopes allow the I/O
    pub async fn throttle(&mut self, direction: Direction, bytes: usize) {
        let mut wait = self.charge(direction, bytes as u64);
        while !wait.is_zero() {
            tracing::trace!("Throttling {:?} for {:?}", direction, wait);
            tokio::time::sleep(wait).await;
            wait = self.pending_delay(direction);
        }
    }
}
