//! Handshake Protocol
//!
//! Announces a pending update to the running firmware and negotiates how long
//! to wait before the debug interface takes the chip over.
//!
//! ```text
//! INIT -> ANNOUNCING -> (ACKED | TIMED_OUT) -> WAITING -> READY
//! ```
//!
//! An unresponsive device does not block the update forever: once the announce
//! deadline passes the session proceeds with the default wait.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::serial::{SerialConnector, SerialError, SerialLink};

const ACK_PREFIX: &[u8] = b"ACK:";
const INBOX_LIMIT: usize = 256;
const WAIT_SLICE: Duration = Duration::from_secs(1);
/// Longest span ever added to an `Instant`
const HORIZON: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Serial channel unavailable: {0}")]
    SerialUnavailable(#[source] SerialError),
    #[error("Handshake aborted by operator")]
    Cancelled,
}

/// Monotonic time source
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Operator request to stop before the device is flashed
pub trait AbortSignal: Send + Sync {
    fn is_aborted(&self) -> bool;

    /// Forget a request that has been honored
    fn clear(&self) {}
}

impl AbortSignal for AtomicBool {
    fn is_aborted(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

/// Abort requested by creating a marker file
pub struct AbortFile {
    path: PathBuf,
}

impl AbortFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Remove the marker so the next run is not aborted too
    pub fn consume(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl AbortSignal for AbortFile {
    fn is_aborted(&self) -> bool {
        self.path.exists()
    }

    fn clear(&self) {
        if let Err(e) = self.consume() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove abort marker");
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeSettings {
    /// Bound on each read attempt
    pub read_timeout: Duration,
    /// Pause between announce attempts
    pub announce_interval: Duration,
    /// Bound on the whole announcing phase
    pub deadline: Duration,
    /// Wait used when the device never answers
    pub default_wait: Duration,
    /// Ceiling on device-requested waits
    pub max_wait: Duration,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(2),
            announce_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(300),
            default_wait: Duration::from_secs(300),
            max_wait: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    Announcing,
    Acked { requested_secs: u64 },
    TimedOut,
    Waiting,
}

/// Ephemeral state of one handshake
#[derive(Debug)]
pub struct HandshakeSession {
    pub state: HandshakeState,
    pub message: String,
    pub deadline: Instant,
    pub announcements: u32,
}

impl HandshakeSession {
    fn new(version: u64, started: Instant, deadline: Duration) -> Self {
        Self {
            state: HandshakeState::Init,
            message: announcement(version),
            deadline: later(started, deadline),
            announcements: 0,
        }
    }

    fn enter(&mut self, state: HandshakeState) {
        tracing::debug!(from = ?self.state, to = ?state, "Handshake transition");
        self.state = state;
    }
}

/// Negotiated result; READY once the wait has been held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// `Some(secs)` when the device acknowledged, `None` on timeout
    pub acknowledged: Option<u64>,
    pub wait: Duration,
    pub announcements: u32,
}

fn later(from: Instant, span: Duration) -> Instant {
    from + span.min(HORIZON)
}

/// Message announcing `version` to the device
pub fn announcement(version: u64) -> String {
    format!("UPDATE_AVAILABLE:{}", version)
}

pub struct HandshakeProtocol<'a> {
    connector: &'a dyn SerialConnector,
    clock: &'a dyn Clock,
    abort: &'a dyn AbortSignal,
    settings: HandshakeSettings,
}

impl<'a> HandshakeProtocol<'a> {
    pub fn new(
        connector: &'a dyn SerialConnector,
        clock: &'a dyn Clock,
        abort: &'a dyn AbortSignal,
        settings: HandshakeSettings,
    ) -> Self {
        Self {
            connector,
            clock,
            abort,
            settings,
        }
    }

    /// Drive a full session to READY
    pub fn run(&self, version: u64) -> Result<HandshakeOutcome, HandshakeError> {
        let outcome = self.negotiate(version)?;
        self.hold(outcome.wait)?;
        Ok(outcome)
    }

    /// Announce until acknowledged or out of time, and settle the wait
    pub fn negotiate(&self, version: u64) -> Result<HandshakeOutcome, HandshakeError> {
        let mut session = HandshakeSession::new(version, self.clock.now(), self.settings.deadline);

        let mut link = self.connector.open().map_err(HandshakeError::SerialUnavailable)?;

        session.enter(HandshakeState::Announcing);
        tracing::info!(message = %session.message, "Announcing update to device");
        let acknowledged = self.announce(link.as_mut(), &mut session)?;
        drop(link);

        let wait = match acknowledged {
            Some(requested_secs) => {
                session.enter(HandshakeState::Acked { requested_secs });
                let requested = Duration::from_secs(requested_secs);
                if requested > self.settings.max_wait {
                    tracing::warn!(
                        requested_secs,
                        max_secs = self.settings.max_wait.as_secs(),
                        "Device requested an excessive wait, clamping"
                    );
                    self.settings.max_wait
                } else {
                    requested
                }
            }
            None => {
                session.enter(HandshakeState::TimedOut);
                tracing::warn!(
                    announcements = session.announcements,
                    "Device did not acknowledge, proceeding with default wait"
                );
                self.settings.default_wait
            }
        };
        session.enter(HandshakeState::Waiting);

        Ok(HandshakeOutcome {
            acknowledged,
            wait,
            announcements: session.announcements,
        })
    }

    /// Sleep out the wait in short slices, honoring aborts
    pub fn hold(&self, wait: Duration) -> Result<(), HandshakeError> {
        tracing::info!(seconds = wait.as_secs(), "Waiting for device to reach a safe state");
        let until = later(self.clock.now(), wait);
        loop {
            if self.abort.is_aborted() {
                return Err(HandshakeError::Cancelled);
            }
            let left = self.remaining(until);
            if left.is_zero() {
                tracing::debug!("Handshake ready");
                return Ok(());
            }
            self.clock.sleep(left.min(WAIT_SLICE));
        }
    }

    fn remaining(&self, until: Instant) -> Duration {
        until.saturating_duration_since(self.clock.now())
    }

    fn announce(&self, link: &mut dyn SerialLink, session: &mut HandshakeSession) -> Result<Option<u64>, HandshakeError> {
        let mut inbox = AckScanner::default();

        loop {
            if self.abort.is_aborted() {
                return Err(HandshakeError::Cancelled);
            }
            if self.remaining(session.deadline).is_zero() {
                return Ok(None);
            }

            match link.write_all(session.message.as_bytes()) {
                Ok(()) => session.announcements += 1,
                Err(e) => tracing::warn!(error = %e, "Announce write failed, retrying"),
            }

            let window = self.settings.read_timeout.min(self.remaining(session.deadline));
            if let Some(secs) = self.listen(link, &mut inbox, self.clock.now() + window) {
                tracing::info!(seconds = secs, announcements = session.announcements, "Device acknowledged update");
                return Ok(Some(secs));
            }

            let pause = self.settings.announce_interval.min(self.remaining(session.deadline));
            if !pause.is_zero() {
                self.clock.sleep(pause);
            }
        }
    }

    /// One bounded read attempt; read errors are swallowed
    fn listen(&self, link: &mut dyn SerialLink, inbox: &mut AckScanner, until: Instant) -> Option<u64> {
        let mut buf = [0u8; 128];
        loop {
            let left = self.remaining(until);
            if left.is_zero() {
                break;
            }
            match link.read_timeout(&mut buf, left) {
                Ok(0) => break,
                Ok(n) => {
                    if let Scan::Complete(secs) = inbox.feed(&buf[..n]) {
                        return Some(secs);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Serial read failed");
                    break;
                }
            }
        }
        // Line went quiet; an ack whose digits ran to the end of input is whole
        inbox.finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    Complete(u64),
    Pending,
    Nothing,
}

/// Accumulates inbound bytes and finds `ACK:<digits>` across read boundaries
#[derive(Default)]
struct AckScanner {
    buf: Vec<u8>,
}

impl AckScanner {
    fn feed(&mut self, data: &[u8]) -> Scan {
        self.buf.extend_from_slice(data);
        if self.buf.len() > INBOX_LIMIT {
            let excess = self.buf.len() - INBOX_LIMIT;
            self.buf.drain(..excess);
        }
        let scan = scan_ack(&self.buf, false);
        if matches!(scan, Scan::Complete(_)) {
            self.buf.clear();
        }
        scan
    }

    fn finish(&mut self) -> Option<u64> {
        match scan_ack(&self.buf, true) {
            Scan::Complete(secs) => {
                self.buf.clear();
                Some(secs)
            }
            _ => None,
        }
    }
}

fn scan_ack(buf: &[u8], at_end: bool) -> Scan {
    let mut from = 0;
    while let Some(pos) = buf[from..].windows(ACK_PREFIX.len()).position(|w| w == ACK_PREFIX) {
        let at = from + pos;
        let start = at + ACK_PREFIX.len();
        // Part of a longer word such as NACK
        if at > 0 && buf[at - 1].is_ascii_alphabetic() {
            from = start;
            continue;
        }
        let digits = buf[start..].iter().take_while(|b| b.is_ascii_digit()).count();
        let end = start + digits;

        if digits == 0 {
            if start == buf.len() && !at_end {
                return Scan::Pending;
            }
            from = start;
            continue;
        }
        if end == buf.len() && !at_end {
            return Scan::Pending;
        }
        match std::str::from_utf8(&buf[start..end]).ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(secs) => return Scan::Complete(secs),
            None => from = end,
        }
    }
    Scan::Nothing
}
