//! # Ping
//!
//! Periodic liveness probing with latency measurement, one active machine
//! per connection:
//!
//! ```text
//! Idle ──send nonce──► WaitingPong ──pong──► Cooldown ──interval──► Idle
//!                           │
//!                        timeout ──► request close
//! ```
//!
//! Entering `Idle` emits a fresh 32-byte nonce and arms the timeout timer;
//! a matching pong yields the measured latency and arms the interval
//! timer. A pong with the wrong nonce is ignored. The passive side is
//! stateless: received ping payloads are echoed back unchanged.

use rand::{CryptoRng, RngCore};
use tracing::{debug, trace};

/// Protocol id negotiated for ping substreams.
pub const PROTOCOL_NAME: &str = "/ipfs/ping/1.0.0";

/// Ping payload size: a 32-byte random nonce, echoed verbatim.
pub const PING_SIZE: usize = 32;

/// Default pause between liveness probes.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;

/// Default wait for a pong before declaring the peer dead.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 10_000;

/// Ping tunables.
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Pause in `Cooldown` before the next probe.
    pub interval_ms: u64,
    /// Maximum wait in `WaitingPong`.
    pub timeout_ms: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_PING_INTERVAL_MS,
            timeout_ms: DEFAULT_PING_TIMEOUT_MS,
        }
    }
}

/// Which of the machine's two timers fired or should be armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingTimer {
    /// Armed while waiting for a pong.
    Timeout,
    /// Armed during cooldown between probes.
    Interval,
}

/// Instructions the machine hands back to its driver (the swarm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutput {
    /// Write these bytes to the ping substream.
    Send(Vec<u8>),
    /// Arm a timer.
    SetTimer { kind: PingTimer, duration_ms: u64 },
    /// Disarm a previously armed timer.
    CancelTimer(PingTimer),
    /// A matching pong arrived.
    PongReceived { latency_ms: u64 },
    /// No pong within the timeout; the connection should close.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    WaitingPong { nonce: [u8; PING_SIZE], sent_at_ms: u64 },
    Cooldown,
}

/// Active-side liveness machine.
pub struct Ping {
    config: PingConfig,
    state: State,
}

impl Ping {
    pub fn new(config: PingConfig) -> Self {
        Self {
            config,
            state: State::Idle,
        }
    }

    /// Enter `Idle` and fire the first probe.
    pub fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R, now_ms: u64) -> Vec<PingOutput> {
        self.probe(rng, now_ms)
    }

    fn probe<R: RngCore + CryptoRng>(&mut self, rng: &mut R, now_ms: u64) -> Vec<PingOutput> {
        let mut nonce = [0u8; PING_SIZE];
        rng.fill_bytes(&mut nonce);
        self.state = State::WaitingPong { nonce, sent_at_ms: now_ms };
        vec![
            PingOutput::Send(nonce.to_vec()),
            PingOutput::SetTimer {
                kind: PingTimer::Timeout,
                duration_ms: self.config.timeout_ms,
            },
        ]
    }

    /// Feed a pong payload read from the peer.
    pub fn on_pong(&mut self, payload: &[u8], now_ms: u64) -> Vec<PingOutput> {
        match &self.state {
            State::WaitingPong { nonce, sent_at_ms } if payload == nonce => {
                let latency_ms = now_ms.saturating_sub(*sent_at_ms);
                debug!(latency_ms, "pong received");
                self.state = State::Cooldown;
                vec![
                    PingOutput::CancelTimer(PingTimer::Timeout),
                    PingOutput::PongReceived { latency_ms },
                    PingOutput::SetTimer {
                        kind: PingTimer::Interval,
                        duration_ms: self.config.interval_ms,
                    },
                ]
            }
            _ => {
                trace!("ignoring stale or mismatched pong");
                Vec::new()
            }
        }
    }

    /// A timer armed by this machine fired.
    pub fn on_timer<R: RngCore + CryptoRng>(
        &mut self,
        kind: PingTimer,
        rng: &mut R,
        now_ms: u64,
    ) -> Vec<PingOutput> {
        match (kind, &self.state) {
            (PingTimer::Timeout, State::WaitingPong { .. }) => {
                debug!("ping timed out");
                self.state = State::Idle;
                vec![PingOutput::Timeout]
            }
            (PingTimer::Interval, State::Cooldown) => self.probe(rng, now_ms),
            // Stale timer from a superseded state.
            _ => Vec::new(),
        }
    }
}

/// Passive side: echo the received probe unchanged.
pub fn echo(payload: &[u8]) -> Vec<u8> {
    payload.to_vec()
}
