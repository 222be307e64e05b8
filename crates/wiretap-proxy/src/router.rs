//! Mid-stream upstream switching. A router is shared by the two relays of
//! one connection pair: the remote-to-client relay watches server messages
//! for the trigger and dials the replacement sockets; the client-to-remote
//! relay picks its halves up from a one-slot queue on its next turn.

use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::info;
use wiretap_core::error::ConfigError;

/// CLI-level router settings (`--transfer-connection`).
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub target_host: String,
    pub primary_port: u16,
    pub side_port: u16,
    /// Matched against the entire server message, not a substring.
    pub trigger: String,
}

/// Compile a trigger with whole-input match semantics.
pub fn compile_trigger(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|err| ConfigError::InvalidTrigger(err.to_string()))
}

/// The halves returned to the remote-to-client relay at the moment of the
/// switch: it starts reading from the new primary socket, and its former
/// input is bridged to the side channel by an auxiliary relay.
pub struct R2cHandoff {
    pub primary_in: OwnedReadHalf,
    pub side_out: OwnedWriteHalf,
}

/// The halves queued for the client-to-remote relay: it redirects its output
/// to the new primary socket, and the side channel's read side drives its
/// former output through an auxiliary relay.
pub struct C2rHandoff {
    pub primary_out: OwnedWriteHalf,
    pub side_in: OwnedReadHalf,
}

/// One-shot switch state for a single connection pair.
///
/// `switched` latches on the first trigger match and never resets; the slot
/// is written at most once and drained at most once. If the consuming relay
/// dies first the undrained halves close on drop when the pair tears down.
pub struct StreamRouter {
    target_host: String,
    primary_port: u16,
    side_port: u16,
    trigger: Regex,
    switched: AtomicBool,
    slot: Mutex<Option<C2rHandoff>>,
}

impl StreamRouter {
    pub fn new(config: &RouterConfig) -> Result<Self, ConfigError> {
        let trigger = compile_trigger(&config.trigger)?;
        Ok(Self::with_trigger(config, trigger))
    }

    /// Build with an already-compiled trigger; used by the supervisor which
    /// validates the pattern once and instantiates per connection.
    pub fn with_trigger(config: &RouterConfig, trigger: Regex) -> Self {
        Self {
            target_host: config.target_host.clone(),
            primary_port: config.primary_port,
            side_port: config.side_port,
            trigger,
            switched: AtomicBool::new(false),
            slot: Mutex::new(None),
        }
    }

    pub fn has_switched(&self) -> bool {
        self.switched.load(Ordering::SeqCst)
    }

    /// Called by the remote-to-client relay after each server message. On
    /// the first whole-text match: latch, dial both replacement sockets
    /// (plaintext), queue the client-to-remote halves and return the
    /// remote-to-client halves. Dial failure propagates; the latch stays set
    /// so the switch never retries.
    pub async fn check_for_switch(&self, text: &str) -> io::Result<Option<R2cHandoff>> {
        if self.switched.load(Ordering::SeqCst) || !self.trigger.is_match(text) {
            return Ok(None);
        }
        self.switched.store(true, Ordering::SeqCst);

        let primary =
            TcpStream::connect((self.target_host.as_str(), self.primary_port)).await?;
        let side = TcpStream::connect((self.target_host.as_str(), self.side_port)).await?;
        info!(
            "trigger matched; dialed {}:{} and side channel {}:{}",
            self.target_host, self.primary_port, self.target_host, self.side_port
        );

        let (primary_in, primary_out) = primary.into_split();
        let (side_in, side_out) = side.into_split();
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(C2rHandoff {
                primary_out,
                side_in,
            });
        }
        Ok(Some(R2cHandoff {
            primary_in,
            side_out,
        }))
    }

    /// Called by the client-to-remote relay each turn; non-blocking.
    pub fn pull_switch(&self) -> Option<C2rHandoff> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}
