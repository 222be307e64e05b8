//! The half-duplex relay: one per direction of a proxied connection. Reads
//! chunks, applies the substitution rules, fixes up `Content-Length` when a
//! rewrite changed an HTTP body, logs every message, and services router
//! hand-offs.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::error;
use wiretap_core::content_length::adjust;
use wiretap_core::rules::{RewriteRule, apply_rules};
use wiretap_core::splice::PrefixedReader;
use wiretap_core::text::{escape_for_log, latin1_decode, latin1_encode};
use wiretap_core::traffic::{TrafficLog, timestamp};

use crate::router::StreamRouter;

/// Read buffer size; substitutions never span two chunks.
pub const CHUNK_SIZE: usize = 64 * 1024;
/// Verbose log lines are cut at this many characters.
const LOG_TRUNCATE: usize = 500;
/// Stats cadence once the verbose cap is exceeded.
const STATS_INTERVAL: Duration = Duration::from_secs(10);
/// Verbose cap applied as soon as a chunk smells like WebSocket traffic.
const WS_VERBOSE_CAP: u64 = 999;
/// Environment override for the per-connection verbose message cap.
const MAX_MSGS_ENV: &str = "MAX_MSGS_DISPLAY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    C2R,
    R2C,
}

impl Direction {
    pub fn tag(self) -> &'static str {
        match self {
            Direction::C2R => "C2R",
            Direction::R2C => "R2C",
        }
    }
}

pub type RelayReader = Box<dyn AsyncRead + Unpin + Send>;
pub type RelayWriter = Box<dyn AsyncWrite + Unpin + Send>;

fn verbose_cap_from_env() -> u64 {
    std::env::var(MAX_MSGS_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(u64::MAX)
}

pub struct Relay {
    input: RelayReader,
    output: RelayWriter,
    direction: Direction,
    label: String,
    log: Arc<dyn TrafficLog>,
    stop: CancellationToken,
    rules: Arc<Vec<RewriteRule>>,
    router: Option<Arc<StreamRouter>>,
    packets: u64,
    total_bytes: u64,
    verbose_cap: u64,
    last_stats: Instant,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: RelayReader,
        output: RelayWriter,
        direction: Direction,
        label: String,
        log: Arc<dyn TrafficLog>,
        stop: CancellationToken,
        rules: Arc<Vec<RewriteRule>>,
        router: Option<Arc<StreamRouter>>,
    ) -> Self {
        Self {
            input,
            output,
            direction,
            label,
            log,
            stop,
            rules,
            router,
            packets: 0,
            total_bytes: 0,
            verbose_cap: verbose_cap_from_env(),
            last_stats: Instant::now(),
        }
    }

    fn line(&self, text: &str) {
        self.log.line(&format!(
            "#{} {} [{}] {}",
            timestamp(),
            self.direction.tag(),
            self.label,
            text
        ));
    }

    /// Pump until end-of-stream, an I/O error, or cancellation. Any exit
    /// cancels the shared stop token so the peer relay tears down too.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            // A switch that happened while this relay was idle.
            if self.direction == Direction::C2R {
                self.pickup(None);
            }

            let n = tokio::select! {
                _ = self.stop.cancelled() => break,
                result = self.input.read(&mut buf) => match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        self.report_io_error("read", &err);
                        break;
                    }
                }
            };

            // A switch that raced the read: splice the edge chunk back onto
            // the input and restart the turn; nothing is written yet.
            if self.direction == Direction::C2R && self.pickup(Some(&buf[..n])) {
                continue;
            }

            self.packets += 1;
            self.total_bytes += n as u64;

            let original = latin1_decode(&buf[..n]);
            if original.contains("Connection: upgrade") || original.contains("Sec-WebSocket") {
                // WebSocket data is noisy; stop verbose-logging it soon.
                self.verbose_cap = self.verbose_cap.min(WS_VERBOSE_CAP);
            }

            let mut modified = apply_rules(&self.rules, &original);
            if modified != original {
                modified = adjust(&original, &modified);
            }

            self.log_message(&modified);

            let write_result = if modified == original {
                self.output.write_all(&buf[..n]).await
            } else {
                self.output.write_all(&latin1_encode(&modified)).await
            };
            if let Err(err) = write_result.and(self.output.flush().await) {
                self.report_io_error("write", &err);
                break;
            }

            if self.direction == Direction::R2C {
                if let Some(router) = self.router.clone() {
                    match router.check_for_switch(&original).await {
                        Ok(Some(handoff)) => {
                            self.line("switch trigger matched; reading from new upstream");
                            let old_input =
                                std::mem::replace(&mut self.input, Box::new(handoff.primary_in));
                            self.spawn_aux(old_input, Box::new(handoff.side_out));
                        }
                        Ok(None) => {}
                        Err(err) => {
                            self.report_io_error("switch dial", &err);
                            break;
                        }
                    }
                }
            }
        }

        self.stop.cancel();
        let _ = self.output.shutdown().await;
        self.line(&format!(
            "Connection closed: Packets={}, Total Bytes={}",
            self.packets, self.total_bytes
        ));
    }

    /// C2R side of a routing switch: redirect output to the new primary
    /// socket and keep the former output served from the side channel. When
    /// a chunk was already read off the old turn, splice it back onto the
    /// input so the edge packet is not lost.
    fn pickup(&mut self, pending: Option<&[u8]>) -> bool {
        let Some(handoff) = self.router.as_ref().and_then(|router| router.pull_switch()) else {
            return false;
        };
        self.line("switch picked up; writing to new upstream");

        let old_output = std::mem::replace(&mut self.output, Box::new(handoff.primary_out));
        self.spawn_aux(Box::new(handoff.side_in), old_output);

        if let Some(chunk) = pending {
            let old_input =
                std::mem::replace(&mut self.input, Box::new(tokio::io::empty()) as RelayReader);
            self.input = Box::new(PrefixedReader::new(chunk.to_vec(), old_input));
        }
        true
    }

    /// Auxiliary relay bridging the original connection's freed halves to
    /// the side channel: same direction tag, same stop token, same rules,
    /// no router (the switch is single-shot).
    fn spawn_aux(&self, input: RelayReader, output: RelayWriter) {
        let aux = Relay::new(
            input,
            output,
            self.direction,
            format!("{}-aux", self.label),
            self.log.clone(),
            self.stop.clone(),
            self.rules.clone(),
            None,
        );
        tokio::spawn(aux.run());
    }

    fn log_message(&mut self, text: &str) {
        if self.packets <= self.verbose_cap {
            self.line(&escape_for_log(text, LOG_TRUNCATE));
        } else if text.starts_with("GET ") || text.starts_with("POST ") {
            self.line(&escape_for_log(text, LOG_TRUNCATE));
        } else if self.last_stats.elapsed() >= STATS_INTERVAL {
            self.last_stats = Instant::now();
            self.line(&format!(
                "Packets={}, Total Bytes={}",
                self.packets, self.total_bytes
            ));
        }
    }

    fn report_io_error(&self, during: &str, err: &io::Error) {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => {
                self.line(&format!("connection closed during {during}: {err}"));
            }
            _ => error!("relay {} [{}] {during} failed: {err}", self.direction.tag(), self.label),
        }
    }
}
