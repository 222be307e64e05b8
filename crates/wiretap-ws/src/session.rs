//! Post-upgrade server session: a reader task delivering inbound text to
//! hooks and a writer task draining a bounded outgoing queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::WsError;
use crate::frame::{OpCode, Role, WsConnection, read_frame, write_frame};

/// Outgoing queue depth.
const OUTGOING_QUEUE: usize = 16;
/// How long the writer waits on the queue before re-checking liveness.
const WRITER_POLL: Duration = Duration::from_millis(200);

/// Hooks fired by the session's reader task. `on_close` runs exactly once,
/// after `on_error` if the session ended with one.
pub trait SessionEvents: Send + Sync + 'static {
    fn on_message(&self, text: String);
    fn on_error(&self, error: &WsError);
    fn on_close(&self);
}

/// Handle to a running server-side session.
pub struct WsSession {
    outgoing: mpsc::Sender<String>,
    active: Arc<AtomicBool>,
}

impl WsSession {
    /// Split the upgraded connection into a reader task and a writer task.
    pub fn spawn<R, W, E>(connection: WsConnection<R, W>, events: Arc<E>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        E: SessionEvents,
    {
        let (mut reader, writer, role) = connection.into_parts();
        let writer = Arc::new(Mutex::new(writer));
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(OUTGOING_QUEUE);
        let active = Arc::new(AtomicBool::new(true));
        let closed_once = Arc::new(AtomicBool::new(false));

        let mask = match role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        };

        // Reader: deliver text, echo pings, stop on close or error.
        {
            let writer = writer.clone();
            let active = active.clone();
            let events = events.clone();
            let closed_once = closed_once.clone();
            tokio::spawn(async move {
                loop {
                    let frame = match read_frame(&mut reader).await {
                        Ok(frame) => frame,
                        Err(err) => {
                            events.on_error(&err);
                            break;
                        }
                    };
                    match frame.opcode {
                        OpCode::Text => match String::from_utf8(frame.payload) {
                            Ok(text) => events.on_message(text),
                            Err(_) => {
                                events.on_error(&WsError::InvalidUtf8);
                                break;
                            }
                        },
                        OpCode::Ping => {
                            let mut writer = writer.lock().await;
                            if write_frame(&mut *writer, OpCode::Pong, &frame.payload, mask)
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        OpCode::Pong => {}
                        OpCode::Close => break,
                        other => {
                            events.on_error(&WsError::UnsupportedOpcode(other as u8));
                            break;
                        }
                    }
                }
                active.store(false, Ordering::SeqCst);
                if !closed_once.swap(true, Ordering::SeqCst) {
                    events.on_close();
                }
            });
        }

        // Writer: poll the queue with a bounded wait so a dropped active
        // flag is noticed; drain one final round before closing.
        {
            let active = active.clone();
            tokio::spawn(async move {
                loop {
                    if !active.load(Ordering::SeqCst) {
                        while let Ok(text) = outgoing_rx.try_recv() {
                            let mut writer = writer.lock().await;
                            let _ =
                                write_frame(&mut *writer, OpCode::Text, text.as_bytes(), mask)
                                    .await;
                        }
                        break;
                    }
                    match tokio::time::timeout(WRITER_POLL, outgoing_rx.recv()).await {
                        Ok(Some(text)) => {
                            let mut writer = writer.lock().await;
                            if write_frame(&mut *writer, OpCode::Text, text.as_bytes(), mask)
                                .await
                                .is_err()
                            {
                                active.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {} // poll expired; loop to re-check active
                    }
                }
                // Best-effort close handshake on the way out.
                let mut writer = writer.lock().await;
                let _ = write_frame(&mut *writer, OpCode::Close, &[], mask).await;
                debug!("websocket session writer finished");
            });
        }

        Self {
            outgoing: outgoing_tx,
            active,
        }
    }

    /// Queue a text message for the writer task.
    pub async fn send(&self, text: String) -> Result<(), WsError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(WsError::ConnectionClosed);
        }
        self.outgoing
            .send(text)
            .await
            .map_err(|_| WsError::ConnectionClosed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Drop the active flag; the writer drains once more and closes.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}
