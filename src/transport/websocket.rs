use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::{AgentChannel, AgentTransport, ChannelEvent, ChannelSender};
use crate::config::AgentConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{ClientMessage, ServerMessage, Setup};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Outbound frames waiting for the socket. Small on purpose: a slow socket
/// makes capture drop frames instead of queueing stale audio.
const OUTBOUND_QUEUE: usize = 32;

/// Abnormal closure, reported when the socket dies without a close frame
const ABNORMAL_CLOSE: u16 = 1006;

/// WebSocket transport to the live agent
pub struct LiveTransport {
    endpoint: String,
    api_key_env: String,
}

impl LiveTransport {
    pub fn new(endpoint: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key_env: api_key_env.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(&config.endpoint, &config.api_key_env)
    }

    /// Read right before each connect so a rotated key is picked up
    fn credential(&self) -> VoiceResult<String> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(VoiceError::Configuration(format!(
                "{} is not set",
                self.api_key_env
            ))),
        }
    }
}

#[async_trait]
impl AgentTransport for LiveTransport {
    async fn open(&self, setup: Setup) -> VoiceResult<AgentChannel> {
        let key = self.credential()?;
        let url = format!("{}?key={}", self.endpoint, key);

        info!("Connecting to live agent at {}", self.endpoint);

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut write, read) = socket.split();

        let setup_frame = ClientMessage::Setup(setup).to_json()?;
        write.send(Message::Text(setup_frame)).await?;
        debug!("Open configuration sent");

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let close_signal = Arc::new(Notify::new());

        let writer_close = Arc::clone(&close_signal);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!("WebSocket write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_close.notified() => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: Cow::Borrowed("client disconnect"),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!("Close frame not delivered: {}", e);
                        }
                        break;
                    }
                }
            }
            let _ = write.close().await;
            debug!("WebSocket writer stopped");
        });

        tokio::spawn(read_loop(read, event_tx));

        Ok(AgentChannel {
            sender: Arc::new(WebSocketSender {
                frames: out_tx,
                close_signal,
                closed: AtomicBool::new(false),
            }),
            events: event_rx,
        })
    }
}

struct WebSocketSender {
    frames: mpsc::Sender<String>,
    close_signal: Arc<Notify>,
    closed: AtomicBool,
}

impl ChannelSender for WebSocketSender {
    fn send(&self, message: ClientMessage) -> VoiceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Transport("channel is closed".to_string()));
        }
        let text = message.to_json()?;
        self.frames.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                VoiceError::Transport("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                VoiceError::Transport("socket writer stopped".to_string())
            }
        })
    }

    fn close(&self) -> VoiceResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_one();
        }
        Ok(())
    }
}

async fn read_loop<S>(mut read: S, events: mpsc::UnboundedSender<ChannelEvent>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = read.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => decode_frame(&text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => decode_frame(text),
                Err(e) => ChannelEvent::Protocol(format!("binary frame is not UTF-8: {}", e)),
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                    None => (None, String::new()),
                };
                let _ = events.send(ChannelEvent::Closed { code, reason });
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = events.send(ChannelEvent::Error(e.to_string()));
                let _ = events.send(ChannelEvent::Closed {
                    code: Some(ABNORMAL_CLOSE),
                    reason: e.to_string(),
                });
                return;
            }
        };

        if events.send(event).is_err() {
            debug!("Event consumer gone, stopping WebSocket reader");
            return;
        }
    }

    let _ = events.send(ChannelEvent::Closed {
        code: Some(ABNORMAL_CLOSE),
        reason: "stream ended".to_string(),
    });
}

/// Map one text frame to a channel event
pub(crate) fn decode_frame(text: &str) -> ChannelEvent {
    match ServerMessage::parse(text) {
        Ok(ServerMessage::SetupComplete) => ChannelEvent::Opened,
        Ok(message) => ChannelEvent::Message(message),
        Err(e) => ChannelEvent::Protocol(e.to_string()),
    }
}
