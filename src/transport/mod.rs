//! Channel to the remote conversational agent
//!
//! A transport opens one [`AgentChannel`]: a non-blocking sender for
//! outbound frames plus a single stream of [`ChannelEvent`]s. The session
//! manager subscribes to that stream exactly once and dispatches every event
//! from one task.

mod websocket;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::VoiceResult;
use crate::protocol::{ClientMessage, ServerMessage, Setup};

pub use websocket::{LiveTransport, DEFAULT_ENDPOINT};

/// Everything the channel can report after it was opened
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Remote acknowledged the open configuration
    Opened,
    Message(ServerMessage),
    /// A frame that could not be decoded; the channel stays usable
    Protocol(String),
    /// Channel-level failure; a `Closed` normally follows
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Outbound half of an open channel
pub trait ChannelSender: Send + Sync {
    /// Queue a frame without waiting. A full queue or a closed channel is an
    /// error and the frame is not retried.
    fn send(&self, message: ClientMessage) -> VoiceResult<()>;

    /// Close the channel. Closing twice is not an error.
    fn close(&self) -> VoiceResult<()>;
}

/// An opened channel: the outbound handle and the inbound event stream
pub struct AgentChannel {
    pub sender: Arc<dyn ChannelSender>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Opens channels to the agent
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Open a channel and send `setup` as its first frame. Resolves once the
    /// channel is established; the acknowledgement arrives later as
    /// [`ChannelEvent::Opened`].
    async fn open(&self, setup: Setup) -> VoiceResult<AgentChannel>;
}
