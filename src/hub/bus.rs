//! Hub event bus: request/notification messages between SDK clients and
//! the hub's service handlers.
//!
//! Methods are `"prefix/action"` strings (e.g. `"registry/discover"`,
//! `"conversations/send"`). Requests carry a `oneshot` reply slot;
//! notifications are fire-and-forget.

use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::types::{
    AgentId, ConversationId, ConversationInfo, ConversationMessage, ServiceId, ServiceListing,
    ServiceQuery,
};

pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_NOT_FOUND: i32 = -32000;
pub const ERR_FORBIDDEN: i32 = -32001;
pub const ERR_UNAVAILABLE: i32 = -32002;

/// Error reply from a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError {
    pub code: i32,
    pub message: String,
}

impl BusError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for BusError {}

pub type BusResult = Result<BusPayload, BusError>;

/// A conversation handed to a provider when a consumer opens it.
pub struct IncomingConversation {
    pub conversation_id: ConversationId,
    pub listing: ServiceListing,
    pub consumer_id: AgentId,
    /// Messages sent by the consumer.
    pub messages: mpsc::Receiver<ConversationMessage>,
}

/// Typed payloads carried on the bus.
///
/// Some variants carry channel ends, so payloads are in-process only.
pub enum BusPayload {
    // registry
    Announce(ServiceListing),
    Withdraw {
        service_id: ServiceId,
        provider_id: AgentId,
    },
    GetListing {
        service_id: ServiceId,
    },
    Discover(ServiceQuery),
    Listing(ServiceListing),
    Listings(Vec<ServiceListing>),

    // conversations
    AttachProvider {
        provider_id: AgentId,
        inbox: mpsc::Sender<IncomingConversation>,
    },
    DetachProvider {
        provider_id: AgentId,
    },
    OpenConversation {
        service_id: ServiceId,
        consumer_id: AgentId,
    },
    ConversationOpened {
        conversation_id: ConversationId,
        listing: ServiceListing,
        /// Messages sent by the provider.
        messages: mpsc::Receiver<ConversationMessage>,
    },
    Deliver(ConversationMessage),
    ConversationStatus {
        conversation_id: ConversationId,
    },
    ConversationInfo(ConversationInfo),
    Release {
        conversation_id: ConversationId,
        /// The party giving the route up.
        agent_id: AgentId,
    },

    Ack,
}

impl BusPayload {
    pub fn name(&self) -> &'static str {
        match self {
            BusPayload::Announce(_) => "announce",
            BusPayload::Withdraw { .. } => "withdraw",
            BusPayload::GetListing { .. } => "get_listing",
            BusPayload::Discover(_) => "discover",
            BusPayload::Listing(_) => "listing",
            BusPayload::Listings(_) => "listings",
            BusPayload::AttachProvider { .. } => "attach_provider",
            BusPayload::DetachProvider { .. } => "detach_provider",
            BusPayload::OpenConversation { .. } => "open_conversation",
            BusPayload::ConversationOpened { .. } => "conversation_opened",
            BusPayload::Deliver(_) => "deliver",
            BusPayload::ConversationStatus { .. } => "conversation_status",
            BusPayload::ConversationInfo(_) => "conversation_info",
            BusPayload::Release { .. } => "release",
            BusPayload::Ack => "ack",
        }
    }
}

impl fmt::Debug for BusPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusPayload::{}", self.name())
    }
}

/// Messages delivered to the hub loop.
#[derive(Debug)]
pub enum BusMessage {
    Request {
        method: String,
        payload: BusPayload,
        reply_tx: oneshot::Sender<BusResult>,
    },
    Notification {
        method: String,
        payload: BusPayload,
    },
}

/// Call-level transport errors, distinct from handler [`BusError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCallError {
    Send,
    Recv,
    Full,
}

impl fmt::Display for BusCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusCallError::Send => write!(f, "bus send failed: hub is not running"),
            BusCallError::Recv => write!(f, "bus recv failed: hub dropped reply sender"),
            BusCallError::Full => write!(f, "bus queue full"),
        }
    }
}

impl std::error::Error for BusCallError {}

/// Cloneable client-side handle to the hub.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<BusMessage>,
}

impl BusHandle {
    pub fn new(tx: mpsc::Sender<BusMessage>) -> Self {
        Self { tx }
    }

    /// Send a request and await the handler's reply.
    pub async fn request(
        &self,
        method: impl Into<String>,
        payload: BusPayload,
    ) -> Result<BusResult, BusCallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BusMessage::Request {
                method: method.into(),
                payload,
                reply_tx,
            })
            .await
            .map_err(|_| BusCallError::Send)?;

        reply_rx.await.map_err(|_| BusCallError::Recv)
    }

    /// Fire-and-forget; never blocks. Safe to call from `Drop`.
    pub fn notify(&self, method: impl Into<String>, payload: BusPayload) -> Result<(), BusCallError> {
        self.tx
            .try_send(BusMessage::Notification {
                method: method.into(),
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BusCallError::Full,
                mpsc::error::TrySendError::Closed(_) => BusCallError::Send,
            })
    }
}

/// Owns the hub-side receiver.
pub struct MarketBus {
    pub rx: mpsc::Receiver<BusMessage>,
    pub handle: BusHandle,
}

impl MarketBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            rx,
            handle: BusHandle::new(tx),
        }
    }
}
