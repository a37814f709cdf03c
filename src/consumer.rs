//! Consumer side of the marketplace, and the conversation wrapper both
//! sides use.
//!
//! A [`ConversationWrapper`] owns one end of a conversation: the receiver
//! the router feeds, the local sequence counter, and the negotiation state.
//! Every outgoing message is signed and checked against the state machine
//! before it is handed to the hub; the state only moves once the hub has
//! accepted it. Every incoming message is verified (signature, sender key,
//! peer identity and role, strictly increasing `seq`) before it can move
//! the state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::MarketplaceError;
use crate::hub::bus::{BusHandle, BusPayload};
use crate::identity::{self, Identity};
use crate::transcript::TranscriptStore;
use crate::types::{
    AgentId, ConversationId, ConversationMessage, ConversationState, MessageBody, MessageId,
    MessageKind, Quote, Role, ServiceId, ServiceListing, ServiceQuery,
};

/// Per-agent settings shared by every conversation the agent holds.
#[derive(Clone)]
pub(crate) struct ConversationContext {
    pub identity: Arc<Identity>,
    pub bus: BusHandle,
    pub history_cap: usize,
    pub response_timeout: Duration,
    pub transcript: Option<Arc<TranscriptStore>>,
}

impl ConversationContext {
    pub(crate) fn new(
        identity: Arc<Identity>,
        bus: BusHandle,
        config: &Config,
        response_timeout: Duration,
    ) -> Self {
        let transcript = config.conversation.persist_transcripts.then(|| {
            Arc::new(TranscriptStore::new(
                config.transcripts_dir(),
                config.conversation.transcript_cap,
            ))
        });
        Self {
            identity,
            bus,
            history_cap: config.conversation.history_cap.max(1),
            response_timeout,
            transcript,
        }
    }

    /// Send `method` and unwrap both the transport and the handler result.
    pub(crate) async fn call(
        &self,
        method: &str,
        payload: BusPayload,
    ) -> Result<BusPayload, MarketplaceError> {
        Ok(self.bus.request(method, payload).await??)
    }
}

// ── ConversationWrapper ──────────────────────────────────────────────────────

/// One party's end of a conversation.
pub struct ConversationWrapper {
    id: ConversationId,
    service: ServiceListing,
    role: Role,
    peer_id: AgentId,
    ctx: ConversationContext,
    inbox: mpsc::Receiver<ConversationMessage>,
    state: ConversationState,
    seq: u64,
    peer_seq: u64,
    history: VecDeque<ConversationMessage>,
    last_quote: Option<Quote>,
}

impl std::fmt::Debug for ConversationWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationWrapper")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl ConversationWrapper {
    pub(crate) fn new(
        ctx: ConversationContext,
        id: ConversationId,
        service: ServiceListing,
        role: Role,
        peer_id: AgentId,
        inbox: mpsc::Receiver<ConversationMessage>,
    ) -> Self {
        Self {
            id,
            service,
            role,
            peer_id,
            ctx,
            inbox,
            state: ConversationState::Open,
            seq: 0,
            peer_seq: 0,
            history: VecDeque::new(),
            last_quote: None,
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_id(&self) -> &str {
        &self.ctx.identity.agent_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn service(&self) -> &ServiceListing {
        &self.service
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Messages sent and received, oldest first, capped at `history_cap`.
    pub fn history(&self) -> &VecDeque<ConversationMessage> {
        &self.history
    }

    /// The most recent quote offered in this conversation.
    pub fn last_quote(&self) -> Option<&Quote> {
        self.last_quote.as_ref()
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), MarketplaceError> {
        self.send(MessageBody::Text { text: text.into() }).await
    }

    pub async fn offer(&mut self, quote: Quote) -> Result<(), MarketplaceError> {
        self.send(MessageBody::Offer { quote }).await
    }

    /// Accept the outstanding quote. Fails with `QuoteRejected` and sends
    /// nothing if that quote has expired.
    pub async fn accept(&mut self) -> Result<(), MarketplaceError> {
        if let Some(quote) = &self.last_quote
            && quote.is_expired(Utc::now())
        {
            return Err(MarketplaceError::QuoteRejected("quote has expired".into()));
        }
        self.send(MessageBody::Accept).await
    }

    pub async fn reject(&mut self, reason: impl Into<String>) -> Result<(), MarketplaceError> {
        self.send(MessageBody::Reject { reason: reason.into() }).await
    }

    pub async fn deliver(&mut self, payload: Value) -> Result<(), MarketplaceError> {
        self.send(MessageBody::Result { payload }).await
    }

    /// Close the conversation. Closing twice is a no-op, and a route the
    /// router has already torn down counts as closed.
    pub async fn close(&mut self, reason: Option<String>) -> Result<(), MarketplaceError> {
        if self.is_closed() {
            return Ok(());
        }
        match self.send(MessageBody::Close { reason }).await {
            Ok(()) => Ok(()),
            Err(MarketplaceError::NotFound(_) | MarketplaceError::Unavailable(_)) => {
                debug!(conversation_id = %self.id, "route already gone, closing locally");
                self.state = ConversationState::Closed;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send(&mut self, body: MessageBody) -> Result<(), MarketplaceError> {
        let kind = body.kind();
        if self.is_closed() {
            return Err(MarketplaceError::ConversationClosed(format!(
                "cannot send {kind} on {}",
                self.id
            )));
        }
        if !body.allowed_for(self.role) {
            return Err(MarketplaceError::Forbidden(format!(
                "a {} may not send {kind}",
                self.role
            )));
        }
        let next = self
            .state
            .next(&body)
            .ok_or_else(|| MarketplaceError::InvalidTransition {
                state: self.state,
                message: format!("cannot send {kind}"),
            })?;

        let identity = &self.ctx.identity;
        let mut message = ConversationMessage {
            id: MessageId::new(),
            conversation_id: self.id,
            sender: identity.agent_id.clone(),
            role: self.role,
            seq: self.seq + 1,
            body,
            sent_at: Utc::now(),
            sender_key: identity.verifying_key_hex(),
            signature: String::new(),
        };
        message.signature = identity.sign(&message.signing_bytes()?);

        self.ctx
            .call("conversations/send", BusPayload::Deliver(message.clone()))
            .await?;

        self.seq = message.seq;
        self.state = next;
        if let MessageBody::Offer { quote } = &message.body {
            self.last_quote = Some(quote.clone());
        }
        debug!(conversation_id = %self.id, %kind, seq = self.seq, state = ?self.state, "sent");
        self.record(message).await;
        Ok(())
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Next verified message from the peer.
    ///
    /// `Ok(None)` once the route is gone. `Timeout` if nothing arrives
    /// within the response timeout. A message that fails verification or
    /// is invalid for the current state is consumed and returned as an
    /// error; the state is left unchanged.
    pub async fn recv(&mut self) -> Result<Option<ConversationMessage>, MarketplaceError> {
        if self.is_closed() {
            return Ok(None);
        }
        let message = match timeout(self.ctx.response_timeout, self.inbox.recv()).await {
            Err(_) => {
                return Err(MarketplaceError::Timeout(format!(
                    "no message from {} within {:?}",
                    self.peer_id, self.ctx.response_timeout
                )));
            }
            Ok(None) => {
                debug!(conversation_id = %self.id, "peer channel closed");
                self.state = ConversationState::Closed;
                return Ok(None);
            }
            Ok(Some(message)) => message,
        };

        self.verify(&message)?;
        let next = self
            .state
            .next(&message.body)
            .ok_or_else(|| MarketplaceError::InvalidTransition {
                state: self.state,
                message: format!("peer sent {}", message.body.kind()),
            })?;

        self.peer_seq = message.seq;
        self.state = next;
        if let MessageBody::Offer { quote } = &message.body {
            self.last_quote = Some(quote.clone());
        }
        debug!(
            conversation_id = %self.id,
            kind = %message.body.kind(),
            seq = message.seq,
            state = ?self.state,
            "received"
        );
        self.record(message.clone()).await;
        Ok(Some(message))
    }

    /// Receive until a message of `kind` arrives, skipping others. A `Close`
    /// from the peer, or the route going away, ends with `ConversationClosed`.
    pub async fn recv_until(&mut self, kind: MessageKind) -> Result<ConversationMessage, MarketplaceError> {
        loop {
            match self.recv().await? {
                Some(message) if message.body.kind() == kind => return Ok(message),
                Some(ConversationMessage {
                    body: MessageBody::Close { reason },
                    ..
                }) => {
                    return Err(MarketplaceError::ConversationClosed(
                        reason.unwrap_or_else(|| "closed by peer".into()),
                    ));
                }
                Some(_) => continue,
                None => {
                    return Err(MarketplaceError::ConversationClosed(format!(
                        "{} ended while waiting for {kind}",
                        self.id
                    )));
                }
            }
        }
    }

    fn verify(&self, message: &ConversationMessage) -> Result<(), MarketplaceError> {
        if message.conversation_id != self.id {
            return Err(MarketplaceError::Forbidden(format!(
                "message for {} delivered to {}",
                message.conversation_id, self.id
            )));
        }
        identity::verify(
            &message.sender,
            &message.sender_key,
            &message.signing_bytes()?,
            &message.signature,
        )?;
        if message.sender != self.peer_id || message.role != self.role.peer() {
            return Err(MarketplaceError::Forbidden(format!(
                "{} is not the {} of {}",
                message.sender,
                self.role.peer(),
                self.id
            )));
        }
        if !message.body.allowed_for(message.role) {
            return Err(MarketplaceError::Forbidden(format!(
                "a {} may not send {}",
                message.role,
                message.body.kind()
            )));
        }
        if message.seq <= self.peer_seq {
            return Err(MarketplaceError::Signature(format!(
                "stale seq {} (last accepted {})",
                message.seq, self.peer_seq
            )));
        }
        Ok(())
    }

    async fn record(&mut self, message: ConversationMessage) {
        if let Some(store) = &self.ctx.transcript {
            let owner = self.ctx.identity.agent_id.clone();
            Arc::clone(store).append_async(owner, message.clone()).await;
        }
        self.history.push_back(message);
        while self.history.len() > self.ctx.history_cap {
            self.history.pop_front();
        }
    }
}

impl Drop for ConversationWrapper {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        let payload = BusPayload::Release {
            conversation_id: self.id,
            agent_id: self.ctx.identity.agent_id.clone(),
        };
        if let Err(e) = self.ctx.bus.notify("conversations/release", payload) {
            debug!(conversation_id = %self.id, "release not delivered: {e}");
        }
    }
}

// ── MarketplaceConsumer ──────────────────────────────────────────────────────

/// Discovers services and opens conversations with their providers.
pub struct MarketplaceConsumer {
    ctx: ConversationContext,
    max_auto_accept_price: Option<u64>,
}

impl MarketplaceConsumer {
    pub fn new(identity: Arc<Identity>, bus: BusHandle, config: &Config) -> Self {
        let ctx = ConversationContext::new(identity, bus, config, config.consumer.response_timeout);
        Self {
            ctx,
            max_auto_accept_price: config.consumer.max_auto_accept_price,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.ctx.identity.agent_id
    }

    pub async fn discover(&self, query: ServiceQuery) -> Result<Vec<ServiceListing>, MarketplaceError> {
        match self.ctx.call("registry/discover", BusPayload::Discover(query)).await? {
            BusPayload::Listings(listings) => Ok(listings),
            other => Err(unexpected("registry/discover", &other)),
        }
    }

    pub async fn get_service(&self, service_id: ServiceId) -> Result<ServiceListing, MarketplaceError> {
        match self
            .ctx
            .call("registry/get", BusPayload::GetListing { service_id })
            .await?
        {
            BusPayload::Listing(listing) => Ok(listing),
            other => Err(unexpected("registry/get", &other)),
        }
    }

    pub async fn open_conversation(&self, service_id: ServiceId) -> Result<ConversationWrapper, MarketplaceError> {
        let payload = BusPayload::OpenConversation {
            service_id,
            consumer_id: self.agent_id().to_string(),
        };
        match self.ctx.call("conversations/open", payload).await? {
            BusPayload::ConversationOpened {
                conversation_id,
                listing,
                messages,
            } => {
                info!(%conversation_id, %service_id, provider_id = %listing.provider_id, "conversation opened");
                let provider_id = listing.provider_id.clone();
                Ok(ConversationWrapper::new(
                    self.ctx.clone(),
                    conversation_id,
                    listing,
                    Role::Consumer,
                    provider_id,
                    messages,
                ))
            }
            other => Err(unexpected("conversations/open", &other)),
        }
    }

    /// Run a whole request against `service_id`: send `input`, wait for the
    /// quote, accept it if affordable, wait for the result, close.
    ///
    /// A quote above `max_auto_accept_price`, or one that has already
    /// expired, is rejected and the call returns `QuoteRejected`.
    pub async fn request(&self, service_id: ServiceId, input: impl Into<String>) -> Result<Value, MarketplaceError> {
        let mut conversation = self.open_conversation(service_id).await?;
        conversation.send_text(input).await?;

        let offer = conversation.recv_until(MessageKind::Offer).await?;
        let MessageBody::Offer { quote } = offer.body else {
            return Err(MarketplaceError::InvalidState("offer without a quote".into()));
        };

        let refusal = match self.max_auto_accept_price {
            Some(max) if quote.amount > max => Some(format!(
                "price {} {} exceeds limit {max}",
                quote.amount, quote.currency
            )),
            _ if quote.is_expired(Utc::now()) => Some("quote has expired".to_string()),
            _ => None,
        };
        if let Some(reason) = refusal {
            warn!(conversation_id = %conversation.id(), %reason, "declining quote");
            conversation.reject(reason.clone()).await?;
            conversation.close(Some("quote rejected".into())).await?;
            return Err(MarketplaceError::QuoteRejected(reason));
        }

        conversation.accept().await?;
        let result = conversation.recv_until(MessageKind::Result).await?;
        conversation.close(None).await?;

        match result.body {
            MessageBody::Result { payload } => Ok(payload),
            _ => Err(MarketplaceError::InvalidState("result without a payload".into())),
        }
    }
}

pub(crate) fn unexpected(method: &str, payload: &BusPayload) -> MarketplaceError {
    MarketplaceError::Bus(format!("unexpected reply {} to {method}", payload.name()))
}
