//! Conversation router: the `conversations/*` hub service.
//!
//! Method grammar:
//! - `conversations/attach`   `AttachProvider { .. }`      -> `Ack`
//! - `conversations/detach`   `DetachProvider { .. }`      -> `Ack`
//! - `conversations/open`     `OpenConversation { .. }`    -> `ConversationOpened`
//! - `conversations/send`     `Deliver(message)`           -> `Ack`
//! - `conversations/status`   `ConversationStatus { .. }`  -> `ConversationInfo`
//! - `conversations/release`  notification, drops a route if the releasing
//!   agent is one of its parties
//!
//! Each open conversation is a [`Route`] holding the sending half of one
//! bounded channel per direction. Removing a route drops both senders, so
//! each party's receiver drains what is buffered and then yields `None`.
//!
//! The router checks that a message's sender is the party its role claims,
//! but does not verify signatures; the receiving wrapper does that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::hub::bus::{
    BusError, BusPayload, BusResult, ERR_FORBIDDEN, ERR_INVALID_PARAMS, ERR_METHOD_NOT_FOUND,
    ERR_NOT_FOUND, ERR_UNAVAILABLE, IncomingConversation,
};
use crate::hub::dispatch::{BusHandler, action};
use crate::services::registry::ListingStore;
use crate::types::{
    AgentId, ConversationId, ConversationInfo, ConversationMessage, MessageKind, Role, ServiceId,
};

struct Route {
    service_id: ServiceId,
    consumer_id: AgentId,
    provider_id: AgentId,
    to_consumer: mpsc::Sender<ConversationMessage>,
    to_provider: mpsc::Sender<ConversationMessage>,
    messages_relayed: u64,
    opened_at: DateTime<Utc>,
}

impl Route {
    fn info(&self, id: ConversationId) -> ConversationInfo {
        ConversationInfo {
            id,
            service_id: self.service_id,
            consumer_id: self.consumer_id.clone(),
            provider_id: self.provider_id.clone(),
            messages_relayed: self.messages_relayed,
            opened_at: self.opened_at,
        }
    }
}

pub struct ConversationRouter {
    listings: Arc<ListingStore>,
    buffer: usize,
    inboxes: Mutex<HashMap<AgentId, mpsc::Sender<IncomingConversation>>>,
    routes: Mutex<HashMap<ConversationId, Route>>,
}

impl ConversationRouter {
    pub fn new(listings: Arc<ListingStore>, buffer: usize) -> Self {
        Self {
            listings,
            buffer,
            inboxes: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
        }
    }

    fn inboxes(&self) -> MutexGuard<'_, HashMap<AgentId, mpsc::Sender<IncomingConversation>>> {
        self.inboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<ConversationId, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn live_conversations(&self) -> usize {
        self.routes().len()
    }

    fn attach(&self, provider_id: AgentId, inbox: mpsc::Sender<IncomingConversation>) -> BusResult {
        if provider_id.is_empty() {
            return Err(BusError::new(ERR_INVALID_PARAMS, "provider id must not be empty"));
        }
        info!(%provider_id, "provider attached");
        self.inboxes().insert(provider_id, inbox);
        Ok(BusPayload::Ack)
    }

    fn detach(&self, provider_id: &str) -> BusResult {
        self.inboxes().remove(provider_id);
        let withdrawn = self.listings.withdraw_provider(provider_id);

        let mut routes = self.routes();
        let before = routes.len();
        routes.retain(|_, r| r.provider_id != provider_id);
        info!(
            %provider_id,
            withdrawn,
            closed = before - routes.len(),
            "provider detached"
        );
        Ok(BusPayload::Ack)
    }

    fn open(&self, service_id: ServiceId, consumer_id: AgentId) -> BusResult {
        let listing = self
            .listings
            .get(&service_id)
            .ok_or_else(|| BusError::new(ERR_NOT_FOUND, format!("service not found: {service_id}")))?;

        if listing.provider_id == consumer_id {
            return Err(BusError::new(
                ERR_INVALID_PARAMS,
                "a provider cannot open a conversation with itself",
            ));
        }

        let inbox = self
            .inboxes()
            .get(&listing.provider_id)
            .cloned()
            .ok_or_else(|| {
                BusError::new(
                    ERR_UNAVAILABLE,
                    format!("provider {} is not accepting conversations", listing.provider_id),
                )
            })?;

        let conversation_id = ConversationId::new();
        let (to_provider, provider_rx) = mpsc::channel(self.buffer);
        let (to_consumer, consumer_rx) = mpsc::channel(self.buffer);

        let incoming = IncomingConversation {
            conversation_id,
            listing: listing.clone(),
            consumer_id: consumer_id.clone(),
            messages: provider_rx,
        };

        if let Err(e) = inbox.try_send(incoming) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "inbox full",
                mpsc::error::TrySendError::Closed(_) => {
                    self.inboxes().remove(&listing.provider_id);
                    "provider has stopped"
                }
            };
            warn!(provider_id = %listing.provider_id, reason, "cannot hand off conversation");
            return Err(BusError::new(
                ERR_UNAVAILABLE,
                format!("provider {} unavailable: {reason}", listing.provider_id),
            ));
        }

        info!(
            %conversation_id,
            %service_id,
            %consumer_id,
            provider_id = %listing.provider_id,
            "conversation opened"
        );
        self.routes().insert(
            conversation_id,
            Route {
                service_id,
                consumer_id,
                provider_id: listing.provider_id.clone(),
                to_consumer,
                to_provider,
                messages_relayed: 0,
                opened_at: Utc::now(),
            },
        );

        Ok(BusPayload::ConversationOpened {
            conversation_id,
            listing,
            messages: consumer_rx,
        })
    }

    fn send(&self, message: ConversationMessage) -> BusResult {
        let conversation_id = message.conversation_id;
        let mut routes = self.routes();
        let route = routes.get_mut(&conversation_id).ok_or_else(|| {
            BusError::new(ERR_NOT_FOUND, format!("conversation not found: {conversation_id}"))
        })?;

        let (party, target) = match message.role {
            Role::Consumer => (&route.consumer_id, &route.to_provider),
            Role::Provider => (&route.provider_id, &route.to_consumer),
        };
        if *party != message.sender {
            return Err(BusError::new(
                ERR_FORBIDDEN,
                format!("{} is not the {} of {conversation_id}", message.sender, message.role),
            ));
        }

        let kind = message.body.kind();
        match target.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(BusError::new(ERR_UNAVAILABLE, "peer is not keeping up"));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                routes.remove(&conversation_id);
                return Err(BusError::new(ERR_UNAVAILABLE, "peer has left the conversation"));
            }
        }
        route.messages_relayed += 1;
        debug!(%conversation_id, %kind, relayed = route.messages_relayed, "message relayed");

        if kind == MessageKind::Close {
            routes.remove(&conversation_id);
            info!(%conversation_id, "conversation closed");
        }
        Ok(BusPayload::Ack)
    }

    fn status(&self, conversation_id: ConversationId) -> BusResult {
        self.routes()
            .get(&conversation_id)
            .map(|r| BusPayload::ConversationInfo(r.info(conversation_id)))
            .ok_or_else(|| {
                BusError::new(ERR_NOT_FOUND, format!("conversation not found: {conversation_id}"))
            })
    }

    fn handle(&self, method: &str, payload: BusPayload) -> BusResult {
        let act = action("conversations", method).unwrap_or_default();
        match (act, payload) {
            ("attach", BusPayload::AttachProvider { provider_id, inbox }) => {
                self.attach(provider_id, inbox)
            }
            ("detach", BusPayload::DetachProvider { provider_id }) => self.detach(&provider_id),
            ("open", BusPayload::OpenConversation { service_id, consumer_id }) => {
                self.open(service_id, consumer_id)
            }
            ("send", BusPayload::Deliver(message)) => self.send(message),
            ("status", BusPayload::ConversationStatus { conversation_id }) => {
                self.status(conversation_id)
            }
            ("attach" | "detach" | "open" | "send" | "status", other) => Err(BusError::new(
                ERR_INVALID_PARAMS,
                format!("unexpected payload {} for {method}", other.name()),
            )),
            _ => Err(BusError::new(
                ERR_METHOD_NOT_FOUND,
                format!("method not found: {method}"),
            )),
        }
    }

    /// Drop a route on behalf of `agent_id`. Only the route's consumer or
    /// provider may release it; anyone else is ignored.
    pub fn release(&self, conversation_id: ConversationId, agent_id: &str) -> bool {
        let mut routes = self.routes();
        let is_party = match routes.get(&conversation_id) {
            Some(route) => route.consumer_id == agent_id || route.provider_id == agent_id,
            None => return false,
        };
        if !is_party {
            warn!(%conversation_id, %agent_id, "release from a non-party ignored");
            return false;
        }
        routes.remove(&conversation_id);
        debug!(%conversation_id, %agent_id, "conversation released");
        true
    }
}

impl BusHandler for ConversationRouter {
    fn prefix(&self) -> &str {
        "conversations"
    }

    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
        let _ = reply_tx.send(self.handle(method, payload));
    }

    fn handle_notification(&self, method: &str, payload: BusPayload) {
        if let (Some("release"), BusPayload::Release { conversation_id, agent_id }) =
            (action("conversations", method), payload)
        {
            self.release(conversation_id, &agent_id);
        }
    }
}
