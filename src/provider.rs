//! Provider side of the marketplace.
//!
//! A [`MarketplaceProvider`] announces listings to the registry and
//! attaches an inbox to the conversation router. Conversations can be
//! taken one at a time with [`MarketplaceProvider::accept_next`], or handed
//! to a [`ServiceHandler`] by [`MarketplaceProvider::serve`], which runs
//! the quote / accept / result flow for each conversation on its own task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ProviderConfig};
use crate::consumer::{ConversationContext, ConversationWrapper};
use crate::error::MarketplaceError;
use crate::hub::bus::{BusHandle, BusPayload, IncomingConversation};
use crate::identity::Identity;
use crate::types::{
    AgentId, ConversationId, ConversationState, MessageBody, Quote, Role, ServiceId, ServiceListing,
};

// ── ServiceHandler ───────────────────────────────────────────────────────────

/// What a handler gets once the consumer has accepted the quote.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub conversation_id: ConversationId,
    pub service: ServiceListing,
    pub consumer_id: AgentId,
    /// Text the consumer sent before accepting, in order.
    pub inputs: Vec<String>,
}

/// A boxed, owned future returned by [`ServiceHandler::handle`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, MarketplaceError>> + Send + 'static>>;

/// Produces the result payload for an accepted request.
///
/// Any `Fn(ServiceRequest) -> impl Future<Output = Result<Value, _>>`
/// closure is a handler.
pub trait ServiceHandler: Send + Sync {
    fn handle(&self, request: ServiceRequest) -> HandlerFuture;
}

impl<F, Fut> ServiceHandler for F
where
    F: Fn(ServiceRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, MarketplaceError>> + Send + 'static,
{
    fn handle(&self, request: ServiceRequest) -> HandlerFuture {
        Box::pin(self(request))
    }
}

// ── MarketplaceProvider ──────────────────────────────────────────────────────

pub struct MarketplaceProvider {
    ctx: ConversationContext,
    config: ProviderConfig,
    inbox_buffer: usize,
    services: Mutex<HashMap<ServiceId, ServiceListing>>,
    inbox: tokio::sync::Mutex<Option<mpsc::Receiver<IncomingConversation>>>,
    started: AtomicBool,
}

impl MarketplaceProvider {
    pub fn new(identity: Arc<Identity>, bus: BusHandle, config: &Config) -> Self {
        Self {
            ctx: ConversationContext::new(identity, bus, config, config.provider.idle_timeout),
            config: config.provider.clone(),
            inbox_buffer: config.hub.inbox_buffer,
            services: Mutex::new(HashMap::new()),
            inbox: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.ctx.identity.agent_id
    }

    fn services_lock(&self) -> MutexGuard<'_, HashMap<ServiceId, ServiceListing>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach this provider's inbox to the conversation router.
    pub async fn start(&self) -> Result<(), MarketplaceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MarketplaceError::InvalidState("provider already started".into()));
        }
        let (tx, rx) = mpsc::channel(self.inbox_buffer);
        let payload = BusPayload::AttachProvider {
            provider_id: self.agent_id().to_string(),
            inbox: tx,
        };
        if let Err(e) = self.ctx.call("conversations/attach", payload).await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        *self.inbox.lock().await = Some(rx);
        info!(provider_id = %self.agent_id(), "provider started");
        Ok(())
    }

    /// Detach from the router. The router withdraws every listing and closes
    /// every live conversation of this provider.
    pub async fn stop(&self) -> Result<(), MarketplaceError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let payload = BusPayload::DetachProvider {
            provider_id: self.agent_id().to_string(),
        };
        self.ctx.call("conversations/detach", payload).await?;
        self.inbox.lock().await.take();
        self.services_lock().clear();
        info!(provider_id = %self.agent_id(), "provider stopped");
        Ok(())
    }

    /// Announce `listing` under this provider's id and return it as stored.
    pub async fn register_service(&self, mut listing: ServiceListing) -> Result<ServiceListing, MarketplaceError> {
        listing.provider_id = self.agent_id().to_string();
        self.ctx
            .call("registry/announce", BusPayload::Announce(listing.clone()))
            .await?;
        info!(service_id = %listing.id, name = %listing.name, "service registered");
        self.services_lock().insert(listing.id, listing.clone());
        Ok(listing)
    }

    pub async fn withdraw_service(&self, service_id: ServiceId) -> Result<(), MarketplaceError> {
        let payload = BusPayload::Withdraw {
            service_id,
            provider_id: self.agent_id().to_string(),
        };
        self.ctx.call("registry/withdraw", payload).await?;
        self.services_lock().remove(&service_id);
        info!(%service_id, "service withdrawn");
        Ok(())
    }

    /// Listings registered through this provider, oldest first.
    pub fn services(&self) -> Vec<ServiceListing> {
        let mut listings: Vec<ServiceListing> = self.services_lock().values().cloned().collect();
        listings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        listings
    }

    /// Wait for the next conversation a consumer opens. `Ok(None)` once the
    /// inbox is closed.
    pub async fn accept_next(&self) -> Result<Option<ConversationWrapper>, MarketplaceError> {
        let mut inbox = self.inbox.lock().await;
        let rx = inbox
            .as_mut()
            .ok_or_else(|| MarketplaceError::InvalidState("provider not started".into()))?;
        let Some(incoming) = rx.recv().await else {
            return Ok(None);
        };
        debug!(
            conversation_id = %incoming.conversation_id,
            consumer_id = %incoming.consumer_id,
            "conversation accepted"
        );
        Ok(Some(ConversationWrapper::new(
            self.ctx.clone(),
            incoming.conversation_id,
            incoming.listing,
            Role::Provider,
            incoming.consumer_id,
            incoming.messages,
        )))
    }

    /// Serve conversations with `handler` until `shutdown` is cancelled or
    /// the inbox closes. At most `max_concurrent_conversations` run at once;
    /// on return, including an error return, every spawned conversation
    /// task has finished.
    pub async fn serve<H>(self: Arc<Self>, handler: Arc<H>, shutdown: CancellationToken) -> Result<(), MarketplaceError>
    where
        H: ServiceHandler + 'static,
    {
        let max = self.config.max_concurrent_conversations.max(1);
        let limit = Arc::new(Semaphore::new(max));
        info!(provider_id = %self.agent_id(), max_concurrent = max, "provider serving");

        let outcome = loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                permit = Arc::clone(&limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break Err(MarketplaceError::InvalidState(format!("conversation limit: {e}"))),
                },
            };

            let conversation = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = self.accept_next() => match next {
                    Ok(Some(conversation)) => conversation,
                    Ok(None) => {
                        info!("provider inbox closed");
                        break Ok(());
                    }
                    Err(e) => {
                        warn!(provider_id = %self.agent_id(), "cannot accept conversations: {e}");
                        break Err(e);
                    }
                },
            };

            let provider = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let token = shutdown.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                let conversation_id = conversation.id();
                if let Err(e) = provider.run_conversation(conversation, handler.as_ref(), token).await {
                    warn!(%conversation_id, "conversation ended with error: {e}");
                }
            });
        };

        let all = u32::try_from(max).unwrap_or(u32::MAX);
        if let Ok(drained) = limit.acquire_many(all).await {
            drop(drained);
        }
        info!(provider_id = %self.agent_id(), "provider stopped serving");
        outcome
    }

    async fn run_conversation<H>(
        &self,
        mut conversation: ConversationWrapper,
        handler: &H,
        shutdown: CancellationToken,
    ) -> Result<(), MarketplaceError>
    where
        H: ServiceHandler + ?Sized,
    {
        let quote = Quote::from_pricing(&conversation.service().pricing);
        let mut quoted = false;
        let mut inputs = Vec::new();

        if self.config.auto_quote {
            conversation.offer(quote.clone()).await?;
            quoted = true;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return conversation.close(Some("provider shutting down".into())).await;
                }
                next = conversation.recv() => next,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(MarketplaceError::Timeout(_)) => {
                    info!(conversation_id = %conversation.id(), "closing idle conversation");
                    return conversation.close(Some("idle timeout".into())).await;
                }
                Err(e) => {
                    warn!(conversation_id = %conversation.id(), "dropping message: {e}");
                    continue;
                }
            };

            match message.body {
                MessageBody::Text { text } => {
                    inputs.push(text);
                    if !quoted && conversation.state() == ConversationState::Open {
                        conversation.offer(quote.clone()).await?;
                        quoted = true;
                    }
                }
                MessageBody::Accept => {
                    let request = ServiceRequest {
                        conversation_id: conversation.id(),
                        service: conversation.service().clone(),
                        consumer_id: conversation.peer_id().to_string(),
                        inputs: std::mem::take(&mut inputs),
                    };
                    match handler.handle(request).await {
                        Ok(payload) => conversation.deliver(payload).await?,
                        Err(e) => {
                            warn!(conversation_id = %conversation.id(), "handler failed: {e}");
                            return conversation.close(Some(e.to_string())).await;
                        }
                    }
                }
                MessageBody::Reject { reason } => {
                    debug!(conversation_id = %conversation.id(), %reason, "quote rejected");
                }
                MessageBody::Close { .. } => return Ok(()),
                MessageBody::Offer { .. } | MessageBody::Result { .. } => {}
            }
        }
    }
}

impl std::fmt::Debug for MarketplaceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketplaceProvider")
            .field("agent_id", &self.agent_id())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
