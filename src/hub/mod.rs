//! Hub: owns the event bus and routes messages to marketplace services.

pub mod bus;
pub mod dispatch;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::services::conversations::ConversationRouter;
use crate::services::registry::{ListingStore, RegistryService};
use bus::{BusError, BusHandle, BusMessage, ERR_METHOD_NOT_FOUND, MarketBus};
use dispatch::BusHandler;

/// Run the hub message loop until `shutdown` is cancelled or every
/// [`BusHandle`] is dropped.
///
/// The hub is a pure router: it reads each message, picks the handler by the
/// first `/`-delimited method segment, and hands off ownership of `reply_tx`.
///
/// # Panics
///
/// Panics on startup if two handlers share the same prefix.
pub async fn run(mut bus: MarketBus, shutdown: CancellationToken, handlers: Vec<Box<dyn BusHandler>>) {
    let mut table: HashMap<String, Box<dyn BusHandler>> = HashMap::new();
    for h in handlers {
        let prefix = h.prefix().to_string();
        if table.insert(prefix.clone(), h).is_some() {
            panic!("duplicate BusHandler prefix registered: {prefix:?}");
        }
    }

    // The hub keeps no sender of its own so it stops once all clients are gone.
    drop(bus.handle);

    info!(handlers = ?table.keys().collect::<Vec<_>>(), "hub ready");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("hub shutting down");
                break;
            }

            msg = bus.rx.recv() => {
                match msg {
                    Some(BusMessage::Request { method, payload, reply_tx }) => {
                        let prefix = method.split('/').next().unwrap_or_default();
                        match table.get(prefix) {
                            Some(handler) => {
                                debug!(%method, payload = payload.name(), "routing request");
                                handler.handle_request(&method, payload, reply_tx);
                            }
                            None => {
                                warn!(%method, "unhandled request method");
                                let _ = reply_tx.send(Err(BusError::new(
                                    ERR_METHOD_NOT_FOUND,
                                    format!("method not found: {method}"),
                                )));
                            }
                        }
                    }
                    Some(BusMessage::Notification { method, payload }) => {
                        let prefix = method.split('/').next().unwrap_or_default();
                        match table.get(prefix) {
                            Some(handler) => {
                                debug!(%method, "routing notification");
                                handler.handle_notification(&method, payload);
                            }
                            None => debug!(%method, "unhandled notification"),
                        }
                    }
                    None => {
                        info!("bus closed, hub exiting");
                        break;
                    }
                }
            }
        }
    }
}

/// A running in-process marketplace: listing registry plus conversation router.
pub struct MarketHub {
    handle: BusHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl MarketHub {
    /// Build the standard services and spawn the hub loop on the current
    /// Tokio runtime.
    pub fn spawn(config: &HubConfig) -> Self {
        let bus = MarketBus::new(config.bus_buffer);
        let handle = bus.handle.clone();
        let shutdown = CancellationToken::new();

        let store = Arc::new(ListingStore::new());
        let handlers: Vec<Box<dyn BusHandler>> = vec![
            Box::new(RegistryService::new(Arc::clone(&store))),
            Box::new(ConversationRouter::new(
                store,
                config.conversation_buffer,
            )),
        ];

        let task = tokio::spawn(run(bus, shutdown.clone(), handlers));
        Self { handle, shutdown, task }
    }

    /// Client handle for providers and consumers.
    pub fn bus(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Token cancelled by [`MarketHub::shutdown`]; useful for tying provider
    /// `serve` loops to the hub's lifetime.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the hub loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("hub task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus::{BusPayload, BusResult};
    use tokio::sync::oneshot;

    struct Echo;

    impl BusHandler for Echo {
        fn prefix(&self) -> &str {
            "echo"
        }

        fn handle_request(&self, _method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
            let _ = reply_tx.send(Ok(payload));
        }
    }

    #[tokio::test]
    async fn routes_by_prefix() {
        let bus = MarketBus::new(4);
        let handle = bus.handle.clone();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(bus, shutdown.clone(), vec![Box::new(Echo)]));

        let reply = handle.request("echo/anything", BusPayload::Ack).await.unwrap();
        assert!(matches!(reply, Ok(BusPayload::Ack)));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_prefix_replies_method_not_found() {
        let bus = MarketBus::new(4);
        let handle = bus.handle.clone();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(bus, shutdown.clone(), vec![Box::new(Echo)]));

        let reply = handle.request("nope/x", BusPayload::Ack).await.unwrap();
        match reply {
            Err(e) => assert_eq!(e.code, ERR_METHOD_NOT_FOUND),
            Ok(p) => panic!("unexpected reply: {p:?}"),
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn exits_when_all_handles_dropped() {
        let bus = MarketBus::new(4);
        let handle = bus.handle.clone();
        let task = tokio::spawn(run(bus, CancellationToken::new(), vec![Box::new(Echo)]));
        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "duplicate BusHandler prefix")]
    async fn duplicate_prefix_panics() {
        let bus = MarketBus::new(4);
        run(bus, CancellationToken::new(), vec![Box::new(Echo), Box::new(Echo)]).await;
    }

    #[tokio::test]
    async fn spawned_hub_serves_registry() {
        let hub = MarketHub::spawn(&HubConfig::default());
        let reply = hub
            .bus()
            .request("registry/discover", BusPayload::Discover(Default::default()))
            .await
            .unwrap();
        assert!(matches!(reply, Ok(BusPayload::Listings(v)) if v.is_empty()));
        hub.shutdown().await;
    }
}
