//! Listing registry: the `registry/*` hub service.
//!
//! Method grammar:
//! - `registry/announce`  `Announce(listing)`          -> `Ack`
//! - `registry/withdraw`  `Withdraw { .. }`            -> `Ack`
//! - `registry/get`       `GetListing { service_id }`  -> `Listing`
//! - `registry/discover`  `Discover(query)`            -> `Listings`

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::hub::bus::{
    BusError, BusPayload, BusResult, ERR_FORBIDDEN, ERR_INVALID_PARAMS, ERR_METHOD_NOT_FOUND,
    ERR_NOT_FOUND,
};
use crate::hub::dispatch::{BusHandler, action};
use crate::types::{ServiceId, ServiceListing, ServiceQuery};

/// In-memory listing table, shared between the registry service and the
/// conversation router.
#[derive(Default)]
pub struct ListingStore {
    listings: Mutex<HashMap<ServiceId, ServiceListing>>,
}

impl ListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServiceId, ServiceListing>> {
        self.listings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace. Replacing another provider's listing is refused.
    pub fn announce(&self, listing: ServiceListing) -> Result<(), BusError> {
        if listing.name.trim().is_empty() {
            return Err(BusError::new(ERR_INVALID_PARAMS, "listing name must not be empty"));
        }
        if listing.provider_id.is_empty() {
            return Err(BusError::new(ERR_INVALID_PARAMS, "listing has no provider"));
        }

        let mut listings = self.lock();
        if let Some(existing) = listings.get(&listing.id)
            && existing.provider_id != listing.provider_id
        {
            return Err(BusError::new(
                ERR_FORBIDDEN,
                format!("service {} belongs to another provider", listing.id),
            ));
        }
        info!(service_id = %listing.id, provider_id = %listing.provider_id, name = %listing.name, "listing announced");
        listings.insert(listing.id, listing);
        Ok(())
    }

    pub fn withdraw(&self, service_id: &ServiceId, provider_id: &str) -> Result<ServiceListing, BusError> {
        let mut listings = self.lock();
        let owner = listings.get(service_id).map(|l| l.provider_id.clone());
        match owner {
            None => Err(BusError::new(ERR_NOT_FOUND, format!("service not found: {service_id}"))),
            Some(owner) if owner != provider_id => Err(BusError::new(
                ERR_FORBIDDEN,
                format!("service {service_id} belongs to another provider"),
            )),
            Some(_) => {
                info!(%service_id, %provider_id, "listing withdrawn");
                listings
                    .remove(service_id)
                    .ok_or_else(|| BusError::new(ERR_NOT_FOUND, format!("service not found: {service_id}")))
            }
        }
    }

    /// Drop every listing owned by `provider_id`; returns how many were removed.
    pub fn withdraw_provider(&self, provider_id: &str) -> usize {
        let mut listings = self.lock();
        let before = listings.len();
        listings.retain(|_, l| l.provider_id != provider_id);
        before - listings.len()
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<ServiceListing> {
        self.lock().get(service_id).cloned()
    }

    /// Matching listings, cheapest first, then by name and id.
    pub fn discover(&self, query: &ServiceQuery) -> Vec<ServiceListing> {
        let mut found: Vec<ServiceListing> = self
            .lock()
            .values()
            .filter(|l| query.matches(l))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.pricing
                .amount
                .cmp(&b.pricing.amount)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        found
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Hub handler for `registry/*`.
pub struct RegistryService {
    store: Arc<ListingStore>,
}

impl RegistryService {
    pub fn new(store: Arc<ListingStore>) -> Self {
        Self { store }
    }

    fn handle(&self, method: &str, payload: BusPayload) -> BusResult {
        let act = action("registry", method).unwrap_or_default();
        match (act, payload) {
            ("announce", BusPayload::Announce(listing)) => {
                self.store.announce(listing).map(|()| BusPayload::Ack)
            }
            ("withdraw", BusPayload::Withdraw { service_id, provider_id }) => self
                .store
                .withdraw(&service_id, &provider_id)
                .map(|_| BusPayload::Ack),
            ("get", BusPayload::GetListing { service_id }) => self
                .store
                .get(&service_id)
                .map(BusPayload::Listing)
                .ok_or_else(|| BusError::new(ERR_NOT_FOUND, format!("service not found: {service_id}"))),
            ("discover", BusPayload::Discover(query)) => {
                let found = self.store.discover(&query);
                debug!(results = found.len(), "discover");
                Ok(BusPayload::Listings(found))
            }
            ("announce" | "withdraw" | "get" | "discover", other) => Err(BusError::new(
                ERR_INVALID_PARAMS,
                format!("unexpected payload {} for {method}", other.name()),
            )),
            _ => Err(BusError::new(
                ERR_METHOD_NOT_FOUND,
                format!("method not found: {method}"),
            )),
        }
    }
}

impl BusHandler for RegistryService {
    fn prefix(&self) -> &str {
        "registry"
    }

    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>) {
        let _ = reply_tx.send(self.handle(method, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pricing;

    fn listing(provider: &str, name: &str, amount: u64) -> ServiceListing {
        let mut l = ServiceListing::new(name)
            .with_capability("summarize")
            .with_pricing(Pricing::per_request(amount, "credits"));
        l.provider_id = provider.to_string();
        l
    }

    #[test]
    fn announce_get_withdraw() {
        let store = ListingStore::new();
        let l = listing("p1", "Summarizer", 5);
        let id = l.id;

        store.announce(l).unwrap();
        assert_eq!(store.get(&id).unwrap().name, "Summarizer");

        store.withdraw(&id, "p1").unwrap();
        assert!(store.get(&id).is_none());
        let err = store.withdraw(&id, "p1").unwrap_err();
        assert_eq!(err.code, ERR_NOT_FOUND);
    }

    #[test]
    fn reannounce_replaces_own_listing() {
        let store = ListingStore::new();
        let mut l = listing("p1", "Old", 5);
        store.announce(l.clone()).unwrap();
        l.name = "New".into();
        store.announce(l.clone()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&l.id).unwrap().name, "New");
    }

    #[test]
    fn foreign_provider_cannot_replace_or_withdraw() {
        let store = ListingStore::new();
        let l = listing("p1", "Mine", 5);
        store.announce(l.clone()).unwrap();

        let mut hijack = l.clone();
        hijack.provider_id = "p2".into();
        assert_eq!(store.announce(hijack).unwrap_err().code, ERR_FORBIDDEN);
        assert_eq!(store.withdraw(&l.id, "p2").unwrap_err().code, ERR_FORBIDDEN);
        assert!(store.get(&l.id).is_some());
    }

    #[test]
    fn invalid_listings_are_refused() {
        let store = ListingStore::new();
        assert_eq!(store.announce(listing("p1", "  ", 1)).unwrap_err().code, ERR_INVALID_PARAMS);
        assert_eq!(store.announce(listing("", "x", 1)).unwrap_err().code, ERR_INVALID_PARAMS);
        assert!(store.is_empty());
    }

    #[test]
    fn discover_sorts_by_price_then_name_and_limits() {
        let store = ListingStore::new();
        store.announce(listing("p1", "Beta", 10)).unwrap();
        store.announce(listing("p1", "Alpha", 10)).unwrap();
        store.announce(listing("p2", "Cheap", 1)).unwrap();

        let names: Vec<String> = store
            .discover(&ServiceQuery::new())
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["Cheap", "Alpha", "Beta"]);

        let limited = store.discover(&ServiceQuery::new().limit(1));
        assert_eq!(limited.len(), 1);

        let filtered = store.discover(&ServiceQuery::new().provider("p1").max_price(10));
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn withdraw_provider_drops_all_of_theirs() {
        let store = ListingStore::new();
        store.announce(listing("p1", "a", 1)).unwrap();
        store.announce(listing("p1", "b", 1)).unwrap();
        store.announce(listing("p2", "c", 1)).unwrap();
        assert_eq!(store.withdraw_provider("p1"), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn service_routes_methods() {
        let svc = RegistryService::new(Arc::new(ListingStore::new()));
        let l = listing("p1", "x", 1);
        let id = l.id;

        assert!(matches!(svc.handle("registry/announce", BusPayload::Announce(l)), Ok(BusPayload::Ack)));
        assert!(matches!(
            svc.handle("registry/get", BusPayload::GetListing { service_id: id }),
            Ok(BusPayload::Listing(_))
        ));
        let err = svc.handle("registry/get", BusPayload::Ack).unwrap_err();
        assert_eq!(err.code, ERR_INVALID_PARAMS);
        let err = svc.handle("registry/bogus", BusPayload::Ack).unwrap_err();
        assert_eq!(err.code, ERR_METHOD_NOT_FOUND);
    }
}
