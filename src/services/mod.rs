//! Hub-side marketplace services, one [`crate::hub::dispatch::BusHandler`] each.

pub mod conversations;
pub mod registry;
