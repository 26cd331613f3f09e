// Entity subscription lifecycle: consumer-side tracker, provider-side registry

pub mod authorizer;
pub mod registry;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use authorizer::{AllowAll, AllowList, SubscriptionAuthorizer};
pub use registry::{SessionSubscription, SessionUnsubscription, SubscriptionRegistry};
pub use tracker::{EntitySubscription, EntityUnsubscription, SubscriptionTracker};
