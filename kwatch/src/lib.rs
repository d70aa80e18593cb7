/*
 * kwatch - a level-triggered controller core: notifications from a
 * watched cache are turned into keys, deduplicated and rate limited in
 * an event queue, and drained by a pool of reconcile workers.
 */

pub mod cli;
pub mod controller;
pub mod errors;
pub mod item;
pub mod key;
pub mod queue;
pub mod ratelimit;
pub mod reconcile;
pub mod source;

pub use controller::Controller;
pub use controller::ControllerConfig;
pub use errors::Error;
pub use item::Action;
pub use item::WorkItem;
pub use key::ObjectKey;
pub use queue::EventQueue;
pub use reconcile::Outcome;
pub use reconcile::Reconciler;
pub use source::EventHandler;
pub use source::KubeSource;
pub use source::Listing;
pub use source::NotificationSource;
pub use source::SharedCache;
