pub mod ack_tracker;
pub mod contacts;
pub mod delivery_router;
pub mod idempotency;
pub mod key_directory;
pub mod offline_queue;
pub mod typing_relay;

pub use ack_tracker::AckTracker;
pub use delivery_router::{DeliveryRouter, RouteOutcome};
pub use offline_queue::OfflineQueue;
pub use typing_relay::TypingRelay;
