pub mod message;

pub use message::{conversation_id, DeliveryRecord, DeliveryState, MessageEnvelope};
