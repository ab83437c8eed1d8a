//! Wire protocol for the relay.
//!
//! - Message envelopes with correlation IDs
//! - Request/acknowledgment bodies for enqueue and poll calls

pub mod envelope;
pub mod types;

pub use envelope::{generate_id, Envelope, EnvelopeBuilder};
pub use types::{BatchDelivery, Delivery, SendAck, SendRequest};
