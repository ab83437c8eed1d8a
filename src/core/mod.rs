//! Core module - queueing, routing, and delivery timing.
//!
//! This module contains the heart of the relay:
//! - File-backed per-destination queues
//! - Destination routing
//! - Quiet-period gating of responses
//! - The coordinator binding them into two mailboxes

pub mod clock;
pub mod debounce;
pub mod queue;
pub mod relay;
pub mod routing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use debounce::{Channel, ChannelPolicy, DebounceController, DebounceState};
pub use queue::{QueueStats, QueueStore};
pub use relay::{RelayCoordinator, RelayStatus};
pub use routing::RoutingTable;
