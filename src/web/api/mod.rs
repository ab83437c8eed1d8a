//! API endpoints module.

pub mod diag;
pub mod messages;

use std::sync::Arc;

use crate::core::RelayCoordinator;

/// Relay shared by all handlers.
pub type SharedRelay = Arc<RelayCoordinator>;

pub use diag::{diag, health};
pub use messages::{dequeue, dequeue_all, enqueue, send_from};
