//! autsys-relay library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod web;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{QueueStore, RelayCoordinator, RoutingTable};
pub use error::{Error, Result};
pub use protocol::{Envelope, SendAck, SendRequest};
pub use web::run_web_server;
