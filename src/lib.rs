#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! hookdeck-listen: attach a workstation to the webhook Gateway and forward
//! deliveries to local HTTP endpoints.
//!
//! - `transport`: authenticated WebSocket session with the Gateway
//! - `session`: connect / reconnect state machine
//! - `dispatcher`: admission control, per-source FIFO queues
//! - `forwarder`: one envelope, one local HTTP/1.1 request
//! - `subscription`: Source to local endpoint mapping
//! - `shutdown`: signal handling and the drain deadline
//! - `api`: REST client used to resolve Sources at startup

pub mod api;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{ListenError, TransportError};
pub use session::SessionManager;
pub use subscription::{LocalEndpoint, Subscription, SubscriptionSet};
