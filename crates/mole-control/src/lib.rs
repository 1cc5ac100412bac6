//! Broker side of the reverse tunnel
//!
//! Agents behind NAT keep one outbound control connection to the broker. To
//! reach an agent, the broker asks it over that connection to open a new
//! worker connection back, then hands that connection to the caller as if it
//! had been dialed directly.
pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod http_client;
pub mod registry;

pub use broker::{Broker, WorkerConnections};
pub use bus::{Subscription, SubscriptionToken, WorkerBus, WorkerKey};
pub use config::BrokerConfig;
pub use connection::{ConnectionId, ControlConnection};
pub use error::BrokerError;
pub use http_client::AgentHttpClient;
pub use registry::{AgentRegistry, AgentSummary, RegisteredAgent};
