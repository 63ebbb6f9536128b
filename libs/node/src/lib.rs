//! Courier Node - fallback routing over interchangeable protocols
//!
//! [`FallbackManager`] owns a set of prioritized [`Protocol`](courier_fabric::Protocol)s.
//! Outbound envelopes go over the highest-priority healthy one, with retries
//! that move to the next protocol once the current one keeps failing. Inbound
//! envelopes from every listener are de-duplicated and handed to one callback.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::MessageKind;
//! use courier_node::{telemetry, FallbackManager, NodeConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::load("courier.toml")?;
//! telemetry::init_tracing(&config.logging);
//!
//! let manager = Arc::new(FallbackManager::from_config(&config)?);
//! manager.on_message(|envelope| println!("{} says {:?}", envelope.sender, envelope.payload));
//! manager.start().await?;
//!
//! manager.send_to("agent-9", MessageKind::Event, b"ping".to_vec()).await?;
//! println!("{}", serde_json::to_string_pretty(&manager.status())?);
//!
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
mod dedup;
mod dispatch;
pub mod error;
mod health;
pub mod manager;
mod registry;
pub mod telemetry;

pub use config::{FallbackConfig, LoggingConfig, NodeConfig, ProtocolsConfig};
pub use connector::{Connector, PrimaryTransport, Route};
pub use dispatch::MessageHandler;
pub use error::{Error, Result, SendError};
pub use manager::{FallbackManager, Status};
pub use registry::{Health, ProtocolStats, ProtocolStatus};
