#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use std::sync::Arc;
//!
//! use ramqp::conf::Settings;
//! use ramqp::context::BrokerContext;
//! use ramqp::store::MemoryMessageStore;
//! use ramqp::vhost::VirtualHost;
//! use ramqp::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!
//!    let ctx = BrokerContext::new(Settings::default());
//!    let vhost = VirtualHost::new(ctx, Arc::new(MemoryMessageStore::default()))?;
//!    vhost.recover().await?;
//!    vhost.start_housekeeping();
//!
//!    let (mut session, _deliveries) = vhost.create_session().await;
//!    session.close().await?;
//!    vhost.close().await?;
//!    Ok(())
//! }
//!
//! ```

/// Core Broker Components
pub mod acl; // Access control
pub mod binding; // Exchange to queue bindings
pub mod context; // Shared broker context
pub mod exchange; // Exchange types and routing
pub mod queue; // Queue entries, consumers and dispatch
pub mod session; // Session dispositions and operations
pub mod vhost; // Virtual host, owner of exchanges and queues

/// Persistence and Transactions
pub mod message; // Server side messages
pub mod store; // Message store
pub mod txn; // Auto-commit and local transactions

/// Essential Services
pub mod error; // Broker errors and AMQP error codes
pub mod hook; // Event hook system
pub mod logger; // slog backed logging
pub mod stats; // Runtime statistics tracking
pub mod task; // Close and delete tasks
pub mod types; // Common data types

pub use error::{BrokerError, ErrorCode};

/// Workspace Re-exports
pub use ramqp_conf as conf; // Configuration
pub use ramqp_utils as utils; // Common utilities

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
