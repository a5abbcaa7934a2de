//! Duplex WebSocket Client
//!
//! A persistent WebSocket client that multiplexes concurrent request/response
//! exchanges and unsolicited push notifications over a single, automatically
//! reconnecting connection.
//!
//! Outbound requests are stamped with a correlation identifier in their `id`
//! field. Inbound messages carrying a known identifier complete the matching
//! request; messages without one are dispatched to subscriptions on the
//! client's [`EventRouter`].
//!
//! # Example
//!
//! ```no_run
//! use duplex_client::{DuplexClient, DuplexConfig, MatchKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DuplexConfig::new("ws://localhost:8080/ws").identity("session-token");
//!     let client = DuplexClient::connect(config).await?;
//!
//!     // Unsolicited pushes, by exact type or by pattern
//!     let prices = client.subscribe("priceUpdate", |body| {
//!         println!("price update: {}", body);
//!     });
//!     let _nfts = client.subscribe(MatchKey::pattern("^/nft/")?, |body| {
//!         println!("nft event: {}", body);
//!     });
//!
//!     // Request/response, matched on the correlation identifier
//!     let pong = client.request(serde_json::json!({"task": "open.ping"})).await?;
//!     println!("{}", pong);
//!
//!     prices.stop();
//!     client.dispose();
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod ids;
mod messages;
mod router;
mod session;

pub use client::{DuplexApi, DuplexClient, TaskRequest};
pub use config::{DuplexConfig, IDENTITY_PARAM};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{DuplexError, Result};
pub use ids::{CorrelationId, IdAllocator};
pub use messages::{Payload, BODY_FIELD, CORRELATION_FIELD};
pub use router::{EventAction, EventRouter, MatchKey, Subscription};
pub use session::{PendingTable, RequestSession, ResponseHandler};
