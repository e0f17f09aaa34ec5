//! # courier-bus
//!
//! Cross-process messaging for the Courier delivery engine.
//!
//! - **MessageBus** - Durable topics with consumer groups, delayed delivery,
//!   retry with backoff and a dead-letter sink
//! - **Delay workers** - One lock-elected poller per topic across the fleet
//! - **Bridge** - Pattern pub/sub routing into each process's registry
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_bus::{BusConfig, Envelope, HandlerError, MessageBus};
//! use courier_store::SharedClient;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = MessageBus::new(SharedClient::memory(), BusConfig::default());
//! let cancel = CancellationToken::new();
//!
//! bus.subscribe(
//!     "orders",
//!     |envelope: Envelope| async move {
//!         println!("order {}", envelope.payload);
//!         Ok::<(), HandlerError>(())
//!     },
//!     cancel.clone(),
//! )
//! .await?;
//!
//! bus.publish("orders", &serde_json::json!({"id": "42"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod bus;
mod delay;
pub mod envelope;
pub mod handler;

pub use bridge::{Bridge, BridgeConfig, BridgeError, BridgePublisher, RelayMessage, Route};
pub use bus::{BusConfig, BusError, MessageBus};
pub use envelope::{DeadLetter, Envelope, DEFAULT_MAX_RETRY};
pub use handler::{Handler, HandlerError};
