//! Chat Relay - line-oriented multi-user TCP chat
//!
//! Every chunk a client sends is rebroadcast to every other connected client,
//! normalized to end with exactly one newline. Connections live in a bounded,
//! lock-guarded [`Registry`]; one [`Worker`] task per connection reads and
//! drives the [`Broadcaster`]; the [`Server`] accepts, enforces capacity and
//! runs shutdown.
//!
//! # Example
//!
//! ```no_run
//! use chat_relay::{RelayConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig {
//!         host: "127.0.0.1".to_string(),
//!         max_clients: 4,
//!         ..Default::default()
//!     };
//!
//!     let server = Server::bind(config).await?;
//!     println!("listening on {}", server.local_addr());
//!
//!     let summary = server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!     println!("closed {} connections", summary.closed_connections);
//!     Ok(())
//! }
//! ```

mod broadcast;
pub mod config;
mod error;
mod registry;
mod server;
mod stats;
mod worker;

pub use broadcast::{Broadcaster, Delivery, Message};
pub use config::{RelayConfig, load_config};
pub use error::RelayError;
pub use registry::{Connection, ConnectionId, Full, Registry, SlotId, Sweep, Visit};
pub use server::{SERVER_FULL_NOTICE, Server, ShutdownSummary};
pub use stats::{RelayStats, StatsSnapshot};
pub use worker::{Disconnect, Worker};
