//! # keyval - A Networked Key-Value Store
//!
//! keyval serves string keys and values over a compact binary protocol.
//! Every request is a sentinel-terminated frame; every answered request gets
//! exactly one `'O'` or `'N'` response frame.
//!
//! ## Features
//!
//! - **Pluggable storage**: A concurrent chained hash table or a SQLite file,
//!   chosen once at start-up
//! - **Deadlines**: Each storage operation runs under a 10 second deadline
//!   and is cancelled when it expires or the client goes away
//! - **Bulk transfer**: JSON import and export of the whole key space
//! - **Async I/O**: Built on Tokio, one task per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              keyval                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Server    │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │ spawn_blocking          │
//! │                                               ▼ + deadline              │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │   Frame     │    │              Arc<dyn Storage>                │   │
//! │  │   codec     │    │  ┌──────────────────┐  ┌──────────────────┐  │   │
//! │  │             │    │  │    HashTable     │  │  SqliteStorage   │  │   │
//! │  └─────────────┘    │  └──────────────────┘  └──────────────────┘  │   │
//! │                     └──────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use keyval::config::ServerConfig;
//! use keyval::server::Server;
//! use keyval::storage::open_storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::default();
//!     let storage = open_storage(&config.storage)?;
//!
//!     let server = Server::new(config, storage);
//!     let listener = server.bind().await?;
//!     server.run_until(listener, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Operations
//!
//! | Opcode | Frame                              | Success payload      |
//! |--------|------------------------------------|----------------------|
//! | `get`  | fixed, key                         | value (empty if absent) |
//! | `set`  | fixed, key + value                 | none                 |
//! | `del`  | fixed, key                         | none                 |
//! | `exp`  | `exp` + sentinel                   | JSON array of records |
//! | `imp`  | `imp` + JSON array + sentinel      | none                 |
//!
//! ## Module Overview
//!
//! - [`protocol`]: Frame layout, encoding and decoding, input validation
//! - [`storage`]: The storage capability trait and both engines
//! - [`commands`]: Dispatch with validation, deadlines and cancellation
//! - [`connection`]: Per-connection read/dispatch/write loop
//! - [`server`]: TCP listener
//! - [`client`]: Client-side command encoder
//! - [`config`]: Server configuration

pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use client::{Client, ClientError};
pub use commands::CommandHandler;
pub use config::ServerConfig;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{Request, Response};
pub use server::Server;
pub use storage::{open_storage, HashTable, OpContext, Record, SqliteStorage, Storage};

/// The default port the server listens on
pub const DEFAULT_PORT: u16 = 6842;

/// The default host the server binds to
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Version of keyval
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
