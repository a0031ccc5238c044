//! Command Handler Module
//!
//! This module is the dispatch layer: it receives decoded requests, checks
//! them against the input domain, runs them against the storage engine
//! under a deadline, and produces exactly one response per request.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  Frame decoder  │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Validate     │
//! │  - Deadline     │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ dyn Storage     │  (storage module)
//! └─────────────────┘
//! ```

mod handler;

pub use handler::{CommandError, CommandHandler, DEFAULT_OP_TIMEOUT};
