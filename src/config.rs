//! Server configuration
//!
//! Centralized configuration with sensible defaults. The binary fills it
//! from command-line flags and environment variables; tests build it
//! directly.

use crate::commands::DEFAULT_OP_TIMEOUT;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::storage::{StorageKind, StorageOptions};
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a server instance
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// Interface to bind to
    pub host: String,

    /// TCP port (0 picks a free one)
    pub port: u16,

    /// Largest frame buffered before the connection is dropped (bytes)
    pub max_frame_size: usize,

    // -------------------------------------------------------------------------
    // Execution Configuration
    // -------------------------------------------------------------------------
    /// Deadline for every storage operation
    pub op_timeout: Duration,

    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Engine selection and parameters
    pub storage: StorageOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            op_timeout: DEFAULT_OP_TIMEOUT,
            storage: StorageOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for ServerConfig
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the interface to bind to
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the TCP port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the frame size limit (in bytes)
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the per-operation deadline
    pub fn op_timeout(mut self, timeout: Duration) -> Self {
        self.config.op_timeout = timeout;
        self
    }

    /// Select the storage engine
    pub fn storage_kind(mut self, kind: StorageKind) -> Self {
        self.config.storage.kind = kind;
        self
    }

    /// Set the SQLite database file
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.db_path = path.into();
        self
    }

    /// Set the hash table bucket count
    pub fn buckets(mut self, buckets: usize) -> Self {
        self.config.storage.buckets = buckets;
        self
    }

    /// Let the hash table grow once its load factor exceeds `factor`
    pub fn max_load_factor(mut self, factor: f64) -> Self {
        self.config.storage.max_load_factor = Some(factor);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
