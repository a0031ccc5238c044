//! TCP Listener
//!
//! Accepts connections and gives each one its own task. The storage engine
//! is opened once by the caller and shared by reference with every
//! connection.
//!
//! A panic inside a connection task is caught at its join handle and
//! logged; the listener and every other connection keep running.

use crate::commands::CommandHandler;
use crate::config::ServerConfig;
use crate::connection::{ConnectionHandler, ConnectionStats};
use crate::protocol::FrameParser;
use crate::storage::Storage;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

/// The key-value server.
pub struct Server {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    stats: Arc<ConnectionStats>,
}

impl Server {
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            stats: Arc::new(ConnectionStats::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared counters for every connection this server handles.
    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        info!(addr = %listener.local_addr()?, "Listening");
        Ok(listener)
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Connection tasks still running at shutdown are aborted.
    pub async fn run_until<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let handler = CommandHandler::with_timeout(Arc::clone(&self.storage), self.config.op_timeout);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let connection = ConnectionHandler::new(
                            stream,
                            addr,
                            handler.clone(),
                            Arc::clone(&self.stats),
                        )
                        .with_parser(FrameParser::with_max_frame_size(self.config.max_frame_size));

                        connections.spawn(connection.serve());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                Some(joined) = connections.join_next() => {
                    if let Err(e) = joined {
                        log_join_error(e);
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        connections.shutdown().await;
        info!("Server shutdown complete");
    }
}

fn log_join_error(e: JoinError) {
    if e.is_panic() {
        error!(error = %e, "Connection task panicked");
    } else {
        debug!(error = %e, "Connection task cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::storage::HashTable;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn test_config() -> ServerConfig {
        ServerConfig::builder().host("127.0.0.1").port(0).build()
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let server = Arc::new(Server::new(test_config(), Arc::new(HashTable::with_buckets(1021))));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move {
            running
                .run_until(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let mut client = Client::connect(addr).await.unwrap();
        client.set("name", "value1").await.unwrap();
        assert_eq!(client.get("name").await.unwrap(), "value1");
        assert_eq!(server.stats().connections_accepted.load(Ordering::Relaxed), 1);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shared_storage_across_connections() {
        let storage: Arc<dyn Storage> = Arc::new(HashTable::with_buckets(1021));
        let server = Arc::new(Server::new(test_config(), Arc::clone(&storage)));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run_until(listener, std::future::pending()).await });

        let mut writer = Client::connect(addr).await.unwrap();
        let mut reader = Client::connect(addr).await.unwrap();

        writer.set("shared", "yes").await.unwrap();
        assert_eq!(reader.get("shared").await.unwrap(), "yes");
        assert_eq!(storage.len().unwrap(), 1);
    }
}
