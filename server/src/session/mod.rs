//! Registry of connected measurement clients

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("server is at its limit of {limit} concurrent clients")]
    Full { limit: usize },
}

/// Connected client information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub client_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Tracks live connections and enforces the client limit
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<u64, ConnectionInfo>>>,
    max_clients: usize,
}

impl ConnectionRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            max_clients,
        }
    }

    /// Admit a new connection
    pub async fn register(&self, client_addr: SocketAddr) -> Result<u64, RegistryError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_clients {
            return Err(RegistryError::Full {
                limit: self.max_clients,
            });
        }

        let mut connection_id: u64 = rand::random();
        while connections.contains_key(&connection_id) {
            connection_id = rand::random();
        }

        connections.insert(
            connection_id,
            ConnectionInfo {
                client_addr,
                connected_at: Utc::now(),
                bytes_received: 0,
                bytes_sent: 0,
            },
        );

        Ok(connection_id)
    }

    /// Forget a connection, returning its final record
    pub async fn unregister(&self, connection_id: u64) -> Option<ConnectionInfo> {
        let mut connections = self.connections.write().await;
        connections.remove(&connection_id)
    }

    /// Add transfer totals from a finished stream
    pub async fn record_transfer(&self, connection_id: u64, bytes_received: u64, bytes_sent: u64) {
        let mut connections = self.connections.write().await;
        if let Some(info) = connections.get_mut(&connection_id) {
            info.bytes_received += bytes_received;
            info.bytes_sent += bytes_sent;
        }
    }

    #[allow(dead_code)]
    pub async fn get(&self, connection_id: u64) -> Option<ConnectionInfo> {
        let connections = self.connections.read().await;
        connections.get(&connection_id).cloned()
    }

    /// Get number of active connections
    pub async fn active_connections(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }
}
