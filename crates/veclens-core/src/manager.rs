//! Bounded registry of live adapters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::TRACING_TARGET_MANAGER;
use crate::adapter::{BackendKind, ConnectionAdapter};
use crate::error::{Error, Result};

/// Maximum number of simultaneously registered connections.
pub const MAX_CONNECTIONS: usize = 10;

/// Adapter shared between the registry and its callers. The mutex serializes
/// calls on one adapter.
pub type SharedAdapter = Arc<Mutex<Box<dyn ConnectionAdapter>>>;

/// Lifecycle state of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Registered but not connected.
    Disconnected,
    /// A connect call is in flight.
    Connecting,
    /// Connected.
    Connected,
    /// The last connect failed.
    Error,
}

/// Summary of a registered connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    /// Registry id.
    pub id: Uuid,
    /// Profile the connection was opened from.
    pub name: String,
    /// Backend family.
    pub backend: BackendKind,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Message of the last failure, if any.
    pub last_error: Option<String>,
}

struct Entry {
    name: String,
    backend: BackendKind,
    state: ConnectionState,
    last_error: Option<String>,
    adapter: SharedAdapter,
}

/// Registry of adapter instances, one per backend connection.
///
/// Adapters never share state with each other; the registry only tracks
/// their lifecycle and which one is active.
#[derive(Default)]
pub struct ConnectionManager {
    entries: Vec<(Uuid, Entry)>,
    active: Option<Uuid>,
}

impl ConnectionManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: Uuid) -> Result<&Entry> {
        self.entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| Error::not_found(format!("connection {}", id)))
    }

    fn entry_mut(&mut self, id: Uuid) -> Result<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, entry)| entry)
            .ok_or_else(|| Error::not_found(format!("connection {}", id)))
    }

    /// Registers an adapter. Fails with `LimitExceeded` once
    /// [`MAX_CONNECTIONS`] are registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Box<dyn ConnectionAdapter>,
    ) -> Result<Uuid> {
        if self.entries.len() >= MAX_CONNECTIONS {
            return Err(Error::limit_exceeded(format!(
                "at most {} connections can be open at once",
                MAX_CONNECTIONS
            )));
        }

        let id = Uuid::new_v4();
        let name = name.into();
        let backend = adapter.backend();
        let state = if adapter.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };

        tracing::info!(
            target: TRACING_TARGET_MANAGER,
            connection = %id,
            name = %name,
            backend = %backend,
            "Registered connection"
        );

        self.entries.push((
            id,
            Entry {
                name,
                backend,
                state,
                last_error: None,
                adapter: Arc::new(Mutex::new(adapter)),
            },
        ));
        if self.active.is_none() {
            self.active = Some(id);
        }
        Ok(id)
    }

    /// Connects a registered adapter, tracking its state.
    pub async fn connect(&mut self, id: Uuid) -> Result<()> {
        let adapter = {
            let entry = self.entry_mut(id)?;
            entry.state = ConnectionState::Connecting;
            entry.adapter.clone()
        };

        let outcome = adapter.lock().await.connect().await;

        let entry = self.entry_mut(id)?;
        match &outcome {
            Ok(()) => {
                entry.state = ConnectionState::Connected;
                entry.last_error = None;
                tracing::info!(target: TRACING_TARGET_MANAGER, connection = %id, "Connected");
            }
            Err(err) => {
                entry.state = ConnectionState::Error;
                entry.last_error = Some(err.to_string());
                tracing::warn!(
                    target: TRACING_TARGET_MANAGER,
                    connection = %id,
                    error = %err,
                    "Connection failed"
                );
            }
        }
        outcome
    }

    /// Disconnects a registered adapter.
    pub async fn disconnect(&mut self, id: Uuid) -> Result<()> {
        let adapter = self.entry(id)?.adapter.clone();
        adapter.lock().await.disconnect().await?;
        self.entry_mut(id)?.state = ConnectionState::Disconnected;
        Ok(())
    }

    /// Disconnects and unregisters an adapter.
    pub async fn remove(&mut self, id: Uuid) -> Result<()> {
        self.disconnect(id).await?;
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        if self.active == Some(id) {
            self.active = self.entries.first().map(|(entry_id, _)| *entry_id);
        }
        tracing::info!(target: TRACING_TARGET_MANAGER, connection = %id, "Removed connection");
        Ok(())
    }

    /// Disconnects every adapter, reporting the first failure.
    pub async fn disconnect_all(&mut self) -> Result<()> {
        let ids: Vec<Uuid> = self.entries.iter().map(|(id, _)| *id).collect();
        let mut first_error = None;
        for id in ids {
            if let Err(err) = self.disconnect(id).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Returns the adapter of a connection.
    pub fn get(&self, id: Uuid) -> Result<SharedAdapter> {
        Ok(self.entry(id)?.adapter.clone())
    }

    /// Returns the state of a connection.
    pub fn state(&self, id: Uuid) -> Result<ConnectionState> {
        Ok(self.entry(id)?.state)
    }

    /// Marks a connection as the active one.
    pub fn set_active(&mut self, id: Uuid) -> Result<()> {
        self.entry(id)?;
        self.active = Some(id);
        Ok(())
    }

    /// Returns the active connection id.
    pub fn active(&self) -> Option<Uuid> {
        self.active
    }

    /// Returns the number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summarizes every registered connection, in registration order.
    pub fn list(&self) -> Vec<ConnectionSummary> {
        self.entries
            .iter()
            .map(|(id, entry)| ConnectionSummary {
                id: *id,
                name: entry.name.clone(),
                backend: entry.backend,
                state: entry.state,
                last_error: entry.last_error.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.entries.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
