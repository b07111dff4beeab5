//! Live registry of available connections
//!
//! A `ConnectionSet` tracks the connections currently available at a handler
//! stage. Wrapping a stage with `ConnectionSet::track` keeps the set in sync
//! with the stage's `on_available` and `on_unavailable` events.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt};

use crate::connection::Connection;
use crate::errors::SocketResult;
use crate::handler::{ConnectionHandler, HandlerResult};
use crate::message::{Deserializer, Message, Serializer};
use crate::types::ConnectionId;

/// Concurrent set of connections keyed by id
#[derive(Clone, Default)]
pub struct ConnectionSet {
    connections: Arc<DashMap<ConnectionId, Connection>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `stage` so that its available connections are kept in this set
    pub fn track(&self, stage: Arc<dyn ConnectionHandler>) -> Arc<dyn ConnectionHandler> {
        Arc::new(TrackedStage {
            set: self.clone(),
            inner: stage,
        })
    }

    /// Returns false if the connection was already present
    pub fn insert(&self, connection: &Connection) -> bool {
        self.connections
            .insert(connection.id(), connection.clone())
            .is_none()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Connections in ascending id order
    pub fn snapshot(&self) -> Vec<Connection> {
        let mut connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        connections.sort_unstable_by_key(Connection::id);
        connections
    }

    /// Send `message` to every connection in the set
    ///
    /// Sends are queued before this returns; the future reports each outcome.
    pub fn broadcast(
        &self,
        message: impl Into<Message>,
    ) -> BoxFuture<'static, Vec<(ConnectionId, SocketResult<()>)>> {
        let message = message.into();
        let sends: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|connection| {
                let id = connection.id();
                connection
                    .send_message(message.clone())
                    .map(move |outcome| (id, outcome))
            })
            .collect();
        join_all(sends).boxed()
    }
}

impl std::fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("ids", &self.ids())
            .finish()
    }
}

struct TrackedStage {
    set: ConnectionSet,
    inner: Arc<dyn ConnectionHandler>,
}

impl ConnectionHandler for TrackedStage {
    fn on_available(&self, connection: &Connection) -> HandlerResult {
        self.set.insert(connection);
        self.inner.on_available(connection)
    }

    fn on_message(&self, connection: &Connection, message: Message) -> HandlerResult {
        self.inner.on_message(connection, message)
    }

    fn on_unavailable(&self, connection: &Connection) -> HandlerResult {
        self.set.remove(connection.id());
        self.inner.on_unavailable(connection)
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        self.inner.serializer()
    }

    fn deserializer(&self) -> Arc<dyn Deserializer> {
        self.inner.deserializer()
    }
}
