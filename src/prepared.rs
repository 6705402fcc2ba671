//! The prepared-statement cache.
//!
//! The same query text resolves to a different query id on every connection, so
//! bindings are keyed by `(text, connection id)`. An `unprepared` response invalidates
//! one binding; a connection dying invalidates all of its bindings. Entries are never
//! evicted while the client lives, so every host can be brought back up to date after
//! an outage.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use crate::{
    connection::{Connection, SendOptions},
    error::{Error, Result},
    frame::{
        request::Request,
        response::{CqlResult, Prepared, Response},
    },
};

/// The client-side handle to a prepared query, as returned by
/// [`Client::prepare`](crate::Client::prepare). The server-side query id is resolved
/// per connection at execution time.
#[derive(Clone, Debug)]
pub struct PreparedStatement {
    pub(crate) text: String,
    /// Indexes of the partition key columns within the bind parameters, used for
    /// token-aware routing.
    pub(crate) pk_indexes: Vec<u16>,
}

impl PreparedStatement {
    /// The query text this statement was prepared from.
    pub fn query(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Default)]
pub(crate) struct PreparedCache {
    /// text → connection id → query id.
    entries: Mutex<HashMap<String, HashMap<u64, Vec<u8>>>>,
}

impl PreparedCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The query id bound on a connection, if this text was prepared there.
    pub(crate) fn binding(&self, text: &str, connection_id: u64) -> Option<Vec<u8>> {
        #[allow(clippy::unwrap_used)]
        let entries = self.entries.lock().unwrap();
        entries.get(text)?.get(&connection_id).cloned()
    }

    /// Drops one connection's binding after an `unprepared` response. Other
    /// connections' bindings stay valid.
    pub(crate) fn invalidate(&self, text: &str, connection_id: u64) {
        #[allow(clippy::unwrap_used)]
        let mut entries = self.entries.lock().unwrap();
        if let Some(bindings) = entries.get_mut(text) {
            bindings.remove(&connection_id);
        }
    }

    /// Drops every binding of a dead connection; the texts stay known.
    pub(crate) fn remove_connection(&self, connection_id: u64) {
        #[allow(clippy::unwrap_used)]
        let mut entries = self.entries.lock().unwrap();
        for bindings in entries.values_mut() {
            bindings.remove(&connection_id);
        }
    }

    /// Every text ever prepared through this client.
    pub(crate) fn texts(&self) -> Vec<String> {
        #[allow(clippy::unwrap_used)]
        let entries = self.entries.lock().unwrap();
        entries.keys().cloned().collect()
    }

    /// Issues a PREPARE on the given connection and records the binding.
    pub(crate) async fn prepare_on(
        &self,
        connection: &Connection,
        text: &str,
        read_timeout: Option<Duration>,
    ) -> Result<Prepared> {
        let response = connection
            .send(
                Request::Prepare {
                    query: text.to_string(),
                },
                SendOptions {
                    read_timeout,
                    ..Default::default()
                },
            )
            .await?;

        let prepared = match response.kind {
            Response::Result(CqlResult::Prepared(prepared)) => prepared,
            other => {
                return Err(Error::protocol(format!(
                    "expected a prepared result, got {:?}",
                    other
                )))
            }
        };
        tracing::debug!(
            endpoint = %connection.endpoint(),
            id = %hex::encode(&prepared.id),
            "prepared statement"
        );

        {
            #[allow(clippy::unwrap_used)]
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry(text.to_string())
                .or_default()
                .insert(connection.id(), prepared.id.clone());
        }
        Ok(prepared)
    }

    /// Re-prepares every known text on a connection. Used when a host rejoins, before
    /// it is marked UP.
    pub(crate) async fn re_prepare_all(
        &self,
        connection: &Connection,
        read_timeout: Option<Duration>,
    ) -> Result<()> {
        for text in self.texts() {
            self.prepare_on(connection, &text, read_timeout).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cache_with(text: &str, bindings: &[(u64, &[u8])]) -> PreparedCache {
        let cache = PreparedCache::new();
        {
            let mut entries = cache.entries.lock().unwrap();
            let map = entries.entry(text.to_string()).or_default();
            for (connection_id, id) in bindings {
                map.insert(*connection_id, id.to_vec());
            }
        }
        cache
    }

    #[test]
    fn unprepared_invalidates_one_binding_only() {
        let cache = cache_with("SELECT 1", &[(1, b"a"), (2, b"b")]);
        cache.invalidate("SELECT 1", 1);
        assert_eq!(cache.binding("SELECT 1", 1), None);
        assert_eq!(cache.binding("SELECT 1", 2), Some(b"b".to_vec()));
    }

    #[test]
    fn dead_connection_loses_bindings_but_texts_survive() {
        let cache = cache_with("SELECT 1", &[(1, b"a")]);
        cache.remove_connection(1);
        assert_eq!(cache.binding("SELECT 1", 1), None);
        assert_eq!(cache.texts(), vec!["SELECT 1".to_string()]);
    }
}
