//! Message Handler Registry
//!
//! Maps [`HandlerId`]s to executable closures. Handlers are registered by name;
//! the id is derived from the name, so ranks that register the same names
//! agree on every id. A name whose id collides with a different, already
//! registered name is rejected rather than silently shadowing it.

use super::types::{Dispatch, HandlerId, fnv1a_64};
use crate::error::{Result, WorldError};
use crate::group::types::Rank;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Type alias for a thread-safe message handler.
/// It takes the sender's rank and the raw payload and returns the encoded result.
pub type HandlerFn = Arc<dyn Fn(Rank, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
pub struct HandlerEntry {
    pub name: Arc<str>,
    pub dispatch: Dispatch,
    pub handler: HandlerFn,
}

/// Registry holding the mapping between handler ids and their implementation.
pub struct HandlerRegistry {
    rank: Rank,
    handlers: DashMap<HandlerId, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            handlers: DashMap::new(),
        }
    }

    /// Registers `handler` under `name`.
    ///
    /// Registering the same name twice is an error, as is a name whose hash
    /// collides with another registered name.
    pub fn register<F>(&self, name: &str, dispatch: Dispatch, handler: F) -> Result<HandlerId>
    where
        F: Fn(Rank, &[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        let id = HandlerId::from_name(name);

        match self.handlers.entry(id) {
            Entry::Occupied(existing) => Err(WorldError::DuplicateHandler {
                id,
                existing: existing.get().name.to_string(),
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(HandlerEntry {
                    name: Arc::from(name),
                    dispatch,
                    handler: Arc::new(handler),
                });
                tracing::debug!("Registered handler '{}' as {} ({:?})", name, id, dispatch);
                Ok(id)
            }
        }
    }

    /// Removes a handler, returning whether it was registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let removed = self.handlers.remove(&id);
        if let Some((_, entry)) = &removed {
            tracing::debug!("Unregistered handler '{}' ({})", entry.name, id);
        }
        removed.is_some()
    }

    /// Clones the entry out so no shard lock is held while the handler runs.
    pub fn lookup(&self, id: HandlerId) -> Result<HandlerEntry> {
        self.handlers
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(WorldError::HandlerNotFound {
                id,
                rank: self.rank,
            })
    }

    /// Returns the names of all registered handlers, sorted.
    pub fn list_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.value().name.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers
            .get(&HandlerId::from_name(name))
            .is_some_and(|entry| &*entry.name == name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Order-independent digest of the registered (id, name, dispatch) set.
    /// Equal on two ranks exactly when they registered the same handlers.
    pub fn digest(&self) -> u64 {
        let mut entries: Vec<(HandlerId, String, Dispatch)> = self
            .handlers
            .iter()
            .map(|entry| (*entry.key(), entry.value().name.to_string(), entry.value().dispatch))
            .collect();
        entries.sort();

        let mut bytes = Vec::new();
        for (id, name, dispatch) in entries {
            bytes.extend_from_slice(&id.0.to_le_bytes());
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
            bytes.push(match dispatch {
                Dispatch::Inline => 0,
                Dispatch::Pool => 1,
            });
        }
        fnv1a_64(&bytes)
    }
}
