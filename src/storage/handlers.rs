//! Owner-side handlers.
//!
//! Each container registers three inline handlers that act on its local
//! shard, plus one handler per named item operation. All of them mutate the
//! shard under DashMap's per-shard locks; none of them blocks on a future.

use super::protocol::*;
use super::types::{ContainerHandlers, MapKey, MapValue};
use crate::error::Result;
use crate::group::types::Rank;
use crate::rmi::engine::RmiEngine;
use crate::rmi::types::{Dispatch, HandlerId};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub(crate) fn register_container_handlers<K, V>(
    engine: &RmiEngine,
    container: u64,
    shard: &Arc<DashMap<K, V>>,
) -> Result<ContainerHandlers>
where
    K: MapKey,
    V: MapValue,
{
    let replace = {
        let shard = shard.clone();
        engine.register_typed::<ReplaceRequest<K, V>, (), _>(
            &replace_handler(container),
            Dispatch::Inline,
            move |_, request| {
                shard.insert(request.key, request.value);
                Ok(())
            },
        )?
    };

    let erase = {
        let shard = shard.clone();
        engine.register_typed::<KeyRequest<K>, (), _>(
            &erase_handler(container),
            Dispatch::Inline,
            move |_, request| {
                shard.remove(&request.key);
                Ok(())
            },
        )?
    };

    let find = {
        let shard = shard.clone();
        engine.register_typed::<KeyRequest<K>, Option<V>, _>(
            &find_handler(container),
            Dispatch::Inline,
            move |_, request| Ok(shard.get(&request.key).map(|value| value.clone())),
        )?
    };

    Ok(ContainerHandlers {
        replace,
        erase,
        find,
    })
}

/// Registers the handler that runs `op` on the owner's item.
pub(crate) fn register_op_handler<K, V, A, R, F>(
    engine: &RmiEngine,
    container: u64,
    name: &str,
    dispatch: Dispatch,
    shard: &Arc<DashMap<K, V>>,
    op: F,
) -> Result<HandlerId>
where
    K: MapKey,
    V: MapValue,
    A: Serialize + DeserializeOwned + 'static,
    R: Serialize + DeserializeOwned + 'static,
    F: Fn(&K, &mut Option<V>, A) -> anyhow::Result<R> + Send + Sync + 'static,
{
    let shard = shard.clone();
    engine.register_typed::<InvokeRequest<K, A>, R, _>(
        &op_handler(container, name),
        dispatch,
        move |_: Rank, request| apply_op(&shard, request.key, request.arg, &op),
    )
}

/// Runs `op` on the item stored under `key` while holding its entry lock.
///
/// The operation sees `None` for an absent key. Leaving `Some` stores the
/// value, leaving `None` removes the key. A failing operation leaves the
/// item untouched.
pub(crate) fn apply_op<K, V, A, R, F>(
    shard: &DashMap<K, V>,
    key: K,
    arg: A,
    op: &F,
) -> anyhow::Result<R>
where
    K: MapKey,
    V: MapValue,
    F: Fn(&K, &mut Option<V>, A) -> anyhow::Result<R>,
{
    match shard.entry(key) {
        Entry::Occupied(mut occupied) => {
            let mut item = Some(occupied.get().clone());
            let result = op(occupied.key(), &mut item, arg)?;
            match item {
                Some(value) => {
                    occupied.insert(value);
                }
                None => {
                    occupied.remove();
                }
            }
            Ok(result)
        }
        Entry::Vacant(vacant) => {
            let mut item = None;
            let result = op(vacant.key(), &mut item, arg)?;
            if let Some(value) = item {
                vacant.insert(value);
            }
            Ok(result)
        }
    }
}
