use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;

/// What a distributed container requires of its keys.
pub trait MapKey: Serialize + DeserializeOwned + Hash + Eq + Clone + Send + Sync + 'static {}

impl<T> MapKey for T where T: Serialize + DeserializeOwned + Hash + Eq + Clone + Send + Sync + 'static
{}

/// What a distributed container requires of its values.
pub trait MapValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> MapValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Handler ids of one container's built-in operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHandlers {
    pub replace: crate::rmi::types::HandlerId,
    pub erase: crate::rmi::types::HandlerId,
    pub find: crate::rmi::types::HandlerId,
}
