//! Declarations of named keyed state.

use std::fmt::Display;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use super::serializer::to_bytes;
use super::serializer::TypeSerializer;
use super::serializer::VoidNamespace;
use super::serializer::VoidNamespaceSerializer;
use crate::errors::Error;
use crate::errors::Result;

/// The shape of a piece of keyed state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Value,
    List,
    Map,
}

impl StateKind {
    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            Self::Value => 0,
            Self::List => 1,
            Self::Map => 2,
        }
    }

    pub(crate) fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Value),
            1 => Ok(Self::List),
            2 => Ok(Self::Map),
            b => Err(Error::corrupt(format!("unknown state kind tag {b}"))),
        }
    }
}

impl Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value => write!(f, "value"),
            Self::List => write!(f, "list"),
            Self::Map => write!(f, "map"),
        }
    }
}

/// A registered piece of state as recorded in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateMetaInfo {
    pub name: String,
    pub kind: StateKind,
}

impl StateMetaInfo {
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Single value per key and namespace.
#[derive(Debug)]
pub struct ValueStateDescriptor<V> {
    pub(crate) name: String,
    pub(crate) serializer: Arc<dyn TypeSerializer<V>>,
    pub(crate) default_value: Option<V>,
}

impl<V> ValueStateDescriptor<V> {
    pub fn new(name: impl Into<String>, serializer: impl TypeSerializer<V> + 'static) -> Self {
        Self {
            name: name.into(),
            serializer: Arc::new(serializer),
            default_value: None,
        }
    }

    /// Value returned when nothing was stored yet.
    pub fn with_default(mut self, default_value: V) -> Self {
        self.default_value = Some(default_value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> StateMetaInfo {
        StateMetaInfo::new(self.name.clone(), StateKind::Value)
    }
}

/// Ordered list of elements per key and namespace.
#[derive(Debug)]
pub struct ListStateDescriptor<T> {
    pub(crate) name: String,
    pub(crate) element_serializer: Arc<dyn TypeSerializer<T>>,
}

impl<T> ListStateDescriptor<T> {
    pub fn new(
        name: impl Into<String>,
        element_serializer: impl TypeSerializer<T> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            element_serializer: Arc::new(element_serializer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> StateMetaInfo {
        StateMetaInfo::new(self.name.clone(), StateKind::List)
    }
}

/// Map of user keys to values per key and namespace.
#[derive(Debug)]
pub struct MapStateDescriptor<K, V> {
    pub(crate) name: String,
    pub(crate) key_serializer: Arc<dyn TypeSerializer<K>>,
    pub(crate) value_serializer: Arc<dyn TypeSerializer<V>>,
}

impl<K, V> MapStateDescriptor<K, V> {
    pub fn new(
        name: impl Into<String>,
        key_serializer: impl TypeSerializer<K> + 'static,
        value_serializer: impl TypeSerializer<V> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            key_serializer: Arc::new(key_serializer),
            value_serializer: Arc::new(value_serializer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> StateMetaInfo {
        StateMetaInfo::new(self.name.clone(), StateKind::Map)
    }
}

/// A serialized namespace.
///
/// Namespaces scope state below the key, e.g. per window. State that
/// isn't scoped uses [`Namespace::void`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(Vec<u8>);

impl Namespace {
    pub fn new<N>(namespace: &N, serializer: &dyn TypeSerializer<N>) -> Self {
        Self(to_bytes(serializer, namespace))
    }

    pub fn void() -> Self {
        Self::new(&VoidNamespace, &VoidNamespaceSerializer)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[test]
fn kind_tags_round_trip() {
    for kind in [StateKind::Value, StateKind::List, StateKind::Map] {
        assert_eq!(StateKind::from_u8(kind.as_u8()).unwrap(), kind);
    }
    assert!(StateKind::from_u8(9).is_err());
}

#[test]
fn void_namespace_is_one_zero_byte() {
    assert_eq!(Namespace::void().as_bytes(), &[0]);
}
