//! Value encoding for the remote cache.
//!
//! Values are stored as JSON text. Plain JSON has no map with non-string keys
//! and no set, so [`TaggedMap`] and [`TaggedSet`] carry their container kind
//! in the payload:
//!
//! ```json
//! {"__type": "Map", "entries": [[key, value], ...]}
//! {"__type": "Set", "values": [value, ...]}
//! ```
//!
//! and only decode from that tagged form.

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::ops::{Deref, DerefMut};

use crate::error::Result;

pub const TYPE_FIELD: &str = "__type";
pub const MAP_TAG: &str = "Map";
pub const SET_TAG: &str = "Set";

pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn deserialize<T: DeserializeOwned>(payload: &str) -> Result<T> {
    Ok(serde_json::from_str(payload)?)
}

/// A `HashMap` that keeps its identity as a map through the cache codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMap<K: Eq + Hash, V>(pub HashMap<K, V>);

/// A `HashSet` that keeps its identity as a set through the cache codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedSet<T: Eq + Hash>(pub HashSet<T>);

impl<K: Eq + Hash, V> TaggedMap<K, V> {
    pub fn into_inner(self) -> HashMap<K, V> {
        self.0
    }
}

impl<T: Eq + Hash> TaggedSet<T> {
    pub fn into_inner(self) -> HashSet<T> {
        self.0
    }
}

impl<K: Eq + Hash, V> Default for TaggedMap<K, V> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<T: Eq + Hash> Default for TaggedSet<T> {
    fn default() -> Self {
        Self(HashSet::new())
    }
}

impl<K: Eq + Hash, V> From<HashMap<K, V>> for TaggedMap<K, V> {
    fn from(map: HashMap<K, V>) -> Self {
        Self(map)
    }
}

impl<T: Eq + Hash> From<HashSet<T>> for TaggedSet<T> {
    fn from(set: HashSet<T>) -> Self {
        Self(set)
    }
}

impl<K: Eq + Hash, V> FromIterator<(K, V)> for TaggedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T: Eq + Hash> FromIterator<T> for TaggedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<K: Eq + Hash, V> Deref for TaggedMap<K, V> {
    type Target = HashMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K: Eq + Hash, V> DerefMut for TaggedMap<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: Eq + Hash> Deref for TaggedSet<T> {
    type Target = HashSet<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Eq + Hash> DerefMut for TaggedSet<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K, V> Serialize for TaggedMap<K, V>
where
    K: Serialize + Eq + Hash,
    V: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let entries: Vec<(&K, &V)> = self.0.iter().collect();
        let mut state = serializer.serialize_struct("TaggedMap", 2)?;
        state.serialize_field(TYPE_FIELD, MAP_TAG)?;
        state.serialize_field("entries", &entries)?;
        state.end()
    }
}

impl<T> Serialize for TaggedSet<T>
where
    T: Serialize + Eq + Hash,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let values: Vec<&T> = self.0.iter().collect();
        let mut state = serializer.serialize_struct("TaggedSet", 2)?;
        state.serialize_field(TYPE_FIELD, SET_TAG)?;
        state.serialize_field("values", &values)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct MapRepr<K, V> {
    #[serde(rename = "__type")]
    kind: String,
    entries: Vec<(K, V)>,
}

#[derive(Deserialize)]
struct SetRepr<T> {
    #[serde(rename = "__type")]
    kind: String,
    values: Vec<T>,
}

impl<'de, K, V> Deserialize<'de> for TaggedMap<K, V>
where
    K: Deserialize<'de> + Eq + Hash,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = MapRepr::<K, V>::deserialize(deserializer)?;
        if repr.kind != MAP_TAG {
            return Err(de::Error::custom(format!(
                "expected {TYPE_FIELD} \"{MAP_TAG}\", found \"{}\"",
                repr.kind
            )));
        }
        Ok(repr.entries.into_iter().collect())
    }
}

impl<'de, T> Deserialize<'de> for TaggedSet<T>
where
    T: Deserialize<'de> + Eq + Hash,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = SetRepr::<T>::deserialize(deserializer)?;
        if repr.kind != SET_TAG {
            return Err(de::Error::custom(format!(
                "expected {TYPE_FIELD} \"{SET_TAG}\", found \"{}\"",
                repr.kind
            )));
        }
        Ok(repr.values.into_iter().collect())
    }
}
