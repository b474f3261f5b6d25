//! Wire format for queryable keyed state.
//!
//! Clients address state by the serialized key and namespace, joined
//! with a magic byte:
//!
//! ```text
//! key bytes | 42 | namespace bytes
//! ```
//!
//! Values come back as the plain serialized value. Lists are their
//! elements back to back with no count, so the element serializer must
//! be self-delimiting. Maps are entries back to back, each
//! `key | null flag | value`, where a flag of 1 means the value is
//! unset and no value bytes follow.

use std::collections::HashMap;
use std::hash::Hash;

use crate::errors::Error;
use crate::errors::Result;
use crate::state::serializer::read_u8;
use crate::state::TypeSerializer;

/// Separates key and namespace.
pub const MAGIC_NUMBER: u8 = 42;

const MAP_ENTRY_PRESENT: u8 = 0;
const MAP_ENTRY_NULL: u8 = 1;

pub fn serialize_key_and_namespace<K, N>(
    key: &K,
    key_serializer: &dyn TypeSerializer<K>,
    namespace: &N,
    namespace_serializer: &dyn TypeSerializer<N>,
) -> Vec<u8> {
    let mut out = Vec::new();
    key_serializer.serialize(key, &mut out);
    out.push(MAGIC_NUMBER);
    namespace_serializer.serialize(namespace, &mut out);
    out
}

/// Split into the raw key and namespace bytes, checking both decode.
pub(crate) fn split_key_and_namespace<'a, K, N>(
    bytes: &'a [u8],
    key_serializer: &dyn TypeSerializer<K>,
    namespace_serializer: &dyn TypeSerializer<N>,
) -> Result<(&'a [u8], &'a [u8])> {
    let mut input = bytes;
    key_serializer.deserialize(&mut input)?;
    let key = &bytes[..bytes.len() - input.len()];
    let magic = read_u8(&mut input)?;
    if magic != MAGIC_NUMBER {
        return Err(Error::serialization(format!(
            "unexpected magic number {magic} between key and namespace"
        )));
    }
    let namespace_start = bytes.len() - input.len();
    namespace_serializer.deserialize(&mut input)?;
    if !input.is_empty() {
        return Err(Error::serialization(format!(
            "{} trailing bytes after namespace",
            input.len()
        )));
    }
    Ok((key, &bytes[namespace_start..]))
}

pub fn deserialize_key_and_namespace<K, N>(
    bytes: &[u8],
    key_serializer: &dyn TypeSerializer<K>,
    namespace_serializer: &dyn TypeSerializer<N>,
) -> Result<(K, N)> {
    let mut input = bytes;
    let key = key_serializer.deserialize(&mut input)?;
    let magic = read_u8(&mut input)?;
    if magic != MAGIC_NUMBER {
        return Err(Error::serialization(format!(
            "unexpected magic number {magic} between key and namespace"
        )));
    }
    let namespace = namespace_serializer.deserialize(&mut input)?;
    if !input.is_empty() {
        return Err(Error::serialization(format!(
            "{} trailing bytes after namespace",
            input.len()
        )));
    }
    Ok((key, namespace))
}

pub fn serialize_value<T>(value: &T, serializer: &dyn TypeSerializer<T>) -> Vec<u8> {
    crate::state::to_bytes(serializer, value)
}

pub fn deserialize_value<T>(bytes: &[u8], serializer: &dyn TypeSerializer<T>) -> Result<T> {
    crate::state::from_bytes(serializer, bytes)
}

pub fn serialize_list<T>(values: &[T], serializer: &dyn TypeSerializer<T>) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        serializer.serialize(value, &mut out);
    }
    out
}

/// Decode elements until the bytes run out.
pub fn deserialize_list<T>(bytes: &[u8], serializer: &dyn TypeSerializer<T>) -> Result<Vec<T>> {
    let mut input = bytes;
    let mut values = Vec::new();
    while !input.is_empty() {
        values.push(serializer.deserialize(&mut input)?);
    }
    Ok(values)
}

pub fn serialize_map<'a, K: 'a, V: 'a>(
    entries: impl IntoIterator<Item = (&'a K, Option<&'a V>)>,
    key_serializer: &dyn TypeSerializer<K>,
    value_serializer: &dyn TypeSerializer<V>,
) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in entries {
        key_serializer.serialize(key, &mut out);
        match value {
            Some(value) => {
                out.push(MAP_ENTRY_PRESENT);
                value_serializer.serialize(value, &mut out);
            }
            None => out.push(MAP_ENTRY_NULL),
        }
    }
    out
}

/// Decode entries until the bytes run out.
///
/// Unset values decode as [`None`].
pub fn deserialize_map<K: Eq + Hash, V>(
    bytes: &[u8],
    key_serializer: &dyn TypeSerializer<K>,
    value_serializer: &dyn TypeSerializer<V>,
) -> Result<HashMap<K, Option<V>>> {
    let mut input = bytes;
    let mut entries = HashMap::new();
    while !input.is_empty() {
        let key = key_serializer.deserialize(&mut input)?;
        let value = match read_u8(&mut input)? {
            MAP_ENTRY_PRESENT => Some(value_serializer.deserialize(&mut input)?),
            MAP_ENTRY_NULL => None,
            flag => {
                return Err(Error::serialization(format!(
                    "invalid map entry null flag {flag}"
                )))
            }
        };
        entries.insert(key, value);
    }
    Ok(entries)
}

/// Wire form of a list whose elements are already serialized.
pub(crate) fn concat_raw_list<'a>(elements: impl Iterator<Item = &'a [u8]>) -> Vec<u8> {
    elements.flatten().copied().collect()
}

/// Wire form of a map whose keys and values are already serialized.
pub(crate) fn concat_raw_map_entries<'a>(
    entries: impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)>,
) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in entries {
        out.extend_from_slice(key);
        match value {
            Some(value) => {
                out.push(MAP_ENTRY_PRESENT);
                out.extend_from_slice(value);
            }
            None => out.push(MAP_ENTRY_NULL),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeyGroupRange;
    use crate::state::*;

    #[test]
    fn key_and_namespace_round_trip() {
        let bytes =
            serialize_key_and_namespace(&7i64, &I64Serializer, &VoidNamespace, &VoidNamespaceSerializer);
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 7, 42, 0]);
        let (key, ns) =
            deserialize_key_and_namespace(&bytes, &I64Serializer, &VoidNamespaceSerializer).unwrap();
        assert_eq!(key, 7);
        assert_eq!(ns, VoidNamespace);
    }

    #[test]
    fn bad_magic_number_errors() {
        let bytes = vec![0, 0, 0, 0, 0, 0, 0, 7, 41, 0];
        assert!(
            deserialize_key_and_namespace(&bytes, &I64Serializer, &VoidNamespaceSerializer)
                .is_err()
        );
        assert!(split_key_and_namespace(&bytes, &I64Serializer, &VoidNamespaceSerializer).is_err());
    }

    #[test]
    fn map_null_values() {
        let one = "one".to_owned();
        let entries = [(&1i64, Some(&one)), (&2i64, None)];
        let bytes = serialize_map(entries, &I64Serializer, &StringSerializer);
        let found = deserialize_map(&bytes, &I64Serializer, &StringSerializer).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&1], Some(one));
        assert_eq!(found[&2], None);
    }

    #[test]
    fn truncated_list_errors() {
        let bytes = serialize_list(&[1i64, 2], &I64Serializer);
        assert!(deserialize_list(&bytes[..12], &I64Serializer).is_err());
    }

    #[test]
    fn empty_collections() {
        let bytes = serialize_list::<i64>(&[], &I64Serializer);
        assert!(bytes.is_empty());
        assert!(deserialize_list(&[], &I64Serializer).unwrap().is_empty());

        let empty: [(&i64, Option<&String>); 0] = [];
        let bytes = serialize_map(empty, &I64Serializer, &StringSerializer);
        assert!(bytes.is_empty());
        assert!(deserialize_map(&bytes, &I64Serializer, &StringSerializer)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reserved_bytes_in_values_pass_through() {
        let reserved: Vec<u8> = vec![MAGIC_NUMBER, MAP_ENTRY_PRESENT, MAP_ENTRY_NULL, 42, 0, 1];
        let text = String::from_utf8(reserved.clone()).unwrap();

        let bytes =
            serialize_key_and_namespace(&reserved, &BytesSerializer, &text, &StringSerializer);
        let (key, ns) =
            deserialize_key_and_namespace(&bytes, &BytesSerializer, &StringSerializer).unwrap();
        assert_eq!(key, reserved);
        assert_eq!(ns, text);
        let (raw_key, raw_ns) =
            split_key_and_namespace(&bytes, &BytesSerializer, &StringSerializer).unwrap();
        assert_eq!(raw_key, to_bytes(&BytesSerializer, &reserved).as_slice());
        assert_eq!(raw_ns, to_bytes(&StringSerializer, &text).as_slice());

        let list = vec![reserved.clone(), Vec::new(), vec![MAGIC_NUMBER]];
        let bytes = serialize_list(&list, &BytesSerializer);
        assert_eq!(deserialize_list(&bytes, &BytesSerializer).unwrap(), list);

        let empty = String::new();
        let entries = [(&text, Some(&reserved)), (&empty, None)];
        let bytes = serialize_map(entries, &StringSerializer, &BytesSerializer);
        let found = deserialize_map(&bytes, &StringSerializer, &BytesSerializer).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&text], Some(reserved.clone()));
        assert_eq!(found[""], None);

        assert_eq!(
            deserialize_value(&serialize_value(&text, &StringSerializer), &StringSerializer)
                .unwrap(),
            text
        );
    }

    fn backends(dir: &std::path::Path) -> Vec<KeyedStateBackend<i64>> {
        vec![
            KeyedStateBackend::heap(I64Serializer, 128, KeyGroupRange::all(128)),
            KeyedStateBackend::sqlite(
                I64Serializer,
                128,
                KeyGroupRange::all(128),
                &dir.join("sqlite"),
            )
            .unwrap(),
        ]
    }

    #[test]
    fn list_serialization_through_backends() {
        let dir = tempfile::tempdir().unwrap();
        let key = 0i64;
        let desc = ListStateDescriptor::new("test", I64Serializer);
        let kn =
            serialize_key_and_namespace(&key, &I64Serializer, &VoidNamespace, &VoidNamespaceSerializer);
        let mut wires = Vec::new();
        for mut backend in backends(dir.path()) {
            backend.set_current_key(&key).unwrap();
            let ns = Namespace::void();

            // Nothing stored yet.
            backend.get_or_create_list_state(&ns, &desc).unwrap();
            assert_eq!(
                backend
                    .get_serialized_value("test", &kn, &VoidNamespaceSerializer)
                    .unwrap(),
                None
            );

            let mut expected = Vec::new();
            let mut state = backend.get_or_create_list_state(&ns, &desc).unwrap();
            for _ in 0..1024 {
                let v = fastrand::i64(..);
                state.add(&v).unwrap();
                expected.push(v);
            }
            let wire = backend
                .get_serialized_value("test", &kn, &VoidNamespaceSerializer)
                .unwrap()
                .unwrap();
            assert_eq!(deserialize_list(&wire, &I64Serializer).unwrap(), expected);
            assert_eq!(wire, serialize_list(&expected, &I64Serializer));

            // Empty the list and re-fill to compare stores.
            let mut state = backend.get_or_create_list_state(&ns, &desc).unwrap();
            state.update(&[3, 1, 2]).unwrap();
            wires.push(
                backend
                    .get_serialized_value("test", &kn, &VoidNamespaceSerializer)
                    .unwrap(),
            );
            backend.dispose().unwrap();
        }
        assert_eq!(wires[0], wires[1]);
    }

    #[test]
    fn map_serialization_through_backends() {
        let dir = tempfile::tempdir().unwrap();
        let key = 0i64;
        let desc = MapStateDescriptor::new("test", I64Serializer, StringSerializer);
        let kn =
            serialize_key_and_namespace(&key, &I64Serializer, &VoidNamespace, &VoidNamespaceSerializer);
        let mut wires = Vec::new();
        for mut backend in backends(dir.path()) {
            backend.set_current_key(&key).unwrap();
            let ns = Namespace::void();
            let mut expected = HashMap::new();
            let mut state = backend.get_or_create_map_state(&ns, &desc).unwrap();
            for i in 0..1024i64 {
                let value = format!("{}", fastrand::u64(..));
                state.put(&i, &value).unwrap();
                expected.insert(i, Some(value));
            }
            // Overwrite one entry.
            state.put(&7, &"seven".to_owned()).unwrap();
            expected.insert(7, Some("seven".to_owned()));

            let wire = backend
                .get_serialized_value("test", &kn, &VoidNamespaceSerializer)
                .unwrap()
                .unwrap();
            let found = deserialize_map(&wire, &I64Serializer, &StringSerializer).unwrap();
            assert_eq!(found, expected);

            let mut state = backend.get_or_create_map_state(&ns, &desc).unwrap();
            state.clear().unwrap();
            state.put(&1, &"a".to_owned()).unwrap();
            state.put(&-1, &"b".to_owned()).unwrap();
            wires.push(
                backend
                    .get_serialized_value("test", &kn, &VoidNamespaceSerializer)
                    .unwrap(),
            );
            backend.dispose().unwrap();
        }
        assert_eq!(wires[0], wires[1]);
    }
}
