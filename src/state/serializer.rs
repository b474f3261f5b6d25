//! Type serializers.
//!
//! Serializers turn keys, namespaces and values into bytes. Both the
//! storage layout of the state stores and the queryable wire format
//! are defined in terms of these, so two serializers for the same type
//! must agree byte for byte.

use std::fmt::Debug;

use crate::errors::Error;
use crate::errors::Result;

/// Serializes values of `T`.
pub trait TypeSerializer<T>: Debug + Send + Sync {
    /// Append the bytes for `value` to `out`.
    fn serialize(&self, value: &T, out: &mut Vec<u8>);

    /// Read one value from the front of `input`, advancing it past the
    /// consumed bytes.
    fn deserialize(&self, input: &mut &[u8]) -> Result<T>;
}

/// Serialize a single value into a fresh buffer.
pub fn to_bytes<T>(serializer: &dyn TypeSerializer<T>, value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    serializer.serialize(value, &mut out);
    out
}

/// Deserialize exactly one value, erroring on trailing bytes.
pub fn from_bytes<T>(serializer: &dyn TypeSerializer<T>, bytes: &[u8]) -> Result<T> {
    let mut input = bytes;
    let value = serializer.deserialize(&mut input)?;
    if !input.is_empty() {
        return Err(Error::serialization(format!(
            "{} trailing bytes after value",
            input.len()
        )));
    }
    Ok(value)
}

/// Split `n` bytes off the front of `input`.
pub(crate) fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(Error::serialization(format!(
            "needed {n} bytes but only {} remain",
            input.len()
        )));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

pub(crate) fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N]> {
    let mut arr = [0; N];
    arr.copy_from_slice(take(input, N)?);
    Ok(arr)
}

pub(crate) fn read_u8(input: &mut &[u8]) -> Result<u8> {
    Ok(take_array::<1>(input)?[0])
}

pub(crate) fn read_u16(input: &mut &[u8]) -> Result<u16> {
    take_array(input).map(u16::from_be_bytes)
}

pub(crate) fn read_u32(input: &mut &[u8]) -> Result<u32> {
    take_array(input).map(u32::from_be_bytes)
}

pub(crate) fn read_u64(input: &mut &[u8]) -> Result<u64> {
    take_array(input).map(u64::from_be_bytes)
}

/// Write a `u32` big endian length prefix and then the bytes.
pub(crate) fn write_len_prefixed(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

pub(crate) fn read_len_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_u32(input)? as usize;
    take(input, len)
}

/// Big endian 4 byte integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct I32Serializer;

impl TypeSerializer<i32> for I32Serializer {
    fn serialize(&self, value: &i32, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<i32> {
        take_array(input).map(i32::from_be_bytes)
    }
}

/// Big endian 8 byte integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Serializer;

impl TypeSerializer<i64> for I64Serializer {
    fn serialize(&self, value: &i64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<i64> {
        take_array(input).map(i64::from_be_bytes)
    }
}

/// One byte, 0 or 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolSerializer;

impl TypeSerializer<bool> for BoolSerializer {
    fn serialize(&self, value: &bool, out: &mut Vec<u8>) {
        out.push(u8::from(*value));
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<bool> {
        match read_u8(input)? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(Error::serialization(format!("invalid bool byte {b}"))),
        }
    }
}

/// UTF-8 with a 4 byte big endian length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl TypeSerializer<String> for StringSerializer {
    fn serialize(&self, value: &String, out: &mut Vec<u8>) {
        write_len_prefixed(value.as_bytes(), out);
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<String> {
        let bytes = read_len_prefixed(input)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| Error::serialization(format!("invalid UTF-8 string: {err}")))
    }
}

/// Raw bytes with a 4 byte big endian length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl TypeSerializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>, out: &mut Vec<u8>) {
        write_len_prefixed(value, out);
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<Vec<u8>> {
        read_len_prefixed(input).map(<[u8]>::to_vec)
    }
}

/// The namespace of state that is not scoped to anything finer than
/// the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VoidNamespace;

/// Always exactly one zero byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoidNamespaceSerializer;

impl TypeSerializer<VoidNamespace> for VoidNamespaceSerializer {
    fn serialize(&self, _value: &VoidNamespace, out: &mut Vec<u8>) {
        out.push(0);
    }

    fn deserialize(&self, input: &mut &[u8]) -> Result<VoidNamespace> {
        match read_u8(input)? {
            0 => Ok(VoidNamespace),
            b => Err(Error::serialization(format!(
                "invalid void namespace byte {b}"
            ))),
        }
    }
}

#[test]
fn integers_are_big_endian() {
    assert_eq!(to_bytes(&I64Serializer, &1i64), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    assert_eq!(to_bytes(&I32Serializer, &-1i32), vec![0xff; 4]);
    assert_eq!(from_bytes(&I64Serializer, &[0, 0, 0, 0, 0, 0, 1, 0]).unwrap(), 256);
}

#[test]
fn strings_are_length_prefixed() {
    let bytes = to_bytes(&StringSerializer, &"héllo".to_owned());
    assert_eq!(&bytes[..4], &[0, 0, 0, 6]);
    assert_eq!(from_bytes(&StringSerializer, &bytes).unwrap(), "héllo");
    assert!(from_bytes(&StringSerializer, &bytes[..5]).is_err());
}

#[test]
fn deserialize_advances_input() {
    let mut buf = Vec::new();
    I32Serializer.serialize(&7, &mut buf);
    BoolSerializer.serialize(&true, &mut buf);
    VoidNamespaceSerializer.serialize(&VoidNamespace, &mut buf);
    let mut input = buf.as_slice();
    assert_eq!(I32Serializer.deserialize(&mut input).unwrap(), 7);
    assert!(BoolSerializer.deserialize(&mut input).unwrap());
    assert_eq!(
        VoidNamespaceSerializer.deserialize(&mut input).unwrap(),
        VoidNamespace
    );
    assert!(input.is_empty());
    assert!(I32Serializer.deserialize(&mut input).is_err());
}

#[test]
fn trailing_bytes_are_an_error() {
    assert!(from_bytes(&BoolSerializer, &[1, 0]).is_err());
    assert!(from_bytes(&BoolSerializer, &[2]).is_err());
}
