//! Identifiers.

use std::fmt::Display;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Define a 128 bit identifier which is displayed and serialized as
/// 32 lowercase hex digits.
macro_rules! hex_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u128);

        impl $name {
            /// A new random ID.
            pub fn random() -> Self {
                Self(fastrand::u128(..))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != 32 {
                    return Err(format!(
                        "{} must be 32 hex digits, got {s:?}",
                        stringify!($name)
                    ));
                }
                u128::from_str_radix(s, 16)
                    .map(Self)
                    .map_err(|err| format!("invalid {} {s:?}: {err}", stringify!($name)))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// Identifies one submitted job.
    ///
    /// Lives from submission until the job terminates. Resubmitting
    /// the same graph keeps the ID.
    JobId
);

hex_id!(
    /// Identifies one operator (a job vertex and the chain it runs).
    ///
    /// State in a checkpoint is keyed off of this, so it must be
    /// stable across resubmissions of the same job for restore to
    /// find its state again.
    OperatorId
);

impl OperatorId {
    /// Derive a stable ID from an operator name.
    pub fn from_name(name: &str) -> Self {
        let hi = seahash::hash_seeded(name.as_bytes(), 1, 2, 3, 4);
        let lo = seahash::hash_seeded(name.as_bytes(), 5, 6, 7, 8);
        Self(((hi as u128) << 64) | lo as u128)
    }
}

/// Index of one parallel instance of an operator.
///
/// The inner value will be less than the operator's parallelism.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubtaskIndex(pub u32);

impl Display for SubtaskIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Monotonically increasing ID of a checkpoint or savepoint attempt
/// within one job.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CheckpointId(pub u64);

impl Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[test]
fn hex_id_display_parse() {
    let id = JobId(0xabc);
    let s = id.to_string();
    assert_eq!(s, "00000000000000000000000000000abc");
    assert_eq!(s.parse::<JobId>(), Ok(id));
    assert!("abc".parse::<JobId>().is_err());
    assert!("zz000000000000000000000000000abc".parse::<JobId>().is_err());
}

#[test]
fn hex_id_serde_tokens() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    assert_tokens(
        &OperatorId(1),
        &[Token::Str("00000000000000000000000000000001")],
    );
    assert_tokens(
        &SubtaskIndex(3),
        &[Token::NewtypeStruct { name: "SubtaskIndex" }, Token::U32(3)],
    );
}

#[test]
fn operator_id_from_name_is_stable() {
    assert_eq!(OperatorId::from_name("map"), OperatorId::from_name("map"));
    assert_ne!(OperatorId::from_name("map"), OperatorId::from_name("filter"));
}
