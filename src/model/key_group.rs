//! Key groups.
//!
//! A key group is the atomic unit of keyed state redistribution. Every
//! key hashes to exactly one of `max_parallelism` key groups, and each
//! parallel subtask owns a contiguous range of them. Rescaling moves
//! whole key groups between subtasks, never individual keys.

use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// Number of key groups used when a vertex does not say otherwise.
pub const DEFAULT_MAX_PARALLELISM: u32 = 128;

/// Which key group a key belongs to.
///
/// `serialized_key` must be the key serializer's output so every
/// subtask agrees on the assignment.
pub fn assign_to_key_group(serialized_key: &[u8], max_parallelism: u32) -> u32 {
    debug_assert!(max_parallelism > 0);
    (seahash::hash(serialized_key) % max_parallelism as u64) as u32
}

/// A contiguous inclusive range of key groups.
///
/// An empty range has `start > end`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGroupRange {
    start: u32,
    end: u32,
}

impl KeyGroupRange {
    pub const EMPTY: Self = Self { start: 1, end: 0 };

    pub fn new(start: u32, end: u32) -> Self {
        if start > end {
            Self::EMPTY
        } else {
            Self { start, end }
        }
    }

    /// The range covering every key group.
    pub fn all(max_parallelism: u32) -> Self {
        Self::new(0, max_parallelism.saturating_sub(1))
    }

    /// The key groups owned by `subtask_index` out of `parallelism`
    /// subtasks.
    ///
    /// Ranges for `0..parallelism` tile `[0, max_parallelism)` with no
    /// gaps and no overlap, and differ in size by at most one.
    pub fn for_subtask(max_parallelism: u32, parallelism: u32, subtask_index: u32) -> Self {
        assert!(
            parallelism > 0 && parallelism <= max_parallelism,
            "parallelism {parallelism} must be in 1..={max_parallelism}"
        );
        assert!(subtask_index < parallelism);
        let g = max_parallelism as u64;
        let p = parallelism as u64;
        let i = subtask_index as u64;
        let start = (i * g + p - 1) / p;
        let end = ((i + 1) * g + p - 1) / p - 1;
        Self::new(start as u32, end as u32)
    }

    /// Ranges for every subtask in order.
    pub fn all_for_parallelism(max_parallelism: u32, parallelism: u32) -> Vec<Self> {
        (0..parallelism)
            .map(|i| Self::for_subtask(max_parallelism, parallelism, i))
            .collect()
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Number of key groups in this range.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn contains(&self, key_group: u32) -> bool {
        self.start <= key_group && key_group <= self.end
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self::new(self.start.max(other.start), self.end.min(other.end))
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        // Empty ranges have start > end so this yields nothing.
        self.start..=self.end
    }
}

impl Display for KeyGroupRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "[]")
        } else {
            write!(f, "[{}, {}]", self.start, self.end)
        }
    }
}

#[test]
fn ranges_tile_all_key_groups() {
    for max in [1, 7, 128, 1000] {
        for parallelism in 1..=max.min(17) {
            let ranges = KeyGroupRange::all_for_parallelism(max, parallelism);
            let mut next = 0;
            let mut sizes = Vec::new();
            for range in &ranges {
                assert!(!range.is_empty(), "{max} {parallelism} {range}");
                assert_eq!(range.start(), next);
                next = range.end() + 1;
                sizes.push(range.len());
            }
            assert_eq!(next, max);
            let smallest = sizes.iter().min().unwrap();
            let largest = sizes.iter().max().unwrap();
            assert!(largest - smallest <= 1);
        }
    }
}

#[test]
fn ranges_for_four_subtasks() {
    let found = KeyGroupRange::all_for_parallelism(10, 4);
    assert_eq!(
        found,
        vec![
            KeyGroupRange::new(0, 2),
            KeyGroupRange::new(3, 4),
            KeyGroupRange::new(5, 7),
            KeyGroupRange::new(8, 9),
        ]
    );
}

#[test]
fn intersection_and_empty() {
    let a = KeyGroupRange::new(0, 63);
    let b = KeyGroupRange::new(32, 127);
    assert_eq!(a.intersection(&b), KeyGroupRange::new(32, 63));
    let c = KeyGroupRange::new(64, 127);
    let empty = a.intersection(&c);
    assert!(empty.is_empty());
    assert_eq!(empty.len(), 0);
    assert_eq!(empty.iter().count(), 0);
    assert_eq!(empty.to_string(), "[]");
}

#[test]
fn assignment_is_stable_and_bounded() {
    for key in 0u64..1000 {
        let kg = assign_to_key_group(&key.to_be_bytes(), 128);
        assert!(kg < 128);
        assert_eq!(kg, assign_to_key_group(&key.to_be_bytes(), 128));
    }
}
