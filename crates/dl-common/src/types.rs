use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Per-domain filter flags stored in the blocklist table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterOptions(u8);

impl FilterOptions {
    pub const NONE: Self = Self(0);
    pub const BLOCKED: Self = Self(1);
    pub const IGNORED: Self = Self(1 << 1);
    pub const CUSTOM_A: Self = Self(1 << 2);
    pub const CUSTOM_B: Self = Self(1 << 3);

    const ALL: u8 = 0b1111;

    /// Build from a stored integer, dropping unknown bits.
    pub fn from_bits(bits: i64) -> Self {
        Self((bits as u8) & Self::ALL)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for FilterOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FilterOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for FilterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::BLOCKED, "blocked"),
            (Self::IGNORED, "ignored"),
            (Self::CUSTOM_A, "custom_a"),
            (Self::CUSTOM_B, "custom_b"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// Inclusive range of archive row ids. An empty range is `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub start: i64,
    pub end: i64,
}

impl RowRange {
    /// Returns `None` when `end < start`.
    pub fn new(start: i64, end: i64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        (self.end - self.start) as u64 + 1
    }

    pub fn contains(&self, row: i64) -> bool {
        row >= self.start && row <= self.end
    }

    /// Smallest range covering both.
    pub fn union(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn intersect(self, other: Self) -> Option<Self> {
        Self::new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Remove `other` where it overlaps one edge of `self`.
    ///
    /// A range strictly inside `self` cannot be removed without splitting it,
    /// so `self` is returned unchanged in that case.
    pub fn subtract_edge(self, other: Self) -> Option<Self> {
        let Some(overlap) = self.intersect(other) else {
            return Some(self);
        };
        if overlap == self {
            None
        } else if overlap.start == self.start {
            Self::new(overlap.end + 1, self.end)
        } else if overlap.end == self.end {
            Self::new(self.start, overlap.start - 1)
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..={}]", self.start, self.end)
    }
}

/// Log statistics for one grouped domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    pub total: i32,
    pub blocked: i32,
    pub last_modified: i64,
    pub options: Option<FilterOptions>,
}

impl DomainRecord {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            total: 0,
            blocked: 0,
            last_modified: 0,
            options: None,
        }
    }

    /// Fold `other` into `self`: counts are summed, the newer timestamp wins
    /// and existing options are only replaced when `other` has some.
    pub fn merge(&mut self, other: &DomainRecord) {
        self.total += other.total;
        self.blocked += other.blocked;
        self.last_modified = self.last_modified.max(other.last_modified);
        if other.options.is_some() {
            self.options = other.options;
        }
    }

    /// Inverse of `merge` for rows leaving the visible window.
    /// `last_modified` is kept since the archive is the only source for an
    /// older maximum.
    pub fn subtract(&mut self, other: &DomainRecord) {
        self.total = (self.total - other.total).max(0);
        self.blocked = (self.blocked - other.blocked).clamp(0, self.total);
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn is_blocked(&self) -> bool {
        self.options
            .is_some_and(|o| o.contains(FilterOptions::BLOCKED))
    }
}
