//! Event roles and the per-batch role partition.

use std::{
    fmt,
    ops::{Index, IndexMut},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a single event, serialised with the dataset's integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Role {
    /// The event's cascade has not crossed the observation horizon yet (`-1`).
    Unobserved,
    /// Training cascade (`1`).
    Train,
    /// Validation cascade (`2`).
    Val,
    /// Test cascade (`3`).
    Test,
}

impl Role {
    /// Integer code used by dataset files.
    #[must_use]
    pub const fn code(self) -> i8 {
        match self {
            Self::Unobserved => -1,
            Self::Train => 1,
            Self::Val => 2,
            Self::Test => 3,
        }
    }

    /// The observed split this role belongs to, if any.
    #[must_use]
    pub const fn split(self) -> Option<Split> {
        match self {
            Self::Unobserved => None,
            Self::Train => Some(Split::Train),
            Self::Val => Some(Split::Val),
            Self::Test => Some(Split::Test),
        }
    }

    /// Whether the event carries a usable label.
    #[must_use]
    pub const fn is_observed(self) -> bool {
        !matches!(self, Self::Unobserved)
    }
}

/// Unknown role code found in a dataset.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown role code {0} (expected -1, 1, 2 or 3)")]
pub struct UnknownRole(pub i8);

impl TryFrom<i8> for Role {
    type Error = UnknownRole;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            -1 => Ok(Self::Unobserved),
            1 => Ok(Self::Train),
            2 => Ok(Self::Val),
            3 => Ok(Self::Test),
            other => Err(UnknownRole(other)),
        }
    }
}

impl From<Role> for i8 {
    fn from(role: Role) -> Self {
        role.code()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.split() {
            Some(split) => write!(f, "{split}"),
            None => write!(f, "unobserved"),
        }
    }
}

/// One of the three observed splits. Accumulators, losses and reports are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training split.
    Train,
    /// Validation split.
    Val,
    /// Test split.
    Test,
}

impl Split {
    /// Every split, in reporting order.
    pub const ALL: [Self; 3] = [Self::Train, Self::Val, Self::Test];

    /// Reporting label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }

    /// Role tagging events of this split.
    #[must_use]
    pub const fn role(self) -> Role {
        match self {
            Self::Train => Role::Train,
            Self::Val => Role::Val,
            Self::Test => Role::Test,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One value per observed split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerSplit<T> {
    /// Training value.
    pub train: T,
    /// Validation value.
    pub val: T,
    /// Test value.
    pub test: T,
}

impl<T> PerSplit<T> {
    /// Builds the three values from a function of the split.
    pub fn from_fn(mut f: impl FnMut(Split) -> T) -> Self {
        Self {
            train: f(Split::Train),
            val: f(Split::Val),
            test: f(Split::Test),
        }
    }

    /// Iterates `(split, value)` pairs in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (Split, &T)> {
        Split::ALL.into_iter().map(move |split| (split, &self[split]))
    }

    /// Maps every value.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> PerSplit<U> {
        PerSplit {
            train: f(self.train),
            val: f(self.val),
            test: f(self.test),
        }
    }
}

impl<T> Index<Split> for PerSplit<T> {
    type Output = T;

    fn index(&self, split: Split) -> &T {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }
}

impl<T> IndexMut<Split> for PerSplit<T> {
    fn index_mut(&mut self, split: Split) -> &mut T {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        }
    }
}

/// Boolean row selector over one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleMask(Vec<bool>);

impl RoleMask {
    /// Wraps raw bits.
    #[must_use]
    pub const fn new(bits: Vec<bool>) -> Self {
        Self(bits)
    }

    /// `(role != unobserved) & (role == target)` for every row.
    #[must_use]
    pub fn for_role(roles: &[Role], target: Role) -> Self {
        Self(
            roles
                .iter()
                .map(|role| role.is_observed() && *role == target)
                .collect(),
        )
    }

    /// Number of rows covered (selected or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the mask covers no rows at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of selected rows.
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.iter().filter(|bit| **bit).count()
    }

    /// Whether at least one row is selected.
    #[must_use]
    pub fn any(&self) -> bool {
        self.0.iter().any(|bit| *bit)
    }

    /// Whether row `index` is selected. Out-of-range rows are not.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    /// Raw bits.
    #[must_use]
    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    /// Indices of the selected rows, ascending.
    #[must_use]
    pub fn indices(&self) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(idx, bit)| bit.then_some(idx))
            .collect()
    }

    /// Row-wise OR. Masks must cover the same rows.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        debug_assert_eq!(self.len(), other.len());
        Self(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(left, right)| *left || *right)
                .collect(),
        )
    }

    /// Whether any row is selected by both masks.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.0.iter().zip(&other.0).any(|(left, right)| *left && *right)
    }

    /// Values at the selected rows.
    #[must_use]
    pub fn select<T: Copy>(&self, values: &[T]) -> Vec<T> {
        self.0
            .iter()
            .zip(values)
            .filter_map(|(bit, value)| bit.then_some(*value))
            .collect()
    }
}

/// Train/val/test masks of one batch.
pub type RolePartition = PerSplit<RoleMask>;

impl RolePartition {
    /// Computes the three masks for a batch's roles.
    #[must_use]
    pub fn from_roles(roles: &[Role]) -> Self {
        Self::from_fn(|split| RoleMask::for_role(roles, split.role()))
    }

    /// Union of the three observed masks.
    #[must_use]
    pub fn observed(&self) -> RoleMask {
        self.train.union(&self.val).union(&self.test)
    }

    /// Mask of one split.
    #[must_use]
    pub fn mask(&self, split: Split) -> &RoleMask {
        &self[split]
    }

    /// Rows of one split.
    #[must_use]
    pub fn count(&self, split: Split) -> usize {
        self[split].count()
    }

    /// Selected rows per split.
    #[must_use]
    pub fn counts(&self) -> PerSplit<usize> {
        PerSplit::from_fn(|split| self.count(split))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> Vec<Role> {
        vec![
            Role::Train,
            Role::Unobserved,
            Role::Val,
            Role::Test,
            Role::Train,
            Role::Unobserved,
        ]
    }

    #[test]
    fn partition_masks_are_disjoint() {
        let partition = RolePartition::from_roles(&roles());
        assert!(!partition.train.intersects(&partition.val));
        assert!(!partition.train.intersects(&partition.test));
        assert!(!partition.val.intersects(&partition.test));
    }

    #[test]
    fn observed_union_excludes_only_unobserved_rows() {
        let roles = roles();
        let observed = RolePartition::from_roles(&roles).observed();
        for (idx, role) in roles.iter().enumerate() {
            assert_eq!(observed.contains(idx), role.is_observed());
        }
        assert_eq!(observed.count(), 4);
    }

    #[test]
    fn role_codes_round_trip_through_json() {
        let encoded = serde_json::to_string(&roles()).unwrap();
        assert_eq!(encoded, "[1,-1,2,3,1,-1]");
        let decoded: Vec<Role> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, roles());
        assert!(serde_json::from_str::<Role>("4").is_err());
    }

    #[test]
    fn mask_selects_values() {
        let mask = RoleMask::for_role(&roles(), Role::Train);
        assert_eq!(mask.indices(), vec![0, 4]);
        assert_eq!(mask.select(&[10, 11, 12, 13, 14, 15]), vec![10, 14]);
        let partition = RolePartition::from_roles(&roles());
        assert_eq!(partition.counts().train, 2);
        assert_eq!(partition.count(Split::Test), 1);
        assert_eq!(partition.mask(Split::Val).indices(), vec![2]);
    }
}
