use std::fmt::{Debug, Formatter};

use crate::firestore::collection::sorted_map::{self, SortedMap};

/// Ordered, deduplicated set backed by a [`SortedMap`].
pub struct SortedSet<T> {
    map: SortedMap<T, ()>,
}

impl<T> SortedSet<T> {
    pub fn new() -> Self {
        Self {
            map: SortedMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.iter(),
        }
    }

    pub fn iter_rev(&self) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.iter_rev(),
        }
    }

    pub fn first(&self) -> Option<&T> {
        self.map.min_key()
    }

    pub fn last(&self) -> Option<&T> {
        self.map.max_key()
    }
}

impl<T: Ord> SortedSet<T> {
    pub fn contains(&self, value: &T) -> bool {
        self.map.contains_key(value)
    }

    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.map.index_of(value)
    }

    /// Ascending iteration from the first element `>= value`.
    pub fn iter_from(&self, value: &T) -> SetIter<'_, T> {
        SetIter {
            inner: self.map.iter_from(value),
        }
    }
}

impl<T: Ord + Clone> SortedSet<T> {
    #[must_use]
    pub fn insert(&self, value: T) -> Self {
        Self {
            map: self.map.insert(value, ()),
        }
    }

    #[must_use]
    pub fn remove(&self, value: &T) -> Self {
        Self {
            map: self.map.remove(value),
        }
    }

    /// Inserts the elements of the smaller set into the larger one.
    #[must_use]
    pub fn union(&self, other: &SortedSet<T>) -> Self {
        let (larger, smaller) = if self.len() >= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        smaller
            .iter()
            .fold(larger.clone(), |set, value| set.insert(value.clone()))
    }

    #[must_use]
    pub fn difference(&self, other: &SortedSet<T>) -> Self {
        other
            .iter()
            .fold(self.clone(), |set, value| set.remove(value))
    }

    pub fn check_invariants(&self) -> Result<usize, String> {
        self.map.check_invariants()
    }
}

pub struct SetIter<'a, T> {
    inner: sorted_map::Iter<'a, T, ()>,
}

impl<'a, T> Iterator for SetIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(value, _)| value)
    }
}

impl<T> Clone for SortedSet<T> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T> Default for SortedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug> Debug for SortedSet<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<T: PartialEq> PartialEq for SortedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl<T: Eq> Eq for SortedSet<T> {}

impl<T: Ord + Clone> FromIterator<T> for SortedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedSet::new(), |set, value| set.insert(value))
    }
}

impl<'a, T> IntoIterator for &'a SortedSet<T> {
    type Item = &'a T;
    type IntoIter = SetIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
