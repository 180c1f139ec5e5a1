use std::collections::BTreeSet;

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch or transform.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    pub fn union_with(&mut self, other: &FieldMask) {
        self.fields.extend(other.fields.iter().cloned());
    }

    /// `true` when `path` equals or is nested under one of the mask entries.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn covers_nested_paths() {
        let mask = FieldMask::new([path("a.b"), path("c")]);
        assert!(mask.covers(&path("a.b")));
        assert!(mask.covers(&path("a.b.c")));
        assert!(mask.covers(&path("c.d")));
        assert!(!mask.covers(&path("a")));
        assert!(!mask.covers(&path("d")));
    }

    #[test]
    fn deduplicates() {
        let mut mask = FieldMask::new([path("a")]);
        mask.union_with(&FieldMask::new([path("a"), path("b")]));
        assert_eq!(mask.len(), 2);
    }
}
