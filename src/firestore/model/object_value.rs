use std::collections::BTreeMap;

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::values::{is_server_timestamp, is_vector_value};
use crate::firestore::value::FirestoreValue;

/// The field data of a document: a nested map addressed by [`FieldPath`]s.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_map(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn to_value(&self) -> FirestoreValue {
        FirestoreValue::from_map(self.fields.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            current = current.get(segment)?.as_map()?;
        }
        current.get(last)
    }

    /// Writes `value` at `path`, creating or replacing intermediate maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let parent = Self::parent_map_mut(&mut self.fields, parents);
        parent.insert(last.clone(), value);
    }

    /// Applies several writes at once; `None` deletes the field.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            match current.get_mut(segment).and_then(FirestoreValue::as_map_mut) {
                Some(next) => current = next,
                None => return,
            }
        }
        current.remove(last);
    }

    /// Leaf paths of the data. Empty maps, vectors and server timestamps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut mask = FieldMask::empty();
        collect_leaves(&self.fields, &FieldPath::empty(), &mut mask);
        mask
    }

    fn parent_map_mut<'a>(
        root: &'a mut BTreeMap<String, FirestoreValue>,
        segments: &[String],
    ) -> &'a mut BTreeMap<String, FirestoreValue> {
        let mut current = root;
        for segment in segments {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
            if entry.as_map().is_none() || is_leaf_map(entry) {
                *entry = FirestoreValue::from_map(BTreeMap::new());
            }
            current = match entry.as_map_mut() {
                Some(map) => map,
                None => unreachable!("entry was replaced with a map"),
            };
        }
        current
    }
}

fn is_leaf_map(value: &FirestoreValue) -> bool {
    is_server_timestamp(value) || is_vector_value(value)
}

fn collect_leaves(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &FieldPath,
    mask: &mut FieldMask,
) {
    for (key, value) in fields {
        let path = prefix.child(key.clone());
        match value.as_map() {
            Some(nested) if !nested.is_empty() && !is_leaf_map(value) => {
                collect_leaves(nested, &path, mask)
            }
            _ => mask.insert(path),
        }
    }
}

impl From<BTreeMap<String, FirestoreValue>> for ObjectValue {
    fn from(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::from_map(fields)
    }
}
