use std::collections::BTreeMap;

use crate::firestore::value::FirestoreValue;

/// Map of field names to values, iterated in UTF-8 byte order of the keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub(crate) fn fields_mut(&mut self) -> &mut BTreeMap<String, FirestoreValue> {
        &mut self.fields
    }

    pub fn get(&self, key: &str) -> Option<&FirestoreValue> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_map_entries() {
        let mut map = BTreeMap::new();
        map.insert("foo".to_string(), FirestoreValue::from_integer(1));
        let value = MapValue::new(map.clone());
        assert_eq!(value.get("foo"), map.get("foo"));
    }
}
