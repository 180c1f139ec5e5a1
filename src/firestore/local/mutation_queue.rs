use crate::firestore::collection::{DocumentKeySet, SortedMap, SortedSet};
use crate::firestore::core::query::Query;
use crate::firestore::local::persistence::PersistenceWrite;
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::util::hard_assert;

/// Pending write batches of one user, in batch id order.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_key: String,
    batches: SortedMap<BatchId, MutationBatch>,
    batches_by_document_key: SortedSet<(DocumentKey, BatchId)>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
    changes: Vec<PersistenceWrite>,
}

impl MutationQueue {
    pub fn new(user_key: impl Into<String>) -> Self {
        Self {
            user_key: user_key.into(),
            batches: SortedMap::new(),
            batches_by_document_key: SortedSet::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            changes: Vec::new(),
        }
    }

    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Appends a batch with the next batch id. Ids are never reused.
    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        hard_assert(!mutations.is_empty(), "Mutation batches should not be empty");
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        self.insert_batch(batch.clone());
        self.changes.push(PersistenceWrite::AddMutationBatch {
            user: self.user_key.clone(),
            batch: batch.clone(),
        });
        batch
    }

    fn insert_batch(&mut self, batch: MutationBatch) {
        for mutation in &batch.mutations {
            self.batches_by_document_key = self
                .batches_by_document_key
                .insert((mutation.key.clone(), batch.batch_id));
        }
        self.batches = self.batches.insert(batch.batch_id, batch);
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// First batch with an id greater than `after`; `None` starts at the head.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        after: Option<BatchId>,
    ) -> Option<&MutationBatch> {
        let start = after.map_or(BatchId::MIN, |id| id.saturating_add(1));
        self.batches.iter_from(&start).next().map(|(_, batch)| batch)
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches.max_key().copied().unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.batches.values().cloned().collect()
    }

    pub fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.batch_ids_for_key(key)
            .into_iter()
            .filter_map(|batch_id| self.batches.get(&batch_id).cloned())
            .collect()
    }

    /// Batches touching any of `keys`, ordered by batch id without duplicates.
    pub fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &DocumentKeySet,
    ) -> Vec<MutationBatch> {
        let mut ids = SortedSet::new();
        for key in keys.iter() {
            for batch_id in self.batch_ids_for_key(key) {
                ids = ids.insert(batch_id);
            }
        }
        ids.iter()
            .filter_map(|batch_id| self.batches.get(batch_id).cloned())
            .collect()
    }

    /// Batches touching documents directly inside the query's collection.
    pub fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let collection = query.path();
        let mut ids = SortedSet::new();
        if let Ok(start) = DocumentKey::from_path(collection.child([""])) {
            for (key, batch_id) in self.batches_by_document_key.iter_from(&(start, BatchId::MIN)) {
                if !collection.is_prefix_of(key.path()) {
                    break;
                }
                if key.path().len() == collection.len() + 1 {
                    ids = ids.insert(*batch_id);
                }
            }
        }
        ids.iter()
            .filter_map(|batch_id| self.batches.get(batch_id).cloned())
            .collect()
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> Vec<BatchId> {
        self.batches_by_document_key
            .iter_from(&(key.clone(), BatchId::MIN))
            .take_while(|(candidate, _)| candidate == key)
            .map(|(_, batch_id)| *batch_id)
            .collect()
    }

    /// Records the stream token of an acknowledgement. Only the oldest batch
    /// can be acknowledged.
    pub fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) {
        hard_assert(
            self.batches.min_key() == Some(&batch.batch_id),
            "Can only acknowledge the first batch in the mutation queue",
        );
        self.set_last_stream_token(stream_token);
    }

    /// Removes `batch`; a batch leaves the queue exactly once.
    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) {
        hard_assert(
            self.batches.contains_key(&batch.batch_id),
            format!("Cannot remove unknown mutation batch {}", batch.batch_id),
        );
        for mutation in &batch.mutations {
            self.batches_by_document_key = self
                .batches_by_document_key
                .remove(&(mutation.key.clone(), batch.batch_id));
        }
        self.batches = self.batches.remove(&batch.batch_id);
        self.changes.push(PersistenceWrite::RemoveMutationBatch {
            user: self.user_key.clone(),
            batch_id: batch.batch_id,
        });
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.changes.push(PersistenceWrite::SetLastStreamToken {
            user: self.user_key.clone(),
            token: token.clone(),
        });
        self.last_stream_token = token;
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        !self.batch_ids_for_key(key).is_empty()
    }

    pub(crate) fn take_changes(&mut self) -> Vec<PersistenceWrite> {
        std::mem::take(&mut self.changes)
    }

    /// Rebuilds a queue; ids continue after `highest_batch_id` even when every
    /// batch up to it was already removed.
    pub(crate) fn restore(
        user_key: impl Into<String>,
        batches: impl IntoIterator<Item = MutationBatch>,
        highest_batch_id: BatchId,
        last_stream_token: Vec<u8>,
    ) -> Self {
        let mut queue = Self::new(user_key);
        queue.next_batch_id = queue.next_batch_id.max(highest_batch_id + 1);
        for batch in batches {
            queue.next_batch_id = queue.next_batch_id.max(batch.batch_id + 1);
            queue.insert_batch(batch);
        }
        queue.last_stream_token = last_stream_token;
        queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::FirestoreValue;
    use crate::test_support::{delete_mutation, key, map, query, set_mutation};

    fn queue_with(batches: &[&[&str]]) -> MutationQueue {
        let mut queue = MutationQueue::new("alice");
        for keys in batches {
            let mutations = keys
                .iter()
                .map(|path| set_mutation(path, map(&[("v", FirestoreValue::from_integer(1))])))
                .collect();
            queue.add_mutation_batch(Timestamp::now(), Vec::new(), mutations);
        }
        queue
    }

    #[test]
    fn batch_ids_increase_and_are_not_reused() {
        let mut queue = queue_with(&[&["rooms/a"], &["rooms/b"]]);
        let first = queue.lookup_mutation_batch(1).cloned().unwrap();
        queue.acknowledge_batch(&first, vec![1]);
        queue.remove_mutation_batch(&first);
        let next = queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![delete_mutation("rooms/c")]);
        assert_eq!(next.batch_id, 3);
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), 3);
        assert_eq!(queue.last_stream_token(), &[1]);
    }

    #[test]
    fn finds_batches_by_key_and_query() {
        let queue = queue_with(&[&["rooms/a", "rooms/b"], &["rooms/a/msgs/1"], &["rooms/b"]]);
        let ids = |batches: Vec<MutationBatch>| batches.iter().map(|b| b.batch_id).collect::<Vec<_>>();
        assert_eq!(ids(queue.all_mutation_batches_affecting_document_key(&key("rooms/b"))), vec![1, 3]);
        assert_eq!(ids(queue.all_mutation_batches_affecting_query(&query("rooms"))), vec![1, 3]);
        assert_eq!(ids(queue.all_mutation_batches_affecting_query(&query("rooms/a/msgs"))), vec![2]);
        assert_eq!(queue.get_next_mutation_batch_after_batch_id(Some(1)).unwrap().batch_id, 2);
        assert_eq!(queue.get_next_mutation_batch_after_batch_id(None).unwrap().batch_id, 1);
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn removing_a_batch_twice_is_fatal() {
        let mut queue = queue_with(&[&["rooms/a"]]);
        let batch = queue.lookup_mutation_batch(1).cloned().unwrap();
        queue.remove_mutation_batch(&batch);
        queue.remove_mutation_batch(&batch);
    }
}
