pub mod backoff;
pub mod bloom_filter;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use backoff::ExponentialBackoff;
pub use bloom_filter::{BloomFilter, BloomFilterError, BloomFilterErrorCode};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, StreamId, StreamKind, WatchTransport, MAX_PENDING_WRITES};
pub use remote_syncer::{box_remote_store_future, OnlineState, RemoteStoreFuture, RemoteSyncer};
pub use serializer::{JsonProtoSerializer, WriteResponse};
pub use watch_change::{
    decode_watch_change, BloomFilterPayload, DocumentWatchChange, ExistenceFilter,
    ExistenceFilterChange, TargetChangeState, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{
    BloomFilterApplication, TargetMetadataProvider, WatchChangeAggregator,
};
