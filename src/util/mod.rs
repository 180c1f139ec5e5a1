pub mod assert;
pub mod backoff;
pub mod subscribe;

pub use assert::{assertion_error, fail, hard_assert, SDK_VERSION};
pub use backoff::{jittered_delay, BackoffSettings};
pub use subscribe::{AsyncObserver, Observer, Unsubscribe};
