use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::firestore::error::FirestoreError;

pub type NextFn<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;
pub type ErrorFn = Arc<dyn Fn(&FirestoreError) + Send + Sync + 'static>;

/// Callback pair handed to query listeners.
#[derive(Clone)]
pub struct Observer<T> {
    pub next: Option<NextFn<T>>,
    pub error: Option<ErrorFn>,
}

impl<T> Observer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.next = Some(Arc::new(callback));
        self
    }

    pub fn with_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FirestoreError) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(callback));
        self
    }

    pub(crate) fn notify_next(&self, value: &T) {
        if let Some(next) = &self.next {
            next(value);
        }
    }

    pub(crate) fn notify_error(&self, error: &FirestoreError) {
        if let Some(callback) = &self.error {
            callback(error);
        }
    }
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Self {
            next: None,
            error: None,
        }
    }
}

/// Observer wrapper that can be muted once the subscription has been dropped,
/// so events already queued for delivery become no-ops.
pub struct AsyncObserver<T> {
    observer: Observer<T>,
    muted: AtomicBool,
}

impl<T> AsyncObserver<T> {
    pub fn new(observer: Observer<T>) -> Self {
        Self {
            observer,
            muted: AtomicBool::new(false),
        }
    }

    pub fn next(&self, value: &T) {
        if !self.muted.load(Ordering::SeqCst) {
            self.observer.notify_next(value);
        }
    }

    pub fn error(&self, error: &FirestoreError) {
        if !self.muted.load(Ordering::SeqCst) {
            self.observer.notify_error(error);
        }
    }

    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }
}

pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn muted_observer_drops_events() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let observer = AsyncObserver::new(Observer::new().with_next(move |_: &i32| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        observer.next(&1);
        observer.mute();
        observer.next(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
