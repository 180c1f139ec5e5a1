use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::core::user::User;
use crate::firestore::error::FirestoreResult;

/// Bearer credential attached to outbound requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

impl Token {
    pub fn new(value: impl Into<String>, user: User) -> Self {
        Self {
            value: value.into(),
            user,
        }
    }
}

pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync + 'static>;

/// Source of auth credentials consumed by the client.
///
/// Only the user id of a token is inspected; it partitions the per-user
/// mutation queue and overlays.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn get_token(&self) -> FirestoreResult<Option<Token>>;

    /// Forces the next `get_token` call to fetch a fresh token.
    fn invalidate_token(&self);

    /// Registers `on_change`, which must be called once with the current
    /// user and again on every user change.
    fn start(&self, queue: &AsyncQueue, on_change: CredentialChangeListener);

    fn shutdown(&self);
}

/// Provider for unauthenticated use: never yields a token.
#[derive(Default)]
pub struct EmptyCredentialsProvider {
    listener: Mutex<Option<CredentialChangeListener>>,
}

impl EmptyCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn start(&self, queue: &AsyncQueue, on_change: CredentialChangeListener) {
        if let Ok(mut listener) = self.listener.lock() {
            *listener = Some(Arc::clone(&on_change));
        }
        queue.enqueue_and_forget(async move {
            on_change(User::unauthenticated());
        });
    }

    fn shutdown(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            listener.take();
        }
    }
}

/// Provider with a fixed, swappable user; used by tests and embedders that
/// manage auth themselves.
pub struct StaticCredentialsProvider {
    state: Mutex<StaticState>,
}

struct StaticState {
    token: Option<Token>,
    invalidated: bool,
    listener: Option<CredentialChangeListener>,
    queue: Option<AsyncQueue>,
}

impl StaticCredentialsProvider {
    pub fn new(token: Option<Token>) -> Self {
        Self {
            state: Mutex::new(StaticState {
                token,
                invalidated: false,
                listener: None,
                queue: None,
            }),
        }
    }

    /// Replaces the token and notifies the registered listener on the queue.
    pub fn set_token(&self, token: Option<Token>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let user = token
            .as_ref()
            .map(|token| token.user.clone())
            .unwrap_or_else(User::unauthenticated);
        state.token = token;
        state.invalidated = false;
        if let (Some(listener), Some(queue)) = (state.listener.clone(), state.queue.clone()) {
            queue.enqueue_and_forget(async move { listener(user) });
        }
    }

    pub fn was_invalidated(&self) -> bool {
        self.state.lock().map_or(false, |state| state.invalidated)
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        Ok(self.state.lock().ok().and_then(|state| state.token.clone()))
    }

    fn invalidate_token(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.invalidated = true;
        }
    }

    fn start(&self, queue: &AsyncQueue, on_change: CredentialChangeListener) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let user = state
            .token
            .as_ref()
            .map(|token| token.user.clone())
            .unwrap_or_else(User::unauthenticated);
        state.listener = Some(Arc::clone(&on_change));
        state.queue = Some(queue.clone());
        queue.enqueue_and_forget(async move { on_change(user) });
    }

    fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.listener = None;
            state.queue = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn empty_provider_reports_unauthenticated_user() {
        let queue = AsyncQueue::new();
        let provider = EmptyCredentialsProvider::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.start(&queue, Arc::new(move |user| sink.lock().unwrap().push(user)));
        queue.enqueue(async {}).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![User::unauthenticated()]);
        assert!(provider.get_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn static_provider_notifies_on_user_change() {
        let queue = AsyncQueue::new();
        let provider = StaticCredentialsProvider::new(None);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.start(&queue, Arc::new(move |user| sink.lock().unwrap().push(user)));
        provider.set_token(Some(Token::new("abc", User::new("alice"))));
        queue.enqueue(async {}).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![User::unauthenticated(), User::new("alice")]
        );
        provider.invalidate_token();
        assert!(provider.was_invalidated());
    }
}
