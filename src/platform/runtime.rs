use std::future::Future;
use std::time::Duration;

/// Spawns a background task on the ambient tokio runtime.
///
/// Outside a runtime the task gets its own thread with a current-thread
/// runtime driving it to completion.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use tokio::runtime::{Builder, Handle};

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
        return;
    }

    std::thread::spawn(move || {
        match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(future),
            Err(err) => log::error!(target: "firestore::runtime", "failed to build tokio runtime: {err}"),
        }
    });
}

/// Waits for `duration`; returns immediately for a zero duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}
