use std::time::Duration;

use tokio::sync::watch;

/// Forward the latest value of `input` once it has been quiet for `settle`.
///
/// Each new value restarts the timer, so a burst of edits yields a single
/// output. The forwarding task ends when either side is dropped. Must be
/// called from within a tokio runtime.
pub fn debounce<T>(mut input: watch::Receiver<T>, settle: Duration) -> watch::Receiver<T>
where
    T: Clone + Send + Sync + 'static,
{
    let initial = input.borrow_and_update().clone();
    let (tx, rx) = watch::channel(initial);

    tokio::spawn(async move {
        loop {
            if input.changed().await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    changed = input.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(settle) => break,
                }
            }
            let latest = input.borrow_and_update().clone();
            if tx.send(latest).is_err() {
                return;
            }
        }
    });

    rx
}
