use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Count of handled notifications, shared between the handling task and
/// whoever waits for progress.
///
/// The count is published on a watch channel. The cancellation token is
/// triggered once the handling task stops, for whatever reason; waiters that
/// have not reached their threshold by then give up.
#[derive(Debug)]
pub struct NotificationCounter {
    count: watch::Sender<u64>,
    token: CancellationToken,
}

impl Default for NotificationCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationCounter {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Counter whose waiters are released when `token` is cancelled
    pub fn with_token(token: CancellationToken) -> Self {
        let (count, _) = watch::channel(0);
        NotificationCounter { count, token }
    }

    /// Record one handled notification and wake waiters; returns the new count
    pub fn increment(&self) -> u64 {
        let mut updated = 0;
        self.count.send_modify(|count| {
            *count += 1;
            updated = *count;
        });
        updated
    }

    pub fn get(&self) -> u64 {
        *self.count.borrow()
    }

    pub fn reached(&self, threshold: u64) -> bool {
        self.get() >= threshold
    }

    /// Receiver that observes every published count
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.count.subscribe()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Mark the handling as stopped and release every waiter
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until at least `threshold` notifications were handled
    pub async fn wait_for(&self, threshold: u64) -> Result<u64, Error> {
        let mut count = self.count.subscribe();
        tokio::select! {
            biased;
            reached = count.wait_for(|n| *n >= threshold) => {
                reached.map(|n| *n).map_err(|_| Error::Aborted)
            }
            _ = self.token.cancelled() => {
                // The last increment may race with the cancellation
                let count = self.get();
                if count >= threshold {
                    Ok(count)
                } else {
                    Err(Error::Aborted)
                }
            }
        }
    }
}
