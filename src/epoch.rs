//! Cancellation generations.

use tokio_util::sync::CancellationToken;

/// A cancellation generation handed to every tailer at spawn time.
///
/// Tailers keep the `Epoch` they were spawned with. Cancelling it stops all of
/// them at their next polling point; tailers spawned under [`Epoch::next`]
/// are unaffected.
#[derive(Clone, Debug, Default)]
pub struct Epoch {
    generation: u64,
    token: CancellationToken,
}

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, uncancelled epoch one generation later.
    pub fn next(&self) -> Self {
        Epoch {
            generation: self.generation + 1,
            token: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once this epoch is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::Epoch;

    #[test]
    fn test_next_is_independent() {
        let first = Epoch::new();
        let held_by_task = first.clone();
        let second = first.next();

        first.cancel();

        assert!(held_by_task.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(second.generation(), first.generation() + 1);
    }

    #[tokio::test]
    async fn test_cancelled_wakes() {
        let epoch = Epoch::new();
        let waiter = epoch.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        epoch.cancel();
        task.await.unwrap();
    }
}
