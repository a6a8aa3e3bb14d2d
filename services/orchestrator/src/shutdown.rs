//! Process shutdown signal.

use tokio::sync::watch;

/// Resolve once shutdown is signalled or the sender is gone.
///
/// Safe to use as a `tokio::select!` branch in spawned loops: the output is
/// `()`, so no `watch::Ref` guard outlives the branch.
pub async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_resolves_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { signalled(&mut rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), signalled(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_while_running() {
        let (_tx, mut rx) = watch::channel(false);
        let fut = signalled(&mut rx);
        assert_send(&fut);
        assert!(tokio::time::timeout(Duration::from_millis(20), fut)
            .await
            .is_err());
    }
}
