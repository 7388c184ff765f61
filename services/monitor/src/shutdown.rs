use tokio::sync::watch;

/// Resolves once the signal reads true or its sender is gone
pub(crate) async fn requested(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}
