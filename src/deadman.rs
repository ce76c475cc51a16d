//! Dead-man's-switch driver.
//!
//! Periodically refreshes a `cancelAllAfter` window on the exchange, which
//! cancels every open order if the client stops refreshing it (crash,
//! network partition).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::message::Command;

/// How often the switch is refreshed.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// The cancel-all cutoff pushed out on each refresh, in milliseconds.
pub const KEEPALIVE_CUTOFF_MS: u64 = 60_000;

/// Drive the switch until the session is cancelled or the transport closes.
pub(crate) async fn run(outbound: mpsc::Sender<serde_json::Value>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let keepalive = match serde_json::to_value(Command::cancel_all_after(KEEPALIVE_CUTOFF_MS)) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode keepalive");
                        break;
                    }
                };
                if outbound.send(keepalive).await.is_err() {
                    tracing::debug!("Transport closed; stopping dead man's switch");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_keepalives_emitted_on_interval() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(run(tx, cancel.clone()));

        // First refresh fires immediately, then one per interval.
        let expected = json!({"op": "cancelAllAfter", "args": 60000});
        assert_eq!(rx.recv().await.unwrap(), expected);

        tokio::time::advance(KEEPALIVE_INTERVAL).await;
        assert_eq!(rx.recv().await.unwrap(), expected);

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_transport_closes() {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(tx, cancel));

        drop(rx);
        tokio::time::advance(KEEPALIVE_INTERVAL).await;
        task.await.unwrap();
    }
}
