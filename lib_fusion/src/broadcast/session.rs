use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;

use crate::core::shutdown::ActivityKind;
use crate::services::IngestionServices;

/// # Dashboard Session
///
/// Drives one dashboard connection until either side closes or shutdown
/// begins. Transport-agnostic: `inbound` yields text frames, `outbound`
/// accepts them.
///
/// ## Logic:
/// 1.  Holds a websocket activity slot for its whole lifetime.
/// 2.  Reads the latest stored sample through the store breaker; a failure
///     just means the broadcaster's own last sample is the only candidate.
/// 3.  Registers with the broadcaster, which picks the bootstrap frame, then
///     relays queued frames out and answers control frames until the
///     connection ends.
/// 4.  Deregisters on the way out, whatever the reason.
pub async fn run_dashboard_session<S, K>(services: Arc<IngestionServices>, mut inbound: S, mut outbound: K)
where
    S: Stream<Item = String> + Unpin,
    K: Sink<String> + Unpin,
{
    let _slot = services.shutdown.track(ActivityKind::WebsocketConnection);
    let token = services.shutdown.token();

    let store = Arc::clone(&services.store);
    let latest = match services
        .store_breaker
        .call(|| async move { store.get_latest_sample().await })
        .await
    {
        Ok(latest) => latest,
        Err(e) => {
            tracing::warn!(error = %e, "latest sample unavailable, starting dashboard without bootstrap");
            None
        }
    };

    let broadcaster = &services.broadcaster;
    let mut handle = broadcaster.add_subscriber(latest.as_ref());
    let id = handle.id();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(subscriber = id, "closing dashboard session for shutdown");
                break;
            }
            queued = handle.recv() => match queued {
                Some(msg) => {
                    if !send_json(&mut outbound, &*msg).await {
                        break;
                    }
                }
                // Dropped by the broadcaster after a failed send.
                None => break,
            },
            frame = inbound.next() => match frame {
                Some(text) => {
                    let reply = broadcaster.handle_control(id, &text);
                    if !send_json(&mut outbound, &reply).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    broadcaster.remove_subscriber(id);
    let _ = outbound.close().await;
}

/// Serializes `msg` and writes it. `false` means the connection is gone.
pub(crate) async fn send_json<K, T>(outbound: &mut K, msg: &T) -> bool
where
    K: Sink<String> + Unpin,
    T: Serialize + ?Sized,
{
    match serde_json::to_string(msg) {
        Ok(text) => outbound.send(text).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outbound frame");
            true
        }
    }
}
