//! The connection pump: owns the event stream, drives the status machine
//! (`loading → live | offline | reconnecting | error`) and feeds events
//! into the live query. Holds only a weak reference between events so a
//! fully dropped query winds its pump down.

use std::sync::{atomic::Ordering, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use crate::livequery::{Directive, Inner, LiveQuery, QueryStatus};

pub(crate) fn spawn_pump(query: &LiveQuery) -> tokio::task::JoinHandle<()> {
    let weak = std::sync::Arc::downgrade(&query.0);
    tokio::spawn(run(weak))
}

fn upgrade(weak: &Weak<Inner>) -> Option<LiveQuery> { weak.upgrade().map(LiveQuery) }

async fn run(weak: Weak<Inner>) {
    let mut backoff = Duration::from_millis(250);

    loop {
        let (online, mut online_rx) = match upgrade(&weak) {
            Some(query) => {
                if query.is_destroyed() {
                    return;
                }
                (query.is_online(), query.0.online.clone())
            }
            None => return,
        };

        if !online {
            if let Some(query) = upgrade(&weak) {
                query.set_status(QueryStatus::Offline);
            }
            // wait for the host to signal connectivity
            if online_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        let (client, options) = match upgrade(&weak) {
            Some(query) => (query.0.client.clone(), query.subscribe_options()),
            None => return,
        };

        match client.subscribe(options).await {
            Err(e) => {
                let Some(query) = upgrade(&weak) else { return };
                if e.is_auth() {
                    query.0.coordinator.on_auth_error(&e);
                    query.set_status(if query.is_online() { QueryStatus::Reconnecting } else { QueryStatus::Offline });
                } else if e.is_retryable() {
                    query.set_status(if query.is_online() { QueryStatus::Reconnecting } else { QueryStatus::Offline });
                } else {
                    warn!("subscribe failed: {e}");
                    query.set_error(e); // status stays Error until a connect succeeds
                }
                drop(query);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
            Ok(mut stream) => {
                backoff = Duration::from_millis(250);
                {
                    let Some(query) = upgrade(&weak) else { return };
                    query.set_status(QueryStatus::Live);
                    // connectivity is back: drain mutations queued offline
                    query.flush_queued().await;
                }

                while let Some(event) = stream.recv().await {
                    let Some(query) = upgrade(&weak) else { return };
                    if query.0.destroyed.load(Ordering::SeqCst) {
                        return;
                    }
                    if query.apply_stream_event(event) == Directive::Resnapshot {
                        if let Err(e) = query.refresh().await {
                            warn!("resnapshot after invalidate failed: {e}");
                        }
                    }
                }

                let Some(query) = upgrade(&weak) else { return };
                if query.is_destroyed() {
                    return;
                }
                debug!("stream ended for {}", query.0.options.resource);
                query.set_status(if query.is_online() { QueryStatus::Reconnecting } else { QueryStatus::Offline });
            }
        }
    }
}
