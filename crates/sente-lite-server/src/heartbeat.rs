//! Heartbeat sweeper: a single background task that periodically checks
//! every connection's last-seen time and evicts anyone that's gone quiet,
//! rather than running one timer per connection.

use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::ServerState;

pub async fn run_sweeper(state: ServerState, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.heartbeat.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                sweep_once(&state).await;
            }
        }
    }
}

async fn sweep_once(state: &ServerState) {
    let idle_timeout = state.config.heartbeat.idle_timeout;
    let ids = state.connection_ids().await;
    let mut evicted = 0;
    for id in ids {
        let Some(conn) = state.connection(id).await else {
            continue;
        };
        let idle_for = conn.last_pong.lock().unwrap().elapsed();
        if idle_for > idle_timeout {
            warn!(conn_id = %id, ?idle_for, "evicting idle connection");
            conn.closer.notify_one();
            state.unregister_connection(id).await;
            evicted += 1;
        } else {
            let ping = sente_lite_wire::Envelope::fire_and_forget(sente_lite_wire::EventVector::new(
                sente_lite_wire::chsk::WS_PING,
            ));
            let _ = conn.outbound.try_send(ping);
        }
    }
    if evicted > 0 {
        info!(evicted, "heartbeat sweep evicted idle connections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::state::Connection;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn sweep_evicts_connections_past_the_idle_timeout() {
        let mut config = ServerConfig::default();
        config.heartbeat.idle_timeout = Duration::from_millis(10);
        let state = ServerState::new(config);

        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let conn = Arc::new(Connection {
            id: uuid::Uuid::new_v4(),
            opened_at: Instant::now(),
            last_seen: StdMutex::new(Instant::now()),
            last_pong: StdMutex::new(Instant::now() - Duration::from_secs(1)),
            outbound: tx,
            subscriptions: StdMutex::new(Default::default()),
            closer: tokio::sync::Notify::new(),
        });
        state.register_connection(Arc::clone(&conn)).await;

        sweep_once(&state).await;
        assert!(state.connection(conn.id).await.is_none());
    }
}
