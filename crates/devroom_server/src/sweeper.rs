//! Room lifecycle background work
//!
//! Two periodic passes (expired rate-limit windows, ghost rooms) and the
//! one-shot grace timer that deletes a room after its last member leaves.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::hub::RoomHub;
use crate::room::{DeletionReason, RoomRegistry};

/// Delete `room_id` after `grace` unless someone joined in the meantime.
///
/// The returned handle is stored on the room; a join aborts it. Emptiness is
/// re-checked when the timer fires regardless.
pub fn schedule_room_deletion(
    rooms: Arc<RoomRegistry>,
    room_id: String,
    grace: Duration,
) -> AbortHandle {
    debug!(room = %room_id, grace_secs = grace.as_secs(), "Room deletion scheduled");

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if !rooms.delete_if(&room_id, DeletionReason::Empty, |room| room.roster.is_empty()) {
            debug!(room = %room_id, "Grace timer fired for a room that is gone or occupied");
        }
    })
    .abort_handle()
}

/// Periodically evict rooms that were created but never joined.
pub async fn ghost_room_loop(
    hub: Arc<RoomHub>,
    interval: Duration,
    max_age: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = hub.sweep_ghost_rooms(Instant::now(), max_age);
                if removed > 0 {
                    info!(removed = removed, "🧹 Swept ghost rooms");
                }
            }
            _ = shutdown.recv() => {
                debug!("Ghost room sweeper stopping");
                break;
            }
        }
    }
}

/// Periodically evict rate-limit windows that have expired.
pub async fn rate_limit_loop(
    hub: Arc<RoomHub>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = hub.sweep_rate_limits(Instant::now());
                if removed > 0 {
                    debug!(removed = removed, "Evicted expired rate-limit windows");
                }
            }
            _ = shutdown.recv() => {
                debug!("Rate-limit sweeper stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_deletion_removes_empty_room() {
        let rooms = Arc::new(RoomRegistry::new(10, 20));
        rooms.create("lonely").unwrap();

        let handle = schedule_room_deletion(rooms.clone(), "lonely".into(), Duration::from_secs(60));
        rooms.with_room_mut("lonely", |room| room.set_pending_deletion(handle));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rooms.exists("lonely"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!rooms.exists("lonely"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_deletion_skips_occupied_room() {
        let rooms = Arc::new(RoomRegistry::new(10, 20));
        rooms.create("busy").unwrap();

        let _handle = schedule_room_deletion(rooms.clone(), "busy".into(), Duration::from_secs(60));
        rooms.with_room_mut("busy", |room| {
            room.roster.insert(uuid::Uuid::new_v4(), "ada".into());
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(rooms.exists("busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_deletion_never_fires() {
        let rooms = Arc::new(RoomRegistry::new(10, 20));
        rooms.create("saved").unwrap();

        let handle = schedule_room_deletion(rooms.clone(), "saved".into(), Duration::from_secs(60));
        rooms.with_room_mut("saved", |room| room.set_pending_deletion(handle));
        assert_eq!(rooms.with_room_mut("saved", |room| room.cancel_pending_deletion()), Some(true));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rooms.exists("saved"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_loops_stop_on_shutdown() {
        let hub = Arc::new(RoomHub::new(Arc::new(crate::config::Config::default())));
        let (tx, _) = broadcast::channel(1);

        let ghost = tokio::spawn(ghost_room_loop(
            hub.clone(),
            Duration::from_secs(60),
            Duration::from_secs(300),
            tx.subscribe(),
        ));
        let limits = tokio::spawn(rate_limit_loop(hub, Duration::from_secs(600), tx.subscribe()));

        tx.send(()).unwrap();
        ghost.await.unwrap();
        limits.await.unwrap();
    }
}
