use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::internal::events::RoomEvent;

/// A one-shot delayed event for the room actor.
///
/// Dropping the timer cancels it. An event that already fired may still be
/// queued, so handlers validate what they receive against current state.
pub(crate) struct Timer(JoinHandle<()>);

impl Timer {
    pub fn schedule(
        delay: Duration,
        tx: &mpsc::UnboundedSender<RoomEvent>,
        event: RoomEvent,
    ) -> Self {
        let tx = tx.clone();
        Timer(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // the room is gone when this fails
            let _ = tx.send(event);
        }))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.abort();
    }
}
