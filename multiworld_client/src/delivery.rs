// Ordered item delivery into device memory.
//
// `DeliveryLoop::deliver_pending()` drains the item queue into the game's
// pending-item slot, one item at a time:
//
//   1. Nothing to do if paused, the queue is empty, or another pass holds
//      the receiving flag.
//   2. Claim the receiving flag; the device poller stands down.
//   3. Wait for an in-game mode (bounded by `ready_timeout`).
//   4. For each queued item, lowest sequence key first:
//        a. wait until the game has taken the previous item (bounded by
//           `consume_timeout`),
//        b. require `key == device cursor + 1`, else drop the item,
//        c. write `[seq_hi, seq_lo, item_id, from_player]` to the slot,
//        d. settle.
//   5. Settle once more after the last write, then release the flag.
//
// Ordering is enforced at the device: the cursor comes from the slot's own
// first two bytes, not from anything the client remembers, so a key the
// game already took (`<= cursor`) or one that would skip ahead is never
// written. A skipped-ahead item is only out of this pass: it is counted in
// `DeliveryReport::deferred` and the coordinator re-projects the queue from
// the event log, so it is written once the keys before it have landed.
//
// Every device call goes through `TimedDevice`, bounded by
// `device_timeout`. The state lock held across the write is released within
// that bound even if the device stops answering.
//
// Cancellation: the pass captures `SessionState::epoch` when it starts and
// checks it between every device operation. A forced reconnect bumps the
// epoch under the state lock, and the write itself happens under that same
// lock, so a reconnect either lands before a write (which then never
// happens) or after it (which completes).

use std::sync::Arc;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::device::{
    DeviceChannel, PENDING_ITEM, PendingSlot, TimedDevice, encode_delivery, read_game_mode,
    read_pending_slot,
};
use crate::state::{ReceivingFlag, SharedState};

/// Why a delivery pass ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Drained,
    Paused,
    /// A reconnect started while the pass was running.
    Superseded,
    /// The game never reached an in-game mode.
    NotReady,
    /// The game never took the previous item.
    ConsumeTimeout,
    Device(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    pub written: usize,
    /// Keys the game already took.
    pub dropped: usize,
    /// Keys ahead of `cursor + 1`, left for a later pass.
    pub deferred: usize,
    pub stop: StopReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Paused or nothing queued.
    Idle,
    /// Another pass holds the receiving flag.
    AlreadyRunning,
    Ran(DeliveryReport),
}

pub struct DeliveryLoop {
    device: Arc<dyn DeviceChannel>,
    state: SharedState,
    receiving: ReceivingFlag,
    timing: TimingConfig,
}

impl DeliveryLoop {
    pub fn new(
        device: Arc<dyn DeviceChannel>,
        state: SharedState,
        receiving: ReceivingFlag,
        timing: TimingConfig,
    ) -> Self {
        Self {
            device: TimedDevice::wrap(device, timing.device_timeout()),
            state,
            receiving,
            timing,
        }
    }

    pub async fn deliver_pending(&self) -> DeliveryOutcome {
        let epoch = {
            let state = self.state.lock().await;
            if state.paused || state.queue.is_empty() {
                return DeliveryOutcome::Idle;
            }
            state.epoch
        };
        let Some(guard) = self.receiving.try_acquire() else {
            return DeliveryOutcome::AlreadyRunning;
        };

        let report = self.run(epoch).await;
        if report.written > 0 {
            sleep(self.timing.drain_settle()).await;
        }
        drop(guard);

        match &report.stop {
            StopReason::Drained | StopReason::Paused | StopReason::Superseded => {
                debug!(?report, "delivery pass finished");
            }
            _ => warn!(?report, "delivery pass abandoned"),
        }
        DeliveryOutcome::Ran(report)
    }

    async fn run(&self, epoch: u64) -> DeliveryReport {
        let mut written = 0;
        let mut dropped = 0;
        let mut deferred = 0;
        let finish = |written, dropped, deferred, stop| DeliveryReport {
            written,
            dropped,
            deferred,
            stop,
        };

        if let Err(stop) = self.wait_until_ready(epoch).await {
            return finish(written, dropped, deferred, stop);
        }

        loop {
            let item = {
                let mut state = self.state.lock().await;
                if state.epoch != epoch {
                    return finish(written, dropped, deferred, StopReason::Superseded);
                }
                if state.paused {
                    return finish(written, dropped, deferred, StopReason::Paused);
                }
                match state.queue.pop_front() {
                    Some(item) => item,
                    None => return finish(written, dropped, deferred, StopReason::Drained),
                }
            };

            let slot = match self.wait_until_consumed(epoch).await {
                Ok(slot) => slot,
                Err(stop) => {
                    // Nothing was written; a superseded pass's queue is rebuilt.
                    let mut state = self.state.lock().await;
                    if state.epoch == epoch {
                        state.queue.restore(item);
                    }
                    return finish(written, dropped, deferred, stop);
                }
            };

            let cursor = slot.last_delivered;
            if Some(item.sequence) != cursor.next() {
                if item.sequence <= cursor {
                    debug!(key = %item.sequence, %cursor, "already delivered; dropping");
                    dropped += 1;
                } else {
                    warn!(
                        key = %item.sequence,
                        %cursor,
                        "out-of-order item; deferring until the gap fills"
                    );
                    deferred += 1;
                    let mut state = self.state.lock().await;
                    if state.epoch == epoch {
                        state.device_cursor = Some(cursor);
                    }
                }
                continue;
            }

            {
                let mut state = self.state.lock().await;
                if state.epoch != epoch {
                    return finish(written, dropped, deferred, StopReason::Superseded);
                }
                if state.paused {
                    state.queue.restore(item);
                    return finish(written, dropped, deferred, StopReason::Paused);
                }
                if let Err(e) = self
                    .device
                    .write_range(PENDING_ITEM.address, &encode_delivery(&item))
                    .await
                {
                    warn!(key = %item.sequence, error = %e, "item write failed");
                    // A write that did land is caught by the cursor check.
                    state.queue.restore(item);
                    let stop = StopReason::Device(e.to_string());
                    return finish(written, dropped, deferred, stop);
                }
                state.device_cursor = Some(item.sequence);
                written += 1;
                info!(
                    key = %item.sequence,
                    item = item.item_id,
                    name = item.item_name.as_deref().unwrap_or(""),
                    from = %item.from_player,
                    "delivered item"
                );
            }

            sleep(self.timing.write_settle()).await;
        }
    }

    /// Stop condition shared by both waits.
    async fn interrupted(&self, epoch: u64) -> Option<StopReason> {
        let state = self.state.lock().await;
        if state.epoch != epoch {
            Some(StopReason::Superseded)
        } else if state.paused {
            Some(StopReason::Paused)
        } else {
            None
        }
    }

    async fn wait_until_ready(&self, epoch: u64) -> Result<(), StopReason> {
        let deadline = Instant::now() + self.timing.ready_timeout();
        loop {
            if let Some(stop) = self.interrupted(epoch).await {
                return Err(stop);
            }
            match read_game_mode(&*self.device).await {
                Ok(mode) if mode.is_in_game() => return Ok(()),
                Ok(mode) => debug!(mode = mode.0, "waiting for in-game mode"),
                // An unreachable device fails fast.
                Err(e) => return Err(StopReason::Device(e.to_string())),
            }
            if Instant::now() >= deadline {
                return Err(StopReason::NotReady);
            }
            sleep(self.timing.ready_poll_interval()).await;
        }
    }

    async fn wait_until_consumed(&self, epoch: u64) -> Result<PendingSlot, StopReason> {
        let deadline = Instant::now() + self.timing.consume_timeout();
        loop {
            if let Some(stop) = self.interrupted(epoch).await {
                return Err(stop);
            }
            match read_pending_slot(&*self.device).await {
                Ok(slot) if slot.is_empty() => return Ok(slot),
                Ok(slot) => debug!(item = slot.item_id, "waiting for game to take pending item"),
                Err(e) => return Err(StopReason::Device(e.to_string())),
            }
            if Instant::now() >= deadline {
                return Err(StopReason::ConsumeTimeout);
            }
            sleep(self.timing.consume_poll_interval()).await;
        }
    }
}
