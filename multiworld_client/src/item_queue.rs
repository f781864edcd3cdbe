// Pending deliveries for the local player, in sequence-key order.
//
// The queue only ever holds items addressed to the local player from someone
// else. Insertion keeps it sorted ascending by `SequenceKey` regardless of
// arrival order, and rejects an item whose event id is already queued.
// Deduplication is against current contents only: once an item has been
// popped for delivery, a relay resend of the same event is accepted again.
// Writing it twice is prevented downstream, where the delivery loop compares
// each key against the device's own cursor.
//
// After a reconnect the queue is rebuilt from the event log (`project`), not
// resumed, so it can never hold items that belonged to a previous identity.

use std::collections::VecDeque;

use multiworld_protocol::{ItemEvent, PlayerSlot, SequenceKey};

use crate::event_log::EventLog;

#[derive(Debug, Default)]
pub struct ItemQueue {
    items: VecDeque<ItemEvent>,
}

impl ItemQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the log: every item addressed to `local`, keeping only
    /// keys after `delivered` (the device cursor) when one is known.
    pub fn project(log: &EventLog, local: PlayerSlot, delivered: Option<SequenceKey>) -> Self {
        let mut queue = Self::new();
        if !local.is_player() {
            return queue;
        }
        for item in log.items_for(local) {
            if delivered.is_some_and(|cursor| item.sequence <= cursor) {
                continue;
            }
            queue.insert_sorted(item);
        }
        queue
    }

    /// Queue an item if it is addressed to `local` and not already queued.
    pub fn offer(&mut self, item: ItemEvent, local: PlayerSlot) -> bool {
        if !local.is_player() || item.to_player != local || item.from_player == local {
            return false;
        }
        self.insert_sorted(item)
    }

    /// Put back an item that was popped but not written.
    pub fn restore(&mut self, item: ItemEvent) {
        self.insert_sorted(item);
    }

    fn insert_sorted(&mut self, item: ItemEvent) -> bool {
        if self.items.iter().any(|queued| queued.id == item.id) {
            return false;
        }
        let pos = self.items.partition_point(|queued| queued.sequence <= item.sequence);
        self.items.insert(pos, item);
        true
    }

    pub fn pop_front(&mut self) -> Option<ItemEvent> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&ItemEvent> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemEvent> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use multiworld_protocol::{Event, EventId, EventKind, ItemData};
    use proptest::prelude::*;

    use super::*;

    const LOCAL: PlayerSlot = PlayerSlot(2);

    fn item(id: i64, key: u16) -> ItemEvent {
        ItemEvent {
            id: EventId::Relay(id),
            sequence: SequenceKey::from_value(key),
            item_id: 1,
            item_name: None,
            from_player: PlayerSlot(1),
            to_player: LOCAL,
            location: 0,
        }
    }

    fn keys(queue: &ItemQueue) -> Vec<u16> {
        queue.iter().map(|i| i.sequence.value()).collect()
    }

    #[test]
    fn out_of_order_arrivals_come_out_sorted() {
        let mut queue = ItemQueue::new();
        queue.offer(item(3, 3), LOCAL);
        queue.offer(item(1, 1), LOCAL);
        queue.offer(item(2, 2), LOCAL);
        assert_eq!(keys(&queue), [1, 2, 3]);
    }

    #[test]
    fn same_event_twice_is_one_entry() {
        let mut queue = ItemQueue::new();
        assert!(queue.offer(item(1, 1), LOCAL));
        assert!(!queue.offer(item(1, 1), LOCAL));
        assert_eq!(queue.len(), 1);

        // Once popped, a resend is accepted again.
        let popped = queue.pop_front().unwrap();
        assert!(queue.offer(popped, LOCAL));
    }

    #[test]
    fn rejects_foreign_and_self_items() {
        let mut queue = ItemQueue::new();
        let mut to_other = item(1, 1);
        to_other.to_player = PlayerSlot(3);
        let mut from_self = item(2, 2);
        from_self.from_player = LOCAL;
        assert!(!queue.offer(to_other, LOCAL));
        assert!(!queue.offer(from_self, LOCAL));
        assert!(!queue.offer(item(3, 3), PlayerSlot::NON_PLAYER));
        assert!(queue.is_empty());
    }

    #[test]
    fn projection_skips_delivered_keys() {
        let mut log = EventLog::new();
        for (id, idx) in [(10, 3), (11, 1), (12, 2)] {
            log.append(Event {
                id: EventId::Relay(id),
                timestamp_ms: 0,
                kind: EventKind::NewItem(ItemData {
                    event_idx: Some(SequenceKey::new(0, idx)),
                    item_id: 5,
                    item_name: None,
                    location: 0,
                    location_name: None,
                }),
                from_player: PlayerSlot(1),
                to_player: LOCAL,
                session_id: None,
                historical: true,
            });
        }
        let queue = ItemQueue::project(&log, LOCAL, Some(SequenceKey::new(0, 1)));
        assert_eq!(keys(&queue), [2, 3]);

        let unresolved = ItemQueue::project(&log, PlayerSlot::UNKNOWN, None);
        assert!(unresolved.is_empty());
    }

    proptest! {
        #[test]
        fn any_arrival_order_yields_ascending_unique_queue(
            arrivals in proptest::collection::vec(0u16..64, 0..48)
        ) {
            let mut queue = ItemQueue::new();
            for key in &arrivals {
                // One event id per key, so repeats are resends.
                queue.offer(item(i64::from(*key), *key), LOCAL);
            }
            let got = keys(&queue);
            let mut expected: Vec<u16> = arrivals.clone();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(got, expected);
        }
    }
}
