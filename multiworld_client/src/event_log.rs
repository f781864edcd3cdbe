// Append-only record of every session event this client has seen.
//
// Seeded once from the relay's historical HTTP endpoint (`historical = true`)
// and extended by live frames. Events are never removed. Identity is the
// `(id, historical)` pair: the same relay id seen live and in history are
// two distinct entries, but the same id seen twice live is one.
//
// Arrival order is preserved in storage. Display order (by timestamp) is
// computed on demand because live frames and history interleave freely.
//
// The item queue (`item_queue.rs`) is a projection over this log; see
// `EventLog::items_for`.

use std::collections::HashSet;

use multiworld_protocol::{Event, EventId, ItemEvent, PlayerSlot};

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
    seen: HashSet<(EventId, bool)>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append if not already present. Returns whether the event was new.
    pub fn append(&mut self, event: Event) -> bool {
        if !self.seen.insert(event.key()) {
            return false;
        }
        self.events.push(event);
        true
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, id: &EventId, historical: bool) -> bool {
        self.seen.contains(&(id.clone(), historical))
    }

    /// Events in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Events ordered by timestamp, ties kept in arrival order.
    pub fn display_order(&self) -> Vec<&Event> {
        let mut ordered: Vec<&Event> = self.events.iter().collect();
        ordered.sort_by_key(|e| e.timestamp_ms);
        ordered
    }

    /// Deliverable items addressed to `local` from someone else.
    pub fn items_for(&self, local: PlayerSlot) -> impl Iterator<Item = ItemEvent> + '_ {
        self.events
            .iter()
            .filter(move |e| e.to_player == local && e.from_player != local)
            .filter_map(Event::as_item_event)
    }
}

#[cfg(test)]
mod tests {
    use multiworld_protocol::{EventKind, ItemData, SequenceKey};

    use super::*;

    fn item(id: i64, ts: i64, from: i32, to: i32, idx: u8) -> Event {
        Event {
            id: EventId::Relay(id),
            timestamp_ms: ts,
            kind: EventKind::NewItem(ItemData {
                event_idx: Some(SequenceKey::new(0, idx)),
                item_id: 10,
                item_name: None,
                location: 0,
                location_name: None,
            }),
            from_player: PlayerSlot(from),
            to_player: PlayerSlot(to),
            session_id: None,
            historical: false,
        }
    }

    #[test]
    fn dedups_on_id_and_historical() {
        let mut log = EventLog::new();
        assert!(log.append(item(1, 0, 1, 2, 1)));
        assert!(!log.append(item(1, 0, 1, 2, 1)));

        let mut historical = item(1, 0, 1, 2, 1);
        historical.historical = true;
        assert!(log.append(historical));
        assert_eq!(log.len(), 2);
        assert!(log.contains(&EventId::Relay(1), true));
    }

    #[test]
    fn display_order_is_by_timestamp() {
        let mut log = EventLog::new();
        log.append(item(1, 300, 1, 2, 1));
        log.append(item(2, 100, 1, 2, 2));
        log.append(item(3, 200, 1, 2, 3));
        let ids: Vec<_> = log.display_order().iter().map(|e| e.id.clone()).collect();
        assert_eq!(
            ids,
            [EventId::Relay(2), EventId::Relay(3), EventId::Relay(1)]
        );
        // Storage keeps arrival order.
        assert_eq!(log.iter().next().unwrap().id, EventId::Relay(1));
    }

    #[test]
    fn items_for_excludes_self_sends_and_other_recipients() {
        let mut log = EventLog::new();
        log.append(item(1, 0, 1, 2, 1));
        log.append(item(2, 0, 2, 2, 2));
        log.append(item(3, 0, 1, 3, 1));
        let items: Vec<_> = log.items_for(PlayerSlot(2)).collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, EventId::Relay(1));
    }
}
