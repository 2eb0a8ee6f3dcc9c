//! Room registry
//!
//! One room per sheet. A room holds the relay's replica of the sheet
//! document, the set of connected members and a broadcast channel carrying
//! encoded frames to every member. Rooms are created by the first join and
//! dropped when the last member leaves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use gridsync_protocol::SyncMessage;
use tokio::sync::{broadcast, RwLock};

use crate::replica::RoomReplica;

/// Frames buffered per member before it counts as lagging
const ROOM_CHANNEL_CAPACITY: usize = 256;

/// Connection-scoped member id
pub type MemberId = u64;

/// A frame fanned out to the members of a room
#[derive(Debug, Clone)]
pub struct RoomEvent {
    /// Member that caused it; it is not sent back there
    pub from: MemberId,
    /// Encoded JSON text frame
    pub frame: Arc<str>,
}

/// State of a single room
#[derive(Debug)]
pub struct Room {
    replica: RoomReplica,
    members: HashSet<MemberId>,
    event_tx: broadcast::Sender<RoomEvent>,
}

impl Room {
    fn new() -> Self {
        let (event_tx, _) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        Self {
            replica: RoomReplica::new(),
            members: HashSet::new(),
            event_tx,
        }
    }

    pub fn replica(&self) -> &RoomReplica {
        &self.replica
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    fn broadcast(&self, from: MemberId, msg: &SyncMessage) -> Result<()> {
        let frame: Arc<str> = msg.to_json()?.into();
        // No receivers is fine: the sender may be alone in the room
        let _ = self.event_tx.send(RoomEvent { from, frame });
        Ok(())
    }
}

/// All live rooms of the relay
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    next_member: MemberId,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `room`, creating it if needed
    pub fn join(&mut self, room: &str) -> (MemberId, broadcast::Receiver<RoomEvent>) {
        self.next_member += 1;
        let member = self.next_member;
        let entry = self.rooms.entry(room.to_string()).or_insert_with(|| {
            tracing::info!(room, "Room created");
            Room::new()
        });
        entry.members.insert(member);
        tracing::debug!(room, member, members = entry.members.len(), "Member joined");
        (member, entry.event_tx.subscribe())
    }

    /// Leave `room`; the room is dropped with its last member
    pub fn leave(&mut self, room: &str, member: MemberId) {
        let Some(entry) = self.rooms.get_mut(room) else {
            return;
        };
        entry.members.remove(&member);
        tracing::debug!(room, member, members = entry.members.len(), "Member left");
        if entry.members.is_empty() {
            if let Some(dropped) = self.rooms.remove(room) {
                tracing::info!(
                    room,
                    rows = dropped.replica.row_count(),
                    merged = dropped.replica.merged(),
                    "Room closed"
                );
            }
        }
    }

    pub fn get(&self, room: &str) -> Option<&Room> {
        self.rooms.get(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// The relay's opening `sync1` for a new member
    pub fn hello(&self, room: &str) -> Option<SyncMessage> {
        self.rooms.get(room).map(|entry| SyncMessage::SyncStep1 {
            state_vector: entry.replica.state_vector(),
        })
    }

    /// Full room state, for members that fell behind the broadcast
    pub fn full_sync(&self, room: &str) -> Option<SyncMessage> {
        self.rooms.get(room).map(|entry| SyncMessage::SyncStep2 {
            update: entry.replica.encode_state(),
        })
    }

    /// Handle a frame from `member`
    ///
    /// Returns the reply for that member, if any. Document changes are
    /// merged into the room replica and fanned out to the other members as
    /// `update` frames; awareness frames are fanned out unchanged.
    pub fn handle_message(
        &mut self,
        room: &str,
        member: MemberId,
        msg: SyncMessage,
    ) -> Result<Option<SyncMessage>> {
        let entry = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| anyhow::anyhow!("room {room} is not open"))?;

        match msg {
            SyncMessage::SyncStep1 { state_vector } => {
                // Member wants what it is missing
                let update = entry.replica.encode_diff(&state_vector)?;
                Ok(Some(SyncMessage::SyncStep2 { update }))
            }
            SyncMessage::SyncStep2 { update } | SyncMessage::Update { update } => {
                entry.replica.apply_update(&update)?;
                entry.broadcast(member, &SyncMessage::Update { update })?;
                Ok(None)
            }
            awareness @ SyncMessage::Awareness { .. } => {
                entry.broadcast(member, &awareness)?;
                Ok(None)
            }
        }
    }
}

/// Thread-safe room registry
pub type SharedRoomRegistry = Arc<RwLock<RoomRegistry>>;

/// Create a new shared room registry
pub fn create_registry() -> SharedRoomRegistry {
    Arc::new(RwLock::new(RoomRegistry::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_protocol::ROWS_ARRAY;
    use yrs::updates::decoder::Decode;
    use yrs::updates::encoder::Encode;
    use yrs::{Array, Doc, ReadTxn, StateVector, Transact, Update};

    fn edit(client_id: u64, row: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(client_id);
        let array = doc.get_or_insert_array(ROWS_ARRAY);
        let mut txn = doc.transact_mut();
        array.insert(&mut txn, 0, row.to_string());
        txn.encode_update_v1()
    }

    #[test]
    fn join_and_leave_manage_room_lifetime() {
        let mut registry = RoomRegistry::new();
        let (a, _rx_a) = registry.join("sheet-1");
        let (b, _rx_b) = registry.join("sheet-1");
        assert_ne!(a, b);
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.get("sheet-1").unwrap().member_count(), 2);

        registry.leave("sheet-1", a);
        assert_eq!(registry.room_count(), 1);
        registry.leave("sheet-1", b);
        assert_eq!(registry.room_count(), 0);

        // Leaving twice or leaving an unknown room is harmless
        registry.leave("sheet-1", b);
        registry.leave("sheet-404", 9);
    }

    #[test]
    fn updates_fan_out_to_other_members() {
        let mut registry = RoomRegistry::new();
        let (a, mut rx_a) = registry.join("sheet-1");
        let (_b, mut rx_b) = registry.join("sheet-1");

        let reply = registry
            .handle_message("sheet-1", a, SyncMessage::Update { update: edit(3, "row") })
            .unwrap();
        assert!(reply.is_none());

        let event = rx_b.try_recv().unwrap();
        assert_eq!(event.from, a);
        assert!(matches!(
            SyncMessage::from_json(&event.frame).unwrap(),
            SyncMessage::Update { .. }
        ));
        // The sender's own receiver sees the event too; the connection filters it
        assert_eq!(rx_a.try_recv().unwrap().from, a);
        assert_eq!(registry.get("sheet-1").unwrap().replica().row_count(), 1);
    }

    #[test]
    fn sync1_is_answered_with_diff() {
        let mut registry = RoomRegistry::new();
        let (a, _rx) = registry.join("sheet-1");
        registry
            .handle_message("sheet-1", a, SyncMessage::SyncStep2 { update: edit(3, "row") })
            .unwrap();

        let empty = StateVector::default().encode_v1();
        let reply = registry
            .handle_message("sheet-1", a, SyncMessage::SyncStep1 { state_vector: empty })
            .unwrap();
        let Some(SyncMessage::SyncStep2 { update }) = reply else {
            panic!("expected sync2");
        };

        let doc = Doc::new();
        doc.transact_mut()
            .apply_update(Update::decode_v1(&update).unwrap())
            .unwrap();
        let rows = doc.get_or_insert_array(ROWS_ARRAY);
        assert_eq!(rows.len(&doc.transact()), 1);
    }

    #[test]
    fn bad_update_is_rejected_and_not_broadcast() {
        let mut registry = RoomRegistry::new();
        let (a, _rx_a) = registry.join("sheet-1");
        let (_b, mut rx_b) = registry.join("sheet-1");
        let result = registry.handle_message("sheet-1", a, SyncMessage::Update { update: vec![0xff; 4] });
        assert!(result.is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn messages_for_closed_rooms_fail() {
        let mut registry = RoomRegistry::new();
        let msg = SyncMessage::Awareness { data: vec![1] };
        assert!(registry.handle_message("sheet-x", 1, msg).is_err());
        assert!(registry.hello("sheet-x").is_none());
    }
}
