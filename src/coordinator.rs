//! Room coordinator: pairs participants by room id and relays their signals.
//!
//! The coordinator never looks into relayed payloads, it only routes them to the other member
//! of the sender's room. State shared between connections lives behind two levels of locks: the
//! room table, and one mutex per room which serializes pairing, relaying and departures in that
//! room. Locks are always taken in `rooms -> room -> connections` order and never held across an
//! `.await`.

use crate::error::{Conflict, Error};
use crate::room::{Admission, Participant, Room};
use crate::signal::{
    ClientMessage, ConnectionId, Identity, RejectReason, RoomId, ServerMessage, SignalKind,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Cheaply clonable handle to a shared room table.
#[derive(Clone, Default)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_connection_id: AtomicU64,
    rooms: Mutex<HashMap<RoomId, Arc<Mutex<Room>>>>,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

struct ConnectionEntry {
    outbox: UnboundedSender<ServerMessage>,
    room: Option<RoomId>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new transport connection. Returns its id and the receiving end of its outbox:
    /// every message addressed to this connection is delivered there, in order.
    pub fn register(&self) -> (ConnectionId, UnboundedReceiver<ServerMessage>) {
        let id = ConnectionId(
            self.inner
                .next_connection_id
                .fetch_add(1, Ordering::Relaxed)
                + 1,
        );
        let (outbox, inbox) = unbounded_channel();
        lock(&self.inner.connections).insert(id, ConnectionEntry { outbox, room: None });
        log::debug!("registered connection {}", id);
        (id, inbox)
    }

    /// Entry point for messages received from a connection. Failures are answered or logged,
    /// they never propagate.
    pub fn handle(&self, from: ConnectionId, msg: ClientMessage) {
        match msg.into_signal() {
            Ok((kind, payload)) => {
                self.relay(from, kind, payload);
            }
            Err(ClientMessage::JoinRequest { room_id, identity }) => {
                if let Err(e) = self.join(from, room_id.clone(), identity) {
                    self.reject(from, room_id, e);
                }
            }
            Err(ClientMessage::Leave) => {
                self.leave(from);
            }
            Err(other) => log::warn!("{} sent unroutable {}", from, other.name()),
        }
    }

    /// Makes `connection_id` a member of `room_id`, creating the room if needed.
    ///
    /// When this completes a pair, both members receive a `joined` notification before this
    /// method returns, and therefore before any signal can be relayed between them. Returns the
    /// id of the paired peer, or `None` when the caller is left waiting.
    pub fn join(
        &self,
        connection_id: ConnectionId,
        room_id: RoomId,
        identity: Identity,
    ) -> Result<Option<ConnectionId>, Error> {
        let outbox = {
            let connections = lock(&self.inner.connections);
            let entry = connections
                .get(&connection_id)
                .ok_or(Error::UnknownConnection(connection_id))?;
            if let Some(current) = &entry.room {
                return Err(Conflict::AlreadyJoined(current.clone()).into());
            }
            entry.outbox.clone()
        };

        let mut rooms = lock(&self.inner.rooms);
        let handle = room_entry(&mut rooms, &room_id);
        let mut room = lock(&handle);

        let participant = Participant::new(connection_id, identity.clone(), outbox);
        let peer = match room.admit(participant)? {
            Admission::Waiting => None,
            Admission::Paired(waiting) => {
                waiting.deliver(ServerMessage::Joined {
                    peer_id: connection_id,
                    peer_identity: identity.clone(),
                    initiator: true,
                });
                Some((waiting.connection_id, waiting.identity.clone()))
            }
        };
        if let Some((peer_id, peer_identity)) = &peer {
            if let Some(me) = room.member(connection_id) {
                me.deliver(ServerMessage::Joined {
                    peer_id: *peer_id,
                    peer_identity: peer_identity.clone(),
                    initiator: false,
                });
            }
        }

        if let Some(entry) = lock(&self.inner.connections).get_mut(&connection_id) {
            entry.room = Some(room_id.clone());
        }

        match &peer {
            Some((peer_id, peer_identity)) => log::info!(
                "{} ({}) paired with {} ({}) in room '{}'",
                connection_id,
                identity,
                peer_id,
                peer_identity,
                room_id
            ),
            None => log::info!(
                "{} ({}) waiting in room '{}'",
                connection_id,
                identity,
                room_id
            ),
        }
        Ok(peer.map(|(peer_id, _)| peer_id))
    }

    /// Forwards a signal to the other member of the sender's room. Returns false when there is
    /// nobody to forward to yet, which is a normal state for a participant still waiting.
    pub fn relay(&self, from: ConnectionId, kind: SignalKind, payload: Value) -> bool {
        let Some(room_id) = self.room_of(from) else {
            log::warn!("dropping {} from {}: not a member of any room", kind, from);
            return false;
        };
        let Some(handle) = lock(&self.inner.rooms).get(&room_id).cloned() else {
            log::warn!("dropping {} from {}: room '{}' is gone", kind, from, room_id);
            return false;
        };
        let room = lock(&handle);
        match room.peer_of(from) {
            Some(peer) => {
                log::debug!(
                    "relaying {} from {} to {} in room '{}'",
                    kind,
                    from,
                    peer.connection_id,
                    room_id
                );
                peer.deliver(ServerMessage::relayed(kind, from, payload))
            }
            None => {
                log::debug!("{} from {} has no peer to reach yet", kind, from);
                false
            }
        }
    }

    /// Removes a connection from its room. The remaining member, if any, is told with a
    /// `peer-left` message; an emptied room is reclaimed. Returns the room that was left.
    pub fn leave(&self, connection_id: ConnectionId) -> Option<RoomId> {
        let room_id = lock(&self.inner.connections)
            .get_mut(&connection_id)?
            .room
            .take()?;

        let mut rooms = lock(&self.inner.rooms);
        if let Some(handle) = rooms.get(&room_id).cloned() {
            let mut room = lock(&handle);
            if room.remove(connection_id).is_some() {
                for remaining in room.members() {
                    remaining.deliver(ServerMessage::PeerLeft {
                        peer_id: connection_id,
                    });
                }
            }
            let empty = room.is_empty();
            drop(room);
            if empty {
                rooms.remove(&room_id);
                log::info!("room '{}' is empty and was reclaimed", room_id);
            }
        }
        log::info!("{} left room '{}'", connection_id, room_id);
        Some(room_id)
    }

    /// Called when the transport of a connection closes. Implies [Coordinator::leave].
    pub fn disconnect(&self, connection_id: ConnectionId) {
        self.leave(connection_id);
        if lock(&self.inner.connections)
            .remove(&connection_id)
            .is_some()
        {
            log::debug!("unregistered connection {}", connection_id);
        }
    }

    /// Number of members currently in a room (0 if it doesn't exist).
    pub fn room_size(&self, room_id: &str) -> usize {
        let handle = lock(&self.inner.rooms).get(room_id).cloned();
        handle.map(|room| lock(&room).len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        lock(&self.inner.rooms).len()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    fn room_of(&self, connection_id: ConnectionId) -> Option<RoomId> {
        lock(&self.inner.connections)
            .get(&connection_id)
            .and_then(|entry| entry.room.clone())
    }

    fn reject(&self, connection_id: ConnectionId, room_id: RoomId, cause: Error) {
        let reason = match &cause {
            Error::PairingConflict(Conflict::RoomFull(_)) => RejectReason::RoomFull,
            Error::PairingConflict(Conflict::AlreadyJoined(_)) => RejectReason::AlreadyJoined,
            _ => {
                log::warn!("join of {} to '{}' failed: {}", connection_id, room_id, cause);
                return;
            }
        };
        log::info!("rejected {} from room '{}': {}", connection_id, room_id, cause);
        if let Some(entry) = lock(&self.inner.connections).get(&connection_id) {
            let _ = entry
                .outbox
                .send(ServerMessage::JoinRejected { room_id, reason });
        }
    }
}

/// Returns the room registered under `room_id`, creating it if necessary. A room whose lock was
/// poisoned is replaced by a fresh one: its state can't be trusted, but other rooms are unaffected.
fn room_entry(rooms: &mut HashMap<RoomId, Arc<Mutex<Room>>>, room_id: &RoomId) -> Arc<Mutex<Room>> {
    if let Some(existing) = rooms.get(room_id) {
        if !existing.is_poisoned() {
            return existing.clone();
        }
        log::error!("room '{}' state was corrupted, resetting it", room_id);
    }
    let room = Arc::new(Mutex::new(Room::new(room_id.clone())));
    rooms.insert(room_id.clone(), room.clone());
    room
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn joined_peer(msg: ServerMessage) -> (ConnectionId, Identity, bool) {
        match msg {
            ServerMessage::Joined {
                peer_id,
                peer_identity,
                initiator,
            } => (peer_id, peer_identity, initiator),
            other => panic!("expected joined, got {:?}", other),
        }
    }

    #[test]
    fn second_join_notifies_both_members() {
        let coordinator = Coordinator::new();
        let (a, mut a_rx) = coordinator.register();
        let (b, mut b_rx) = coordinator.register();

        assert_eq!(coordinator.join(a, "r1".into(), "a@x.io".into()).unwrap(), None);
        assert!(a_rx.try_recv().is_err());

        assert_eq!(
            coordinator.join(b, "r1".into(), "b@x.io".into()).unwrap(),
            Some(a)
        );
        assert_eq!(
            joined_peer(a_rx.try_recv().unwrap()),
            (b, "b@x.io".to_string(), true)
        );
        assert_eq!(
            joined_peer(b_rx.try_recv().unwrap()),
            (a, "a@x.io".to_string(), false)
        );
    }

    #[test]
    fn third_joiner_is_rejected_and_never_sees_the_pair() {
        let coordinator = Coordinator::new();
        let (a, mut a_rx) = coordinator.register();
        let (b, mut b_rx) = coordinator.register();
        let (c, mut c_rx) = coordinator.register();

        for (id, identity) in [(a, "a"), (b, "b"), (c, "c")] {
            coordinator.handle(
                id,
                ClientMessage::JoinRequest {
                    room_id: "r1".into(),
                    identity: identity.into(),
                },
            );
        }

        assert_eq!(
            c_rx.try_recv().unwrap(),
            ServerMessage::JoinRejected {
                room_id: "r1".into(),
                reason: RejectReason::RoomFull
            }
        );
        assert_eq!(coordinator.room_size("r1"), 2);

        // the rejected connection cannot reach the pair
        assert!(!coordinator.relay(c, SignalKind::CallOffer, json!("o")));
        joined_peer(a_rx.try_recv().unwrap());
        joined_peer(b_rx.try_recv().unwrap());
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn joining_twice_is_rejected() {
        let coordinator = Coordinator::new();
        let (a, mut a_rx) = coordinator.register();
        coordinator.join(a, "r1".into(), "a".into()).unwrap();
        coordinator.handle(
            a,
            ClientMessage::JoinRequest {
                room_id: "r2".into(),
                identity: "a".into(),
            },
        );
        assert_eq!(
            a_rx.try_recv().unwrap(),
            ServerMessage::JoinRejected {
                room_id: "r2".into(),
                reason: RejectReason::AlreadyJoined
            }
        );
        assert_eq!(coordinator.room_count(), 1);
    }

    #[test]
    fn relay_without_peer_is_a_noop() {
        let coordinator = Coordinator::new();
        let (a, _a_rx) = coordinator.register();
        assert!(!coordinator.relay(a, SignalKind::CallOffer, json!("o1")));
        coordinator.join(a, "r1".into(), "a".into()).unwrap();
        assert!(!coordinator.relay(a, SignalKind::CallOffer, json!("o1")));
    }

    #[test]
    fn relay_forwards_payload_verbatim_to_the_other_member() {
        let coordinator = Coordinator::new();
        let (a, mut a_rx) = coordinator.register();
        let (b, mut b_rx) = coordinator.register();
        coordinator.join(a, "r1".into(), "a".into()).unwrap();
        coordinator.join(b, "r1".into(), "b".into()).unwrap();
        joined_peer(a_rx.try_recv().unwrap());
        joined_peer(b_rx.try_recv().unwrap());

        let payload = json!({"type": "offer", "sdp": "o1", "extra": [1, 2, 3]});
        coordinator.handle(
            a,
            ClientMessage::CallOffer {
                payload: payload.clone(),
            },
        );
        assert_eq!(
            b_rx.try_recv().unwrap(),
            ServerMessage::CallOffer { from: a, payload }
        );
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn leave_notifies_remaining_member_and_reclaims_empty_room() {
        let coordinator = Coordinator::new();
        let (a, mut a_rx) = coordinator.register();
        let (b, mut b_rx) = coordinator.register();
        coordinator.join(a, "r1".into(), "a".into()).unwrap();
        coordinator.join(b, "r1".into(), "b".into()).unwrap();
        joined_peer(a_rx.try_recv().unwrap());
        joined_peer(b_rx.try_recv().unwrap());

        coordinator.handle(b, ClientMessage::Leave);
        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::PeerLeft { peer_id: b });
        assert_eq!(coordinator.room_size("r1"), 1);

        // remaining member can be paired again
        let (c, mut c_rx) = coordinator.register();
        assert_eq!(coordinator.join(c, "r1".into(), "c".into()).unwrap(), Some(a));
        assert_eq!(joined_peer(c_rx.try_recv().unwrap()).0, a);

        coordinator.disconnect(a);
        coordinator.disconnect(c);
        assert_eq!(coordinator.room_count(), 0);
        assert_eq!(coordinator.connection_count(), 1);
        assert_eq!(coordinator.leave(b), None);
    }

    #[test]
    fn racing_joiners_never_overfill_a_room() {
        let coordinator = Coordinator::new();
        let rooms: Vec<String> = (0..32).map(|i| format!("room-{i}")).collect();

        let results: Vec<(String, Result<Option<ConnectionId>, Error>)> = thread::scope(|s| {
            let handles: Vec<_> = rooms
                .iter()
                .flat_map(|room| std::iter::repeat(room).take(3))
                .map(|room| {
                    let coordinator = coordinator.clone();
                    s.spawn(move || {
                        let (id, _inbox) = coordinator.register();
                        let res = coordinator.join(id, room.clone(), format!("{id}"));
                        (room.clone(), res)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for room in rooms.iter() {
            let outcomes: Vec<_> = results.iter().filter(|(r, _)| r == room).collect();
            let waiting = outcomes
                .iter()
                .filter(|(_, res)| matches!(res, Ok(None)))
                .count();
            let paired = outcomes
                .iter()
                .filter(|(_, res)| matches!(res, Ok(Some(_))))
                .count();
            let rejected = outcomes
                .iter()
                .filter(|(_, res)| {
                    matches!(res, Err(Error::PairingConflict(Conflict::RoomFull(_))))
                })
                .count();
            assert_eq!((waiting, paired, rejected), (1, 1, 1), "room {room}");
            assert_eq!(coordinator.room_size(room), 2);
        }
    }

    #[test]
    fn joined_always_precedes_relayed_signals() {
        for _ in 0..64 {
            let coordinator = Coordinator::new();
            let (a, mut a_rx) = coordinator.register();
            let (b, mut b_rx) = coordinator.register();
            coordinator.join(a, "r1".into(), "a".into()).unwrap();

            // `a` hammers the relay while `b` joins from another thread
            thread::scope(|s| {
                let relay = {
                    let coordinator = coordinator.clone();
                    s.spawn(move || {
                        for _ in 0..100 {
                            coordinator.relay(a, SignalKind::CallOffer, json!("o1"));
                        }
                    })
                };
                coordinator.join(b, "r1".into(), "b".into()).unwrap();
                relay.join().unwrap();
            });

            assert!(matches!(
                b_rx.try_recv().unwrap(),
                ServerMessage::Joined { .. }
            ));
            assert!(matches!(
                a_rx.try_recv().unwrap(),
                ServerMessage::Joined { .. }
            ));
            while let Ok(msg) = b_rx.try_recv() {
                assert!(matches!(msg, ServerMessage::CallOffer { .. }));
            }
        }
    }
}
