use crate::error::Conflict;
use crate::signal::{ConnectionId, Identity, RoomId, ServerMessage};
use tokio::sync::mpsc::UnboundedSender;

/// Rooms pair exactly two participants.
pub const ROOM_CAPACITY: usize = 2;

/// Member of a room, together with the outbox used to reach its connection.
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    outbox: UnboundedSender<ServerMessage>,
}

impl Participant {
    pub fn new(
        connection_id: ConnectionId,
        identity: Identity,
        outbox: UnboundedSender<ServerMessage>,
    ) -> Self {
        Participant {
            connection_id,
            identity,
            outbox,
        }
    }

    /// Queue a message for this participant. Returns false if its connection is already gone.
    pub fn deliver(&self, msg: ServerMessage) -> bool {
        self.outbox.send(msg).is_ok()
    }
}

/// Result of admitting a participant into a room.
#[derive(Debug)]
pub enum Admission<'a> {
    /// First member: it waits for a peer.
    Waiting,
    /// Second member: the room is now complete. Carries the member that was waiting.
    Paired(&'a Participant),
}

#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    members: Vec<Participant>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Room {
            id,
            members: Vec::with_capacity(ROOM_CAPACITY),
        }
    }

    pub fn admit(&mut self, participant: Participant) -> Result<Admission<'_>, Conflict> {
        if self.contains(participant.connection_id) {
            return Err(Conflict::AlreadyJoined(self.id.clone()));
        }
        if self.members.len() >= ROOM_CAPACITY {
            return Err(Conflict::RoomFull(self.id.clone()));
        }
        self.members.push(participant);
        if self.members.len() == ROOM_CAPACITY {
            Ok(Admission::Paired(&self.members[0]))
        } else {
            Ok(Admission::Waiting)
        }
    }

    /// Removes a member, returning it if it was present.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<Participant> {
        let idx = self
            .members
            .iter()
            .position(|p| p.connection_id == connection_id)?;
        Some(self.members.remove(idx))
    }

    /// Returns the other member of the room, as seen from `connection_id`.
    pub fn peer_of(&self, connection_id: ConnectionId) -> Option<&Participant> {
        if !self.contains(connection_id) {
            return None;
        }
        self.members
            .iter()
            .find(|p| p.connection_id != connection_id)
    }

    pub fn member(&self, connection_id: ConnectionId) -> Option<&Participant> {
        self.members
            .iter()
            .find(|p| p.connection_id == connection_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Participant> {
        self.members.iter()
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.member(connection_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
