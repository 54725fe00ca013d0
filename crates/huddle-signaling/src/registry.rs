//! Source of truth for every connection the local participant takes part in.
//!
//! At most one non-terminal record exists per [`ConnectionId`]. Records are
//! only changed through the registry so that invariant holds at every point
//! where a handler can be suspended.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::error::RegistryError;
use crate::ids::{ConnectionId, Direction, PeerId, Role, StreamKind};
use crate::media::RemoteMedia;
use crate::state::{ConnectionState, StateMachine, Transition};
use crate::transport::PeerTransport;

/// What currently backs a record.
#[derive(Clone)]
pub enum Link {
    /// Reserved by a local stream request; the remote's offer has not arrived.
    Placeholder,
    /// The transport is being built.
    Pending,
    Live(Arc<dyn PeerTransport>),
}

impl Link {
    fn label(&self) -> &'static str {
        match self {
            Link::Placeholder => "placeholder",
            Link::Pending => "pending",
            Link::Live(_) => "live",
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifies one incarnation of a record. A record replaced under the same id
/// gets a new generation, so work started for the old one can tell it lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ticket {
    id: ConnectionId,
    generation: u64,
}

impl Ticket {
    pub(crate) fn new(id: ConnectionId, generation: u64) -> Self {
        Self { id, generation }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone)]
pub struct Draft {
    pub id: ConnectionId,
    pub remote_name: Option<String>,
    pub role: Role,
}

#[derive(Debug)]
pub struct Admitted {
    pub ticket: Ticket,
    /// Terminal record that previously held the id; the caller tears it down.
    pub evicted: Option<ConnectionRecord>,
}

#[derive(Debug, Clone)]
pub struct Announcement {
    pub remote: PeerId,
    pub kind: StreamKind,
    pub media: RemoteMedia,
}

#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    generation: u64,
    remote: PeerId,
    remote_name: Option<String>,
    direction: Direction,
    role: Role,
    machine: StateMachine,
    link: Link,
    created_at: Instant,
    remote_applied: bool,
    remote_media: Option<RemoteMedia>,
    announced: bool,
    removal_notified: bool,
}

impl ConnectionRecord {
    fn new(local: &PeerId, draft: Draft, generation: u64, link: Link, now: Instant) -> Self {
        Self {
            remote: draft.id.remote_for(local).clone(),
            direction: draft.id.direction_for(local),
            id: draft.id,
            generation,
            remote_name: draft.remote_name,
            role: draft.role,
            machine: StateMachine::new(now),
            link,
            created_at: now,
            remote_applied: false,
            remote_media: None,
            announced: false,
            removal_notified: false,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn ticket(&self) -> Ticket {
        Ticket {
            id: self.id.clone(),
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    pub fn kind(&self) -> StreamKind {
        self.id.kind()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn transitions(&self) -> u32 {
        self.machine.transitions()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.machine.last_activity()
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.link, Link::Placeholder)
    }

    pub fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        match &self.link {
            Link::Live(transport) => Some(Arc::clone(transport)),
            Link::Placeholder | Link::Pending => None,
        }
    }

    /// The remote description has been applied and the backlog drained.
    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }

    pub(crate) fn into_teardown(self) -> Teardown {
        let notify_removed = self.announced && !self.removal_notified;
        Teardown {
            transport: self.transport(),
            kind: self.id.kind(),
            id: self.id,
            remote: self.remote,
            direction: self.direction,
            transitions: self.machine.transitions(),
            notify_removed,
        }
    }
}

/// What is left to do once a record has left the registry.
pub(crate) struct Teardown {
    pub id: ConnectionId,
    pub remote: PeerId,
    pub kind: StreamKind,
    pub direction: Direction,
    pub transitions: u32,
    pub transport: Option<Arc<dyn PeerTransport>>,
    pub notify_removed: bool,
}

#[derive(Debug)]
pub struct Registry {
    local: PeerId,
    records: HashMap<ConnectionId, ConnectionRecord>,
    next_generation: u64,
}

impl Registry {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            records: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionRecord> {
        self.records.get(id)
    }

    /// The record for `id` unless it has reached a terminal state.
    pub fn active(&self, id: &ConnectionId) -> Option<&ConnectionRecord> {
        self.records
            .get(id)
            .filter(|record| !record.state().is_terminal())
    }

    pub fn current(&self, ticket: &Ticket) -> Option<&ConnectionRecord> {
        self.records
            .get(&ticket.id)
            .filter(|record| record.generation == ticket.generation)
    }

    fn current_mut(&mut self, ticket: &Ticket) -> Option<&mut ConnectionRecord> {
        self.records
            .get_mut(&ticket.id)
            .filter(|record| record.generation == ticket.generation)
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Creates a record and moves it from `idle` to `initial`. A non-terminal
    /// record under the same id rejects the attempt; a terminal one is evicted.
    pub fn put(
        &mut self,
        draft: Draft,
        initial: ConnectionState,
        link: Link,
        now: Instant,
    ) -> Result<Admitted, RegistryError> {
        if let Some(existing) = self.active(&draft.id) {
            return Err(RegistryError::Occupied {
                id: draft.id,
                state: existing.state(),
            });
        }
        let generation = self.allocate_generation();
        let mut record = ConnectionRecord::new(&self.local, draft, generation, link, now);
        if !matches!(
            record.machine.apply(initial, now),
            Transition::Applied { .. }
        ) {
            return Err(RegistryError::IllegalStart {
                id: record.id,
                state: initial,
            });
        }
        let ticket = record.ticket();
        let evicted = self.records.insert(ticket.id.clone(), record);
        Ok(Admitted { ticket, evicted })
    }

    /// Swaps a stream-request placeholder for a real record in `creating`
    /// under the same id, in one step.
    pub fn promote_placeholder(
        &mut self,
        id: &ConnectionId,
        remote_name: Option<String>,
        role: Role,
        now: Instant,
    ) -> Result<Ticket, RegistryError> {
        let is_placeholder = self.records.get(id).is_some_and(|record| {
            record.is_placeholder() && record.state() == ConnectionState::Requesting
        });
        if !is_placeholder {
            return Err(RegistryError::NoPlaceholder { id: id.clone() });
        }
        let generation = self.allocate_generation();
        let Some(slot) = self.records.get_mut(id) else {
            return Err(RegistryError::NoPlaceholder { id: id.clone() });
        };
        let draft = Draft {
            id: id.clone(),
            remote_name: remote_name.or_else(|| slot.remote_name.clone()),
            role,
        };
        let mut fresh = ConnectionRecord::new(&self.local, draft, generation, Link::Pending, now);
        if !matches!(
            fresh.machine.apply(ConnectionState::Creating, now),
            Transition::Applied { .. }
        ) {
            return Err(RegistryError::IllegalStart {
                id: id.clone(),
                state: ConnectionState::Creating,
            });
        }
        let ticket = fresh.ticket();
        *slot = fresh;
        Ok(ticket)
    }

    pub fn transition(
        &mut self,
        ticket: &Ticket,
        to: ConnectionState,
        now: Instant,
    ) -> Result<Transition, RegistryError> {
        let record = self.current_mut(ticket).ok_or_else(|| RegistryError::Stale {
            id: ticket.id.clone(),
            generation: ticket.generation,
        })?;
        Ok(record.machine.apply(to, now))
    }

    pub fn touch(&mut self, id: &ConnectionId, now: Instant) {
        if let Some(record) = self.records.get_mut(id) {
            record.machine.touch(now);
        }
    }

    /// Installs a freshly built transport. False if the record moved on while
    /// it was being built.
    pub fn attach(&mut self, ticket: &Ticket, transport: Arc<dyn PeerTransport>) -> bool {
        match self.current_mut(ticket) {
            Some(record) if matches!(record.link, Link::Pending) => {
                record.link = Link::Live(transport);
                true
            }
            _ => false,
        }
    }

    pub fn mark_remote_applied(&mut self, ticket: &Ticket) -> bool {
        match self.current_mut(ticket) {
            Some(record) => {
                record.remote_applied = true;
                true
            }
            None => false,
        }
    }

    pub fn add_remote_media(&mut self, ticket: &Ticket, media: RemoteMedia) -> bool {
        match self.current_mut(ticket) {
            Some(record) => {
                match &mut record.remote_media {
                    Some(existing) => existing.merge(media),
                    None => record.remote_media = Some(media),
                }
                true
            }
            None => false,
        }
    }

    /// Hands out an incoming record's media exactly once, as soon as it is
    /// both connected and carrying remote tracks.
    pub fn take_announcement(&mut self, ticket: &Ticket) -> Option<Announcement> {
        let record = self.current_mut(ticket)?;
        if record.announced
            || record.direction != Direction::Incoming
            || record.state() != ConnectionState::Connected
        {
            return None;
        }
        let media = record.remote_media.clone()?;
        record.announced = true;
        Some(Announcement {
            remote: record.remote.clone(),
            kind: record.kind(),
            media,
        })
    }

    /// Returns the stream to report as gone, once per announced record.
    pub fn take_removal_notice(&mut self, ticket: &Ticket) -> Option<(PeerId, StreamKind)> {
        let record = self.current_mut(ticket)?;
        if !record.announced || record.removal_notified {
            return None;
        }
        record.removal_notified = true;
        Some((record.remote.clone(), record.kind()))
    }

    /// Takes the record out of the registry after moving it to `closed`.
    pub fn close(&mut self, id: &ConnectionId, now: Instant) -> Option<ConnectionRecord> {
        let mut record = self.records.remove(id)?;
        Self::finish(&mut record, now);
        Some(record)
    }

    pub fn close_all(&mut self, now: Instant) -> Vec<ConnectionRecord> {
        self.records
            .drain()
            .map(|(_, mut record)| {
                Self::finish(&mut record, now);
                record
            })
            .collect()
    }

    fn finish(record: &mut ConnectionRecord, now: Instant) {
        if let Transition::Rejected { from, .. } = record.machine.apply(ConnectionState::Closed, now) {
            debug!(connection_id = %record.id, state = %from, "record removed without closing");
        }
    }

    /// Connected records matching `role` and, when given, `kind`.
    pub fn list_by_role_and_kind(
        &self,
        role: Role,
        kind: Option<StreamKind>,
    ) -> Vec<&ConnectionRecord> {
        let mut matches: Vec<&ConnectionRecord> = self
            .records
            .values()
            .filter(|record| record.state() == ConnectionState::Connected)
            .filter(|record| record.role == role)
            .filter(|record| kind.is_none_or(|kind| record.kind() == kind))
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    pub fn ids_for_peer(&self, remote: &PeerId) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .records
            .values()
            .filter(|record| &record.remote == remote)
            .map(|record| record.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> PeerId {
        PeerId::from("alice")
    }

    fn bob() -> PeerId {
        PeerId::from("bob")
    }

    fn draft(id: &ConnectionId, role: Role) -> Draft {
        Draft {
            id: id.clone(),
            remote_name: None,
            role,
        }
    }

    fn connect(registry: &mut Registry, ticket: &Ticket, now: Instant) {
        registry
            .transition(ticket, ConnectionState::Answering, now)
            .expect("current");
        registry
            .transition(ticket, ConnectionState::Connected, now)
            .expect("current");
    }

    #[test]
    fn second_live_record_for_same_id_is_rejected() {
        let now = Instant::now();
        let mut registry = Registry::new(alice());
        let id = ConnectionId::outgoing(&alice(), &bob(), StreamKind::Camera);
        registry
            .put(draft(&id, Role::Sender), ConnectionState::Creating, Link::Pending, now)
            .expect("first");
        let err = registry
            .put(draft(&id, Role::Sender), ConnectionState::Creating, Link::Pending, now)
            .expect_err("second");
        assert_eq!(
            err,
            RegistryError::Occupied {
                id: id.clone(),
                state: ConnectionState::Creating
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn terminal_record_is_evicted_by_a_new_attempt() {
        let now = Instant::now();
        let mut registry = Registry::new(alice());
        let id = ConnectionId::outgoing(&alice(), &bob(), StreamKind::Screen);
        let first = registry
            .put(draft(&id, Role::Sender), ConnectionState::Creating, Link::Pending, now)
            .expect("first")
            .ticket;
        registry
            .transition(&first, ConnectionState::Failed, now)
            .expect("current");
        let admitted = registry
            .put(draft(&id, Role::Sender), ConnectionState::Creating, Link::Pending, now)
            .expect("replaces failed");
        let evicted = admitted.evicted.expect("old record handed back");
        assert_eq!(evicted.generation(), first.generation());
        assert_ne!(admitted.ticket.generation(), first.generation());
        assert!(registry.current(&first).is_none());
    }

    #[test]
    fn placeholder_promotion_keeps_key_and_retypes_record() {
        let now = Instant::now();
        let mut registry = Registry::new(alice());
        let id = ConnectionId::incoming(&alice(), &bob(), StreamKind::Screen);
        let placeholder = registry
            .put(
                Draft {
                    id: id.clone(),
                    remote_name: Some("Bob".into()),
                    role: Role::Receiver,
                },
                ConnectionState::Requesting,
                Link::Placeholder,
                now,
            )
            .expect("placeholder")
            .ticket;
        let ticket = registry
            .promote_placeholder(&id, None, Role::Receiver, now)
            .expect("promote");
        let record = registry.current(&ticket).expect("promoted record");
        assert_eq!(record.state(), ConnectionState::Creating);
        assert!(!record.is_placeholder());
        assert_eq!(record.remote_name(), Some("Bob"));
        assert_eq!(record.direction(), Direction::Incoming);
        assert!(registry.current(&placeholder).is_none());
        assert_eq!(
            registry.promote_placeholder(&id, None, Role::Receiver, now),
            Err(RegistryError::NoPlaceholder { id })
        );
    }

    #[test]
    fn listing_only_returns_connected_matches() {
        let now = Instant::now();
        let mut registry = Registry::new(alice());
        let cam_in = ConnectionId::incoming(&alice(), &bob(), StreamKind::Camera);
        let screen_in = ConnectionId::incoming(&alice(), &bob(), StreamKind::Screen);
        let cam_out = ConnectionId::outgoing(&alice(), &bob(), StreamKind::Camera);
        for (id, role) in [
            (&cam_in, Role::Receiver),
            (&screen_in, Role::Receiver),
            (&cam_out, Role::Sender),
        ] {
            registry
                .put(draft(id, role), ConnectionState::Creating, Link::Pending, now)
                .expect("put");
        }
        let cam_ticket = registry.get(&cam_in).expect("cam").ticket();
        connect(&mut registry, &cam_ticket, now);

        let receivers = registry.list_by_role_and_kind(Role::Receiver, None);
        assert_eq!(receivers.len(), 1);
        assert_eq!(receivers[0].id(), &cam_in);
        assert!(
            registry
                .list_by_role_and_kind(Role::Sender, Some(StreamKind::Camera))
                .is_empty()
        );
        assert_eq!(registry.ids_for_peer(&bob()).len(), 3);
    }

    #[test]
    fn announcement_waits_for_connection_and_media() {
        let now = Instant::now();
        let mut registry = Registry::new(alice());
        let id = ConnectionId::incoming(&alice(), &bob(), StreamKind::Camera);
        let ticket = registry
            .put(draft(&id, Role::Receiver), ConnectionState::Creating, Link::Pending, now)
            .expect("put")
            .ticket;
        registry.add_remote_media(&ticket, RemoteMedia::default());
        assert!(registry.take_announcement(&ticket).is_none());
        connect(&mut registry, &ticket, now);
        assert!(registry.take_announcement(&ticket).is_some());
        assert!(registry.take_announcement(&ticket).is_none());
        assert!(registry.take_removal_notice(&ticket).is_some());
        assert!(registry.take_removal_notice(&ticket).is_none());
    }

    #[test]
    fn stale_ticket_cannot_transition() {
        let now = Instant::now();
        let mut registry = Registry::new(alice());
        let id = ConnectionId::outgoing(&alice(), &bob(), StreamKind::Camera);
        let ticket = registry
            .put(draft(&id, Role::Sender), ConnectionState::Creating, Link::Pending, now)
            .expect("put")
            .ticket;
        registry.close(&id, now);
        assert!(matches!(
            registry.transition(&ticket, ConnectionState::Offering, now),
            Err(RegistryError::Stale { .. })
        ));
    }

    #[test]
    fn closing_passes_through_closed_state() {
        let now = Instant::now();
        let mut registry = Registry::new(alice());
        let id = ConnectionId::incoming(&alice(), &bob(), StreamKind::Camera);
        let ticket = registry
            .put(draft(&id, Role::Receiver), ConnectionState::Creating, Link::Pending, now)
            .expect("put")
            .ticket;
        connect(&mut registry, &ticket, now);

        let record = registry.close(&id, now).expect("record");
        assert_eq!(record.state(), ConnectionState::Closed);
        assert_eq!(record.transitions(), 4);
        assert!(registry.close(&id, now).is_none());
        assert!(registry.is_empty());
    }
}
