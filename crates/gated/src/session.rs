//! Per-connection client session: the state machine that terminates one
//! untrusted socket and mediates between it and the message director bus.
//!
//! Each connection gets its own `ClientSession` task that:
//! - runs the CLIENT_HELLO handshake (hash + version check)
//! - enforces per-state message admissibility and field send permissions
//! - maintains the client's projection (owned / seen objects) and interests
//! - translates client intent into bus datagrams and bus notifications
//!   into client frames
//!
//! All session state is exclusive to the task; the allocator and registries
//! are shared read-mostly handles.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gate_core::{
    location_channel, Channel, ChannelAllocator, ClassRegistry, DistributedObject, DoId, Interest,
    InterestOperation, UberdogRegistry, Zone, BCHAN_CLIENTS,
};
use gate_wire::messages::{client, internal};
use gate_wire::{
    frames, ClientMessage, Datagram, DatagramIter, DisconnectReason, FrameCodec, InternalMessage,
    WireError, DATAGRAM_MAX_SIZE,
};

use crate::bus::{BusHandle, ParticipantId};
use crate::events::EventSender;

// ============================================================================
// Shared role state
// ============================================================================

/// State owned by the acceptor role and shared across sessions.
pub struct SessionShared {
    /// Version string clients must present in CLIENT_HELLO.
    pub version: String,

    /// Expected DC declaration hash.
    pub dc_hash: u32,

    pub classes: Arc<ClassRegistry>,
    pub uberdogs: Arc<UberdogRegistry>,

    /// Identity channel allocator. Sessions run on parallel tasks, so the
    /// allocator is interior-synchronized.
    pub allocator: Mutex<ChannelAllocator>,

    pub bus: BusHandle,
    pub events: EventSender,
}

fn lock_allocator(mutex: &Mutex<ChannelAllocator>) -> MutexGuard<'_, ChannelAllocator> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Session state machine
// ============================================================================

/// Handshake progress of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Nothing received yet; only CLIENT_HELLO is legal.
    New,
    /// Handshake done, not authenticated; may only poke anonymous uberdogs.
    Anonymous,
    /// Fully authenticated by a server-side role.
    Established,
}

impl ClientState {
    /// Maps the wire encoding used by CLIENTAGENT_SET_STATE.
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::New),
            1 => Some(Self::Anonymous),
            2 => Some(Self::Established),
            _ => None,
        }
    }
}

/// Whether the session keeps running after handling a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// One connected client.
pub struct ClientSession<S> {
    framed: Framed<S, FrameCodec>,
    shared: Arc<SessionShared>,
    participant: ParticipantId,
    inbox: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    remote: String,

    state: ClientState,
    /// Current identity channel; starts equal to the allocated channel.
    channel: Channel,
    allocated_channel: Channel,
    /// True until the first SET_CLIENT_ID rebinding.
    identity_is_allocated: bool,
    next_context: u32,
    ejected: bool,

    owned: HashSet<DoId>,
    seen: HashSet<DoId>,
    objects: HashMap<DoId, DistributedObject>,
    interests: HashMap<u16, Interest>,
    pending: HashMap<u32, InterestOperation>,
    post_removes: Vec<Bytes>,
    subscriptions: HashSet<Channel>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    /// Drives one connection to completion: allocation, main loop, teardown.
    pub async fn run(
        stream: S,
        shared: Arc<SessionShared>,
        remote: String,
        local: String,
        cancel: CancellationToken,
    ) {
        let mut framed = Framed::new(stream, FrameCodec);

        let Some((participant, inbox)) = shared.bus.attach().await else {
            warn!(remote = %remote, "Bus unavailable, dropping connection");
            return;
        };

        let Some(channel) = lock_allocator(&shared.allocator).alloc() else {
            warn!(remote = %remote, "Client capacity reached, ejecting");
            shared.events.send(vec![
                "Client:0".to_string(),
                "client-eject".to_string(),
                DisconnectReason::Generic.code().to_string(),
                "Client capacity reached".to_string(),
            ]);
            if let Ok(dg) = frames::eject(DisconnectReason::Generic, "Client capacity reached") {
                let _ = framed.send(dg).await;
            }
            shared.bus.detach(participant).await;
            return;
        };

        let mut session = Self {
            framed,
            shared,
            participant,
            inbox,
            cancel,
            remote: remote.clone(),
            state: ClientState::New,
            channel,
            allocated_channel: channel,
            identity_is_allocated: true,
            next_context: 0,
            ejected: false,
            owned: HashSet::new(),
            seen: HashSet::new(),
            objects: HashMap::new(),
            interests: HashMap::new(),
            pending: HashMap::new(),
            post_removes: Vec::new(),
            subscriptions: HashSet::new(),
        };

        session.subscribe(channel).await;
        session.subscribe(BCHAN_CLIENTS).await;
        session.send_event(vec![
            "client-connected".to_string(),
            remote,
            local,
        ]);
        info!(channel, remote = %session.remote, "Client connected");

        session.main_loop().await;
        session.teardown().await;
    }

    async fn main_loop(&mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(channel = self.channel, "Session cancelled");
                    break;
                }

                frame = self.framed.next() => match frame {
                    Some(Ok(bytes)) => match self.handle_client_datagram(bytes).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break,
                        Err(e) => {
                            debug!(channel = self.channel, error = %e, "Client write failed");
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        debug!(channel = self.channel, error = %e, "Client read failed");
                        break;
                    }
                    None => {
                        debug!(channel = self.channel, "Client closed connection");
                        break;
                    }
                },

                dg = self.inbox.recv() => match dg {
                    Some(bytes) => match self.handle_internal_datagram(bytes).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break,
                        Err(e) => {
                            debug!(channel = self.channel, error = %e, "Client write failed");
                            break;
                        }
                    },
                    None => {
                        warn!(channel = self.channel, "Bus dropped session inbox");
                        break;
                    }
                },
            }
        }
    }

    /// Publishes queued post-removes, releases subscriptions, and returns
    /// the identity channel to the allocator.
    async fn teardown(&mut self) {
        for dg in std::mem::take(&mut self.post_removes) {
            self.shared.bus.publish(dg).await;
        }
        for ch in std::mem::take(&mut self.subscriptions) {
            self.shared.bus.unsubscribe(self.participant, ch).await;
        }
        self.shared.bus.detach(self.participant).await;
        lock_allocator(&self.shared.allocator).free(self.allocated_channel);

        if !self.ejected {
            self.send_event(vec!["client-disconnected".to_string()]);
        }
        info!(channel = self.allocated_channel, remote = %self.remote, "Client disconnected");
    }

    // ========================================================================
    // Client -> server path
    // ========================================================================

    async fn handle_client_datagram(&mut self, bytes: Bytes) -> Result<Flow, WireError> {
        let mut iter = DatagramIter::new(bytes);
        // Message type retained for diagnostics before the body is decoded.
        let msgtype = iter.clone().read_u16().unwrap_or(0);

        let msg = match ClientMessage::decode(&mut iter) {
            Ok(msg) => msg,
            Err(WireError::Truncated { .. }) => {
                return Ok(self
                    .eject(
                        DisconnectReason::TruncatedDatagram,
                        "Datagram unexpectedly ended while iterating.",
                        false,
                    )
                    .await);
            }
            Err(e) => return Err(e),
        };

        let flow = match self.state {
            ClientState::New => self.handle_pre_hello(msg).await?,
            ClientState::Anonymous => self.handle_pre_auth(msg, msgtype).await?,
            ClientState::Established => self.handle_established(msg, msgtype).await?,
        };
        if flow == Flow::Close {
            return Ok(Flow::Close);
        }

        if iter.remaining() > 0 {
            return Ok(self
                .eject(
                    DisconnectReason::OversizedDatagram,
                    "Datagram contains excess data.",
                    true,
                )
                .await);
        }
        Ok(Flow::Continue)
    }

    /// NEW state: only CLIENT_HELLO is accepted.
    async fn handle_pre_hello(&mut self, msg: ClientMessage) -> Result<Flow, WireError> {
        let ClientMessage::Hello { dc_hash, version } = msg else {
            return Ok(self
                .eject(
                    DisconnectReason::NoHello,
                    "First packet is not CLIENT_HELLO",
                    false,
                )
                .await);
        };

        if dc_hash != self.shared.dc_hash {
            let text = format!(
                "Client DC hash mismatch: server=0x{:x}, client=0x{:x}",
                self.shared.dc_hash, dc_hash
            );
            return Ok(self.eject(DisconnectReason::BadDcHash, &text, false).await);
        }

        if version != self.shared.version {
            let text = format!(
                "Client version mismatch: server={}, client={}",
                self.shared.version, version
            );
            return Ok(self.eject(DisconnectReason::BadVersion, &text, false).await);
        }

        self.send_client(frames::hello_resp()).await?;
        self.state = ClientState::Anonymous;
        Ok(Flow::Continue)
    }

    /// ANONYMOUS state: only field updates, and only to anonymous uberdogs.
    async fn handle_pre_auth(
        &mut self,
        msg: ClientMessage,
        msgtype: u16,
    ) -> Result<Flow, WireError> {
        match msg {
            ClientMessage::SetField {
                do_id,
                field_id,
                payload,
            } => self.handle_set_field(do_id, field_id, payload).await,
            _ => {
                let text =
                    format!("Message type {msgtype} not allowed prior to authentication.");
                Ok(self
                    .eject(DisconnectReason::InvalidMsgtype, &text, true)
                    .await)
            }
        }
    }

    /// ESTABLISHED state: the full client message set.
    async fn handle_established(
        &mut self,
        msg: ClientMessage,
        msgtype: u16,
    ) -> Result<Flow, WireError> {
        match msg {
            ClientMessage::SetField {
                do_id,
                field_id,
                payload,
            } => self.handle_set_field(do_id, field_id, payload).await,
            ClientMessage::ObjectLocation {
                do_id,
                parent,
                zone,
            } => self.handle_object_location(do_id, parent, zone).await,
            ClientMessage::AddInterest {
                context,
                interest_id,
                parent,
                zones,
            } => {
                let interest =
                    Interest::new(interest_id, parent, zones.into_iter().collect());
                self.add_interest(interest, context).await
            }
            ClientMessage::RemoveInterest {
                context,
                interest_id,
            } => self.handle_remove_interest(context, interest_id).await,
            ClientMessage::Hello { .. } | ClientMessage::Unknown { .. } => {
                let text = format!("Message type {msgtype} not valid.");
                Ok(self
                    .eject(DisconnectReason::InvalidMsgtype, &text, true)
                    .await)
            }
        }
    }

    async fn handle_set_field(
        &mut self,
        do_id: DoId,
        field_id: u16,
        payload: Bytes,
    ) -> Result<Flow, WireError> {
        let Some(class) = self.lookup_class(do_id) else {
            let text = format!("Client tried to send update to nonexistent object {do_id}");
            return Ok(self
                .eject(DisconnectReason::MissingObject, &text, true)
                .await);
        };

        // Pre-auth clients may only update anonymous uberdogs.
        if self.state != ClientState::Established && !self.shared.uberdogs.is_anonymous(do_id) {
            let text = format!(
                "Client tried to send update to non-anonymous object {}({do_id})",
                class.name()
            );
            return Ok(self
                .eject(DisconnectReason::AnonymousViolation, &text, true)
                .await);
        }

        let Some(field) = class.field_by_index(field_id) else {
            let text = format!(
                "Client tried to send update for nonexistent field {field_id} to object {}({do_id})",
                class.name()
            );
            return Ok(self
                .eject(DisconnectReason::ForbiddenField, &text, true)
                .await);
        };

        let is_owned = self.owned.contains(&do_id);
        if !field.is_clsend() && !(is_owned && field.is_ownsend()) {
            let text = format!(
                "Client tried to send update for non-sendable field: {}({do_id}).{}",
                class.name(),
                field.name()
            );
            return Ok(self
                .eject(DisconnectReason::ForbiddenField, &text, true)
                .await);
        }

        let mut reader = DatagramIter::new(payload);
        let mut data = Vec::new();
        if reader.unpack_field(field, &mut data).is_err() {
            return Ok(self
                .eject(
                    DisconnectReason::TruncatedDatagram,
                    "Datagram unexpectedly ended while iterating.",
                    false,
                )
                .await);
        }

        let mut dg = Datagram::with_server_header(
            Channel::from(do_id),
            self.channel,
            internal::STATESERVER_OBJECT_SET_FIELD,
        );
        dg.add_u32(do_id);
        dg.add_u16(field_id);
        if data.len() > DATAGRAM_MAX_SIZE - dg.size() {
            return Ok(self
                .eject(
                    DisconnectReason::OversizedDatagram,
                    "Field update too large to be routed on MD.",
                    true,
                )
                .await);
        }
        dg.add_data(&data);
        self.shared.bus.publish(dg.freeze()).await;

        if reader.remaining() > 0 {
            return Ok(self
                .eject(
                    DisconnectReason::OversizedDatagram,
                    "Datagram contains excess data.",
                    true,
                )
                .await);
        }
        Ok(Flow::Continue)
    }

    async fn handle_object_location(
        &mut self,
        do_id: DoId,
        parent: DoId,
        zone: Zone,
    ) -> Result<Flow, WireError> {
        if !self.objects.contains_key(&do_id) {
            let text = format!("Client tried to manipulate unknown object {do_id}");
            return Ok(self
                .eject(DisconnectReason::MissingObject, &text, true)
                .await);
        }
        if !self.owned.contains(&do_id) {
            return Ok(self
                .eject(
                    DisconnectReason::ForbiddenRelocate,
                    "Can't relocate an object the client doesn't own",
                    true,
                )
                .await);
        }

        let mut dg = Datagram::with_server_header(
            Channel::from(do_id),
            self.channel,
            internal::STATESERVER_OBJECT_SET_LOCATION,
        );
        dg.add_u32(parent);
        dg.add_u32(zone);
        Ok(self.send_upstream(dg).await)
    }

    // ========================================================================
    // Interest lifecycle
    // ========================================================================

    async fn add_interest(&mut self, interest: Interest, context: u32) -> Result<Flow, WireError> {
        // Zones not covered by any existing interest (including the previous
        // version of this one) need subscribing and a zone-objects query.
        let new_zones: HashSet<Zone> = interest
            .zones
            .iter()
            .copied()
            .filter(|z| self.interests_covering(interest.parent, *z) == 0)
            .collect();

        if let Some(previous) = self.interests.get(&interest.id).cloned() {
            // Alteration: drop the cells only the old version could see and
            // the new one no longer covers.
            let mut killed: HashSet<Zone> = HashSet::new();
            for z in &previous.zones {
                if self.interests_covering(previous.parent, *z) > 1 {
                    continue;
                }
                if interest.parent != previous.parent || !interest.zones.contains(z) {
                    killed.insert(*z);
                }
            }
            self.close_zones(previous.parent, &killed).await?;
        }
        self.interests.insert(interest.id, interest.clone());

        if new_zones.is_empty() {
            // Nothing new to query; the interest is already complete.
            self.send_client(frames::done_interest_resp(context, interest.id))
                .await?;
            return Ok(Flow::Continue);
        }

        let request_context = self.next_context;
        self.next_context += 1;
        self.pending.insert(
            request_context,
            InterestOperation::new(interest.id, context, interest.parent, new_zones.clone()),
        );

        let mut dg = Datagram::with_server_header(
            Channel::from(interest.parent),
            self.channel,
            internal::STATESERVER_OBJECT_GET_ZONES_OBJECTS,
        );
        dg.add_u32(request_context);
        dg.add_u32(interest.parent);
        dg.add_u16(new_zones.len() as u16);
        for z in &new_zones {
            dg.add_u32(*z);
            self.subscribe(location_channel(interest.parent, *z)).await;
        }
        Ok(self.send_upstream(dg).await)
    }

    async fn handle_remove_interest(
        &mut self,
        context: u32,
        interest_id: u16,
    ) -> Result<Flow, WireError> {
        let Some(interest) = self.interests.get(&interest_id).cloned() else {
            return Ok(self
                .eject(
                    DisconnectReason::Generic,
                    "Tried to remove a non-existing interest",
                    true,
                )
                .await);
        };

        let killed: HashSet<Zone> = interest
            .zones
            .iter()
            .copied()
            .filter(|z| self.interests_covering(interest.parent, *z) == 1)
            .collect();
        self.close_zones(interest.parent, &killed).await?;

        self.send_client(frames::done_interest_resp(context, interest_id))
            .await?;
        self.interests.remove(&interest_id);
        Ok(Flow::Continue)
    }

    /// Evicts every non-owned projected object in the killed cells and
    /// releases the location subscriptions.
    async fn close_zones(
        &mut self,
        parent: DoId,
        killed: &HashSet<Zone>,
    ) -> Result<(), WireError> {
        let victims: Vec<DoId> = self
            .objects
            .values()
            .filter(|obj| {
                obj.parent == parent
                    && killed.contains(&obj.zone)
                    && !self.owned.contains(&obj.id)
            })
            .map(|obj| obj.id)
            .collect();

        for do_id in victims {
            self.send_client(frames::object_leaving(do_id)).await?;
            self.seen.remove(&do_id);
            self.objects.remove(&do_id);
        }

        for z in killed {
            self.unsubscribe(location_channel(parent, *z)).await;
        }
        Ok(())
    }

    /// Number of interests covering a `(parent, zone)` cell.
    fn interests_covering(&self, parent: DoId, zone: Zone) -> usize {
        self.interests
            .values()
            .filter(|i| i.covers(parent, zone))
            .count()
    }

    /// Fires completion for every pending operation that became ready.
    async fn flush_ready_operations(&mut self) -> Result<(), WireError> {
        let ready: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, op)| op.is_ready(&self.objects))
            .map(|(ctx, _)| *ctx)
            .collect();
        for ctx in ready {
            if let Some(op) = self.pending.remove(&ctx) {
                self.send_client(frames::done_interest_resp(
                    op.client_context(),
                    op.interest_id(),
                ))
                .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Bus -> client path
    // ========================================================================

    async fn handle_internal_datagram(&mut self, bytes: Bytes) -> Result<Flow, WireError> {
        let mut iter = DatagramIter::new(bytes);
        let sender = match iter.read_u64() {
            Ok(s) => s,
            Err(e) => {
                warn!(channel = self.channel, error = %e, "Dropping malformed bus datagram");
                return Ok(Flow::Continue);
            }
        };
        let msg = match InternalMessage::decode(&mut iter) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(channel = self.channel, error = %e, "Dropping malformed bus datagram");
                return Ok(Flow::Continue);
            }
        };

        match msg {
            InternalMessage::Eject { reason, message } => {
                Ok(self.eject_code(reason, &message, false).await)
            }

            InternalMessage::Drop => Ok(Flow::Close),

            InternalMessage::SetState { state } => {
                match ClientState::from_wire(state) {
                    Some(s) => self.state = s,
                    None => warn!(channel = self.channel, state, "Ignoring unknown client state"),
                }
                Ok(Flow::Continue)
            }

            InternalMessage::SetClientId { channel } => {
                if self.identity_is_allocated {
                    // First rebinding: the old identity is the allocated
                    // channel, which stays subscribed until teardown.
                    self.identity_is_allocated = false;
                } else {
                    let old = self.channel;
                    self.unsubscribe(old).await;
                }
                self.channel = channel;
                self.subscribe(channel).await;
                Ok(Flow::Continue)
            }

            InternalMessage::SendDatagram { data } => {
                self.framed.send(data).await?;
                Ok(Flow::Continue)
            }

            InternalMessage::OpenChannel { channel } => {
                self.subscribe(channel).await;
                Ok(Flow::Continue)
            }

            InternalMessage::CloseChannel { channel } => {
                self.unsubscribe(channel).await;
                Ok(Flow::Continue)
            }

            InternalMessage::AddPostRemove { datagram } => {
                self.post_removes.push(datagram);
                Ok(Flow::Continue)
            }

            InternalMessage::ClearPostRemoves => {
                self.post_removes.clear();
                Ok(Flow::Continue)
            }

            InternalMessage::SetField { do_id, payload } => {
                if self.lookup_class(do_id).is_none() {
                    warn!(
                        channel = self.channel,
                        do_id, "Field update for unknown object"
                    );
                    return Ok(Flow::Continue);
                }
                // Skip the echo of this client's own updates.
                if sender != self.channel {
                    self.send_client(frames::object_set_field(do_id, &payload))
                        .await?;
                }
                Ok(Flow::Continue)
            }

            InternalMessage::DeleteRam { do_id } => {
                if self.lookup_class(do_id).is_none() {
                    warn!(
                        channel = self.channel,
                        do_id, "Object delete for unknown object"
                    );
                    return Ok(Flow::Continue);
                }
                if self.seen.remove(&do_id) {
                    self.send_client(frames::object_leaving(do_id)).await?;
                }
                if self.owned.remove(&do_id) {
                    self.send_client(frames::object_leaving_owner(do_id)).await?;
                }
                self.objects.remove(&do_id);
                Ok(Flow::Continue)
            }

            InternalMessage::EnterOwner {
                do_id,
                parent,
                zone,
                dc_id,
                payload,
            } => {
                if !self.objects.contains_key(&do_id) {
                    let Some(class) = self.shared.classes.get_class(dc_id) else {
                        warn!(
                            channel = self.channel,
                            do_id, dc_id, "Owner entry with unknown class"
                        );
                        return Ok(Flow::Continue);
                    };
                    self.objects.insert(
                        do_id,
                        DistributedObject {
                            id: do_id,
                            parent,
                            zone,
                            class,
                        },
                    );
                }
                self.owned.insert(do_id);

                self.send_client(frames::enter_object(
                    do_id,
                    parent,
                    zone,
                    dc_id,
                    &payload,
                    client::ENTER_OBJECT_REQUIRED_OTHER_OWNER,
                ))
                .await?;
                Ok(Flow::Continue)
            }

            InternalMessage::EnterLocation {
                do_id,
                parent,
                zone,
                dc_id,
                payload,
                other,
            } => {
                if self.owned.contains(&do_id) || self.seen.contains(&do_id) {
                    // Already visible; a repeated entry is a no-op.
                    return Ok(Flow::Continue);
                }
                if !self.objects.contains_key(&do_id) {
                    let Some(class) = self.shared.classes.get_class(dc_id) else {
                        warn!(
                            channel = self.channel,
                            do_id, dc_id, "Location entry with unknown class"
                        );
                        return Ok(Flow::Continue);
                    };
                    self.objects.insert(
                        do_id,
                        DistributedObject {
                            id: do_id,
                            parent,
                            zone,
                            class,
                        },
                    );
                }
                self.seen.insert(do_id);

                let msgtype = if other {
                    client::ENTER_OBJECT_REQUIRED_OTHER
                } else {
                    client::ENTER_OBJECT_REQUIRED
                };
                self.send_client(frames::enter_object(
                    do_id, parent, zone, dc_id, &payload, msgtype,
                ))
                .await?;

                self.flush_ready_operations().await?;
                Ok(Flow::Continue)
            }

            InternalMessage::ZonesCountResp { context, count } => {
                let Some(op) = self.pending.get_mut(&context) else {
                    error!(
                        channel = self.channel,
                        context, "Zone count response for unknown context"
                    );
                    return Ok(Flow::Continue);
                };
                op.store_total(count);
                if self
                    .pending
                    .get(&context)
                    .is_some_and(|op| op.is_ready(&self.objects))
                {
                    if let Some(op) = self.pending.remove(&context) {
                        self.send_client(frames::done_interest_resp(
                            op.client_context(),
                            op.interest_id(),
                        ))
                        .await?;
                    }
                }
                Ok(Flow::Continue)
            }

            InternalMessage::ChangingLocation {
                do_id,
                new_parent,
                new_zone,
            } => {
                // Zone match is deliberately parent-agnostic, matching the
                // long-standing behavior clients depend on.
                let still_visible = self
                    .interests
                    .values()
                    .any(|i| i.zones.contains(&new_zone));

                if let Some(obj) = self.objects.get_mut(&do_id) {
                    obj.parent = new_parent;
                    obj.zone = new_zone;
                }

                if !still_visible && !self.owned.contains(&do_id) {
                    self.seen.remove(&do_id);
                    self.objects.remove(&do_id);
                    self.send_client(frames::object_leaving(do_id)).await?;
                } else {
                    self.send_client(frames::object_location(do_id, new_parent, new_zone))
                        .await?;
                }
                Ok(Flow::Continue)
            }

            InternalMessage::Unknown { msgtype } => {
                error!(
                    channel = self.channel,
                    msgtype, "Unknown internal message type"
                );
                Ok(Flow::Continue)
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Resolves the class a client-supplied object id refers to: uberdogs
    /// first, then the projection, but only for objects the client has
    /// actually been shown.
    fn lookup_class(&self, do_id: DoId) -> Option<Arc<gate_core::DcClass>> {
        if let Some(dog) = self.shared.uberdogs.get(do_id) {
            return Some(dog.class.clone());
        }
        if self.owned.contains(&do_id) || self.seen.contains(&do_id) {
            return self.objects.get(&do_id).map(|obj| obj.class.clone());
        }
        None
    }

    async fn send_client(&mut self, dg: Datagram) -> Result<(), WireError> {
        self.framed.send(dg).await
    }

    /// Routes a server-bound datagram, ejecting if it cannot fit on the bus.
    async fn send_upstream(&mut self, dg: Datagram) -> Flow {
        if dg.size() > DATAGRAM_MAX_SIZE {
            return self
                .eject(
                    DisconnectReason::OversizedDatagram,
                    "Server-bound datagram too large to be routed on MD.",
                    true,
                )
                .await;
        }
        self.shared.bus.publish(dg.freeze()).await;
        Flow::Continue
    }

    async fn subscribe(&mut self, channel: Channel) {
        if self.subscriptions.insert(channel) {
            self.shared.bus.subscribe(self.participant, channel).await;
        }
    }

    async fn unsubscribe(&mut self, channel: Channel) {
        if self.subscriptions.remove(&channel) {
            self.shared.bus.unsubscribe(self.participant, channel).await;
        }
    }

    fn send_event(&self, parts: Vec<String>) {
        let mut event = Vec::with_capacity(parts.len() + 1);
        event.push(format!("Client:{}", self.allocated_channel));
        event.extend(parts);
        self.shared.events.send(event);
    }

    async fn eject(&mut self, reason: DisconnectReason, text: &str, security: bool) -> Flow {
        self.eject_code(reason.code(), text, security).await
    }

    /// Terminates the connection: event, best-effort CLIENT_EJECT frame,
    /// then close. Server-specified reasons arrive as raw codes.
    async fn eject_code(&mut self, code: u16, text: &str, security: bool) -> Flow {
        if security {
            warn!(
                channel = self.channel,
                code, text, "Terminating client connection (security)"
            );
        } else {
            error!(
                channel = self.channel,
                code, text, "Terminating client connection"
            );
        }

        let kind = if security {
            "client-eject-security"
        } else {
            "client-eject"
        };
        self.send_event(vec![kind.to_string(), code.to_string(), text.to_string()]);

        if let Ok(dg) = frames::eject_code(code, text) {
            let _ = self.framed.send(dg).await;
        }
        self.ejected = true;
        Flow::Close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_state_from_wire() {
        assert_eq!(ClientState::from_wire(0), Some(ClientState::New));
        assert_eq!(ClientState::from_wire(1), Some(ClientState::Anonymous));
        assert_eq!(ClientState::from_wire(2), Some(ClientState::Established));
        assert_eq!(ClientState::from_wire(3), None);
    }
}
