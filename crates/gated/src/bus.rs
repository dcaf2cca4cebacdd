//! Message director participant glue.
//!
//! The bus actor is the single owner of the channel routing table. It
//! receives commands over an mpsc channel and fans published datagrams out
//! to every participant subscribed to a recipient channel. Because one task
//! processes every command in arrival order, delivery order per channel is
//! exactly publish order, which the interest bookkeeping relies on.
//!
//! Sessions interact through the cheap-to-clone [`BusHandle`]; each attaches
//! with an unbounded inbox and gets back a participant id used for its
//! subscriptions.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use gate_core::Channel;
use gate_wire::DatagramIter;

/// Identifies one attached participant (usually a client session).
pub type ParticipantId = u64;

/// Commands sent to the bus actor.
#[derive(Debug)]
pub enum BusCommand {
    /// Attach a participant and return its id.
    Attach {
        inbox: mpsc::UnboundedSender<Bytes>,
        respond_to: oneshot::Sender<ParticipantId>,
    },

    /// Detach a participant and drop all of its subscriptions.
    Detach { participant: ParticipantId },

    /// Subscribe a participant to a channel.
    Subscribe {
        participant: ParticipantId,
        channel: Channel,
    },

    /// Remove a participant's subscription to a channel.
    Unsubscribe {
        participant: ParticipantId,
        channel: Channel,
    },

    /// Route a datagram to every subscriber of its recipient channels.
    Publish { datagram: Bytes },
}

/// The routing actor. Owns the subscription table.
pub struct BusActor {
    receiver: mpsc::Receiver<BusCommand>,
    next_participant: ParticipantId,
    participants: HashMap<ParticipantId, mpsc::UnboundedSender<Bytes>>,
    subscriptions: HashMap<Channel, HashSet<ParticipantId>>,
}

impl BusActor {
    pub fn new(receiver: mpsc::Receiver<BusCommand>) -> Self {
        Self {
            receiver,
            next_participant: 1,
            participants: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Runs the actor until every handle is dropped.
    pub async fn run(mut self) {
        info!("Message bus starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            participants = self.participants.len(),
            "Message bus stopped"
        );
    }

    fn handle_command(&mut self, cmd: BusCommand) {
        match cmd {
            BusCommand::Attach { inbox, respond_to } => {
                let id = self.next_participant;
                self.next_participant += 1;
                self.participants.insert(id, inbox);
                debug!(participant = id, "Participant attached");
                let _ = respond_to.send(id);
            }
            BusCommand::Detach { participant } => {
                self.participants.remove(&participant);
                self.subscriptions.retain(|_, subs| {
                    subs.remove(&participant);
                    !subs.is_empty()
                });
                debug!(participant, "Participant detached");
            }
            BusCommand::Subscribe {
                participant,
                channel,
            } => {
                if !self.participants.contains_key(&participant) {
                    warn!(participant, channel, "Subscribe from unknown participant");
                    return;
                }
                self.subscriptions
                    .entry(channel)
                    .or_default()
                    .insert(participant);
            }
            BusCommand::Unsubscribe {
                participant,
                channel,
            } => {
                if let Some(subs) = self.subscriptions.get_mut(&channel) {
                    subs.remove(&participant);
                    if subs.is_empty() {
                        self.subscriptions.remove(&channel);
                    }
                }
            }
            BusCommand::Publish { datagram } => self.route(datagram),
        }
    }

    /// Parses the envelope recipients and delivers the rest of the datagram
    /// (sender onward) once to each matching participant.
    fn route(&mut self, datagram: Bytes) {
        let mut iter = DatagramIter::new(datagram.clone());
        let count = match iter.read_u8() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Dropping unroutable datagram");
                return;
            }
        };
        let mut recipients = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            match iter.read_u64() {
                Ok(ch) => recipients.push(ch),
                Err(e) => {
                    warn!(error = %e, "Dropping unroutable datagram");
                    return;
                }
            }
        }

        // Payload delivered to participants: sender + msgtype + body.
        let payload = datagram.slice(1 + 8 * usize::from(count)..);

        let mut delivered: HashSet<ParticipantId> = HashSet::new();
        let mut dead: Vec<ParticipantId> = Vec::new();
        for channel in recipients {
            let Some(subs) = self.subscriptions.get(&channel) else {
                continue;
            };
            for &participant in subs {
                if !delivered.insert(participant) {
                    continue;
                }
                match self.participants.get(&participant) {
                    Some(inbox) => {
                        if inbox.send(payload.clone()).is_err() {
                            dead.push(participant);
                        }
                    }
                    None => dead.push(participant),
                }
            }
        }

        for participant in dead {
            debug!(participant, "Removing dead participant");
            self.participants.remove(&participant);
            self.subscriptions.retain(|_, subs| {
                subs.remove(&participant);
                !subs.is_empty()
            });
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, channel: Channel) -> usize {
        self.subscriptions
            .get(&channel)
            .map_or(0, HashSet::len)
    }
}

/// Cheap-to-clone handle for talking to the bus actor.
#[derive(Debug, Clone)]
pub struct BusHandle {
    sender: mpsc::Sender<BusCommand>,
}

impl BusHandle {
    pub fn new(sender: mpsc::Sender<BusCommand>) -> Self {
        Self { sender }
    }

    /// Attaches a participant. Returns the participant id and its inbox.
    ///
    /// Returns `None` if the bus has shut down.
    pub async fn attach(&self) -> Option<(ParticipantId, mpsc::UnboundedReceiver<Bytes>)> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BusCommand::Attach {
                inbox: inbox_tx,
                respond_to: tx,
            })
            .await
            .ok()?;
        let id = rx.await.ok()?;
        Some((id, inbox_rx))
    }

    pub async fn detach(&self, participant: ParticipantId) {
        let _ = self.sender.send(BusCommand::Detach { participant }).await;
    }

    pub async fn subscribe(&self, participant: ParticipantId, channel: Channel) {
        let _ = self
            .sender
            .send(BusCommand::Subscribe {
                participant,
                channel,
            })
            .await;
    }

    pub async fn unsubscribe(&self, participant: ParticipantId, channel: Channel) {
        let _ = self
            .sender
            .send(BusCommand::Unsubscribe {
                participant,
                channel,
            })
            .await;
    }

    /// Publishes an enveloped datagram onto the bus.
    pub async fn publish(&self, datagram: Bytes) {
        let _ = self.sender.send(BusCommand::Publish { datagram }).await;
    }
}

/// Spawns the bus actor and returns a handle to it.
pub fn spawn_bus() -> BusHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = BusActor::new(rx);
    tokio::spawn(actor.run());
    BusHandle::new(tx)
}
