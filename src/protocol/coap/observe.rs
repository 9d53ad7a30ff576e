//! RFC 7641 observation relations

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use coap_lite::{MessageType, ObserveOption, Packet};
use tracing::{debug, trace, warn};

use crate::{
    operation::{lock, OperationCore},
    response::Response,
    thing::FormOperation,
};

use super::{
    client::{CoapClient, Received},
    is_success, observe_sequence, to_response,
};

// Observe sequence numbers are 24 bit wide
const SEQUENCE_HALF_RANGE: u32 = 1 << 23;

// Past this delay a notification is newer whatever its sequence number
const SEQUENCE_VALIDITY: Duration = Duration::from_secs(128);

#[derive(Debug)]
struct Freshness {
    sequence: u32,
    received: Instant,
}

struct RelationState {
    request: Packet,
    canceled: AtomicBool,
    reactive: AtomicBool,
    pending: Mutex<Option<Packet>>,
    current: Mutex<Option<Response>>,
    last: Mutex<Option<Freshness>>,
}

/// Handle on an active observation, shared with the receiving thread
#[derive(Clone)]
pub struct CoapObserveRelation {
    state: Arc<RelationState>,
}

impl fmt::Debug for CoapObserveRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoapObserveRelation")
            .field("token", &self.token())
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

impl CoapObserveRelation {
    pub(crate) fn new(request: &Packet) -> Self {
        Self {
            state: Arc::new(RelationState {
                request: request.clone(),
                canceled: AtomicBool::new(false),
                reactive: AtomicBool::new(false),
                pending: Mutex::new(None),
                current: Mutex::new(None),
                last: Mutex::new(None),
            }),
        }
    }

    pub fn token(&self) -> &[u8] {
        self.state.request.get_token()
    }

    /// The most recent notification
    pub fn current(&self) -> Option<Response> {
        lock(&self.state.current).clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    /// Ask the server to end the observation with a deregistering GET on the same token
    pub fn proactive_cancel(&self) {
        if self.is_canceled() {
            return;
        }

        let mut deregister = self.state.request.clone();
        deregister.set_observe_value(ObserveOption::Deregister as u32);

        debug!(token = ?self.token(), "canceling observation proactively");
        *lock(&self.state.pending) = Some(deregister);
        self.mark_canceled();
    }

    /// Forget the observation locally, the next notification is answered with a reset
    pub fn reactive_cancel(&self) {
        if self.is_canceled() {
            return;
        }

        debug!(token = ?self.token(), "canceling observation reactively");
        self.state.reactive.store(true, Ordering::SeqCst);
        self.mark_canceled();
    }

    /// Send the registration again with the same token
    ///
    /// Does nothing once the relation is canceled.
    pub fn reregister(&self) {
        if self.is_canceled() {
            debug!(token = ?self.token(), "not reregistering a canceled observation");
            return;
        }

        *lock(&self.state.pending) = Some(self.state.request.clone());
    }

    pub(crate) fn mark_canceled(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);
    }

    fn take_pending(&self) -> Option<Packet> {
        lock(&self.state.pending).take()
    }

    // Accept the notification unless an earlier one with a newer sequence number arrived
    fn accept(&self, packet: &Packet) -> bool {
        let Some(sequence) = observe_sequence(packet) else {
            return true;
        };

        let mut last = lock(&self.state.last);
        let now = Instant::now();
        let fresh = last
            .as_ref()
            .map_or(true, |last| is_fresh(last, sequence, now));
        if fresh {
            *last = Some(Freshness {
                sequence,
                received: now,
            });
        }

        fresh
    }

    fn deliver(&self, packet: &Packet, op: FormOperation, core: &OperationCore) {
        let response = to_response(packet, op);
        *lock(&self.state.current) = Some(response.clone());
        core.on_response(response);
    }
}

fn is_fresh(last: &Freshness, sequence: u32, now: Instant) -> bool {
    let v1 = last.sequence;
    let v2 = sequence;

    (v1 < v2 && v2 - v1 < SEQUENCE_HALF_RANGE)
        || (v1 > v2 && v1 - v2 > SEQUENCE_HALF_RANGE)
        || now.duration_since(last.received) > SEQUENCE_VALIDITY
}

/// Register `request` and hand every notification to `core` until canceled or shut down
pub(crate) fn run(
    mut client: CoapClient,
    mut request: Packet,
    op: FormOperation,
    core: &OperationCore,
    relation: &CoapObserveRelation,
) {
    let first = match client.exchange(&mut request) {
        Ok(Some(packet)) => packet,
        Ok(None) => return,
        Err(err) => {
            warn!(error = %err, "observe registration failed");
            relation.mark_canceled();
            core.on_error();
            return;
        }
    };

    relation.accept(&first);
    relation.deliver(&first, op, core);
    if !is_success(&first) || observe_sequence(&first).is_none() {
        debug!(token = ?relation.token(), "observation not established by the server");
        relation.mark_canceled();
        return;
    }

    let poll_interval = client.config().poll_interval;
    loop {
        // Read before taking the pending request, a cancel always queues its request first
        let canceled = relation.is_canceled();
        if let Some(mut pending) = relation.take_pending() {
            match client.exchange(&mut pending) {
                Ok(Some(packet)) => {
                    relation.accept(&packet);
                    relation.deliver(&packet, op, core);
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "observe request failed");
                    core.on_error();
                }
            }
            continue;
        }

        let reactive = relation.state.reactive.load(Ordering::SeqCst);
        if canceled && !reactive {
            trace!(token = ?relation.token(), "observation ended");
            return;
        }

        let packet = match client.receive(poll_interval) {
            Ok(Received::Packet(packet)) => packet,
            Ok(Received::Timeout) => continue,
            Ok(Received::Shutdown) => return,
            Err(err) => {
                warn!(error = %err, "observe receive failed");
                relation.mark_canceled();
                core.on_error();
                return;
            }
        };

        let confirmable = matches!(packet.header.get_type(), MessageType::Confirmable);
        if !matches!(
            packet.header.get_type(),
            MessageType::Confirmable | MessageType::NonConfirmable
        ) {
            continue;
        }

        if packet.get_token() != relation.token() || reactive {
            trace!(message_id = packet.header.message_id, "rejecting notification");
            if let Err(err) = client.reset(&packet) {
                warn!(error = %err, "sending reset failed");
            }
            if reactive {
                return;
            }
            continue;
        }

        if confirmable {
            if let Err(err) = client.acknowledge(&packet) {
                warn!(error = %err, "acknowledging notification failed");
            }
        }

        if !relation.accept(&packet) {
            trace!(sequence = ?observe_sequence(&packet), "dropping stale notification");
            continue;
        }

        relation.deliver(&packet, op, core);
        if observe_sequence(&packet).is_none() {
            debug!(token = ?relation.token(), "observation ended by the server");
            relation.mark_canceled();
            return;
        }
    }
}
