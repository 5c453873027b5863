use crate::{AgentError, AgentResult};
use rumqttc::{QoS, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub(crate) type AckReceiver = oneshot::Receiver<AgentResult<()>>;

#[derive(Debug, Clone, Copy)]
pub(crate) enum RequestKind {
    Publish,
    Subscribe,
}

struct Pending {
    topic: String,
    qos: QoS,
    reply: oneshot::Sender<AgentResult<()>>,
}

#[derive(Default)]
struct AckState {
    queued_publishes: VecDeque<Pending>,
    queued_subscribes: VecDeque<Pending>,
    awaiting_puback: HashMap<u16, Pending>,
    awaiting_suback: HashMap<u16, Pending>,
    closed: Option<String>,
}

/// Correlates requests with broker acknowledgements.
///
/// The client does not expose packet ids, so requests are queued in the
/// order they are handed to the client and matched to the packet id the
/// event loop reports when it writes them out. Callers must enqueue and
/// hand the request to the client under one lock to keep both orders equal.
#[derive(Default)]
pub(crate) struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    pub(crate) fn enqueue(&self, kind: RequestKind, topic: &str, qos: QoS) -> AckReceiver {
        let (reply, receiver) = oneshot::channel();
        let mut state = self.lock();

        if let Some(reason) = &state.closed {
            let _ = reply.send(Err(AgentError::Connection(reason.clone())));
            return receiver;
        }

        let pending = Pending {
            topic: topic.to_string(),
            qos,
            reply,
        };
        match kind {
            RequestKind::Publish => state.queued_publishes.push_back(pending),
            RequestKind::Subscribe => state.queued_subscribes.push_back(pending),
        }
        receiver
    }

    /// The request never reached the client; forget the newest queued entry.
    pub(crate) fn abandon_last(&self, kind: RequestKind) {
        let mut state = self.lock();
        match kind {
            RequestKind::Publish => state.queued_publishes.pop_back(),
            RequestKind::Subscribe => state.queued_subscribes.pop_back(),
        };
    }

    pub(crate) fn on_outgoing_publish(&self, pkid: u16) {
        let mut state = self.lock();
        let Some(pending) = state.queued_publishes.pop_front() else {
            debug!(pkid, "outgoing publish without a tracked request");
            return;
        };

        if pending.qos == QoS::AtMostOnce {
            let _ = pending.reply.send(Ok(()));
        } else {
            state.awaiting_puback.insert(pkid, pending);
        }
    }

    pub(crate) fn on_outgoing_subscribe(&self, pkid: u16) {
        let mut state = self.lock();
        match state.queued_subscribes.pop_front() {
            Some(pending) => {
                state.awaiting_suback.insert(pkid, pending);
            }
            None => debug!(pkid, "outgoing subscribe without a tracked request"),
        }
    }

    pub(crate) fn on_puback(&self, pkid: u16) {
        let pending = self.lock().awaiting_puback.remove(&pkid);
        match pending {
            Some(pending) => {
                let _ = pending.reply.send(Ok(()));
            }
            None => debug!(pkid, "PUBACK for unknown packet"),
        }
    }

    pub(crate) fn on_suback(&self, pkid: u16, return_codes: &[SubscribeReasonCode]) {
        let Some(pending) = self.lock().awaiting_suback.remove(&pkid) else {
            debug!(pkid, "SUBACK for unknown packet");
            return;
        };

        let granted = !return_codes.is_empty()
            && return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)));

        let result = if granted {
            Ok(())
        } else {
            warn!(topic = %pending.topic, ?return_codes, "subscription refused");
            Err(AgentError::SubscribeRejected {
                topic: pending.topic.clone(),
            })
        };
        let _ = pending.reply.send(result);
    }

    /// Drop written requests whose caller stopped waiting. Queued entries stay
    /// since they still pair with the next packet id the event loop reports.
    pub(crate) fn forget_abandoned(&self) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let before = state.awaiting_puback.len() + state.awaiting_suback.len();
        state.awaiting_puback.retain(|_, pending| !pending.reply.is_closed());
        state.awaiting_suback.retain(|_, pending| !pending.reply.is_closed());
        let forgotten = before - state.awaiting_puback.len() - state.awaiting_suback.len();
        if forgotten > 0 {
            debug!(forgotten, "dropped unacknowledged requests");
        }
        forgotten
    }

    /// Fail every outstanding request and refuse new ones
    pub(crate) fn close(&self, reason: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.closed = Some(reason.to_string());

        let queued = state
            .queued_publishes
            .drain(..)
            .chain(state.queued_subscribes.drain(..))
            .collect::<Vec<_>>();
        let awaiting = state
            .awaiting_puback
            .drain()
            .chain(state.awaiting_suback.drain())
            .map(|(_, pending)| pending)
            .collect::<Vec<_>>();

        for pending in queued.into_iter().chain(awaiting) {
            let _ = pending
                .reply
                .send(Err(AgentError::Connection(reason.to_string())));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
