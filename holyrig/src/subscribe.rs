//! # Subscription manager
//!
//! Holds (subscriber, rig, field-set) tuples and fans status diffs out as
//! `status_update` notifications. Delivery is fire-and-forget: a
//! notification that cannot be handed to the transport immediately waits in
//! a per-subscriber FIFO, and once that FIFO exceeds the configured limit
//! the oldest updates are dropped and the subscriber is marked degraded.
//! Per-subscriber order is preserved; a change is delivered at most once.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::rig::StatusUpdate;
use crate::rpc;

/// One UDP datagram queued for delivery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SubscribeError {
    #[error("unknown subscription `{0}`")]
    UnknownSubscription(String),
}

/// Requests handled by the manager task.
#[derive(Debug)]
pub enum SubscribeRequest {
    Subscribe {
        peer: SocketAddr,
        rig_id: String,
        fields: BTreeSet<String>,
        reply: oneshot::Sender<String>,
    },
    Unsubscribe {
        peer: SocketAddr,
        subscription_id: String,
        reply: oneshot::Sender<Result<(), SubscribeError>>,
    },
}

/// Senders feeding the manager task.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    pub requests: mpsc::Sender<SubscribeRequest>,
    pub updates: mpsc::Sender<StatusUpdate>,
}

/// Spawns the manager task. `queue_limit` is the per-subscriber bound (*Q*).
pub fn spawn(outbound: mpsc::Sender<Datagram>, queue_limit: usize) -> SubscriptionHandle {
    let (requests_tx, requests_rx) = mpsc::channel(64);
    let (updates_tx, updates_rx) = mpsc::channel(64);

    let manager = Manager {
        requests: requests_rx,
        updates: updates_rx,
        outbound,
        queue_limit,
        subscriptions: Vec::new(),
        next_id: 0,
    };
    tokio::spawn(manager.run());

    SubscriptionHandle {
        requests: requests_tx,
        updates: updates_tx,
    }
}

#[derive(Debug)]
struct Subscription {
    id: String,
    peer: SocketAddr,
    rig_id: String,
    fields: BTreeSet<String>,
    queue: VecDeque<Vec<u8>>,
    degraded: bool,
    dropped: u64,
}

struct Manager {
    requests: mpsc::Receiver<SubscribeRequest>,
    updates: mpsc::Receiver<StatusUpdate>,
    outbound: mpsc::Sender<Datagram>,
    queue_limit: usize,
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl Manager {
    async fn run(mut self) {
        let mut flush = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    None => return,
                    Some(request) => self.handle_request(request),
                },
                update = self.updates.recv() => match update {
                    None => return,
                    Some(update) => self.handle_update(update),
                },
                _ = flush.tick() => {}
            }

            self.flush();
        }
    }

    fn handle_request(&mut self, request: SubscribeRequest) {
        match request {
            SubscribeRequest::Subscribe {
                peer,
                rig_id,
                fields,
                reply,
            } => {
                self.next_id += 1;
                let id = format!("sub_{}", self.next_id);
                debug!(%peer, rig = %rig_id, subscription = %id, "subscribe");
                self.subscriptions.push(Subscription {
                    id: id.clone(),
                    peer,
                    rig_id,
                    fields,
                    queue: VecDeque::new(),
                    degraded: false,
                    dropped: 0,
                });
                let _ = reply.send(id);
            }
            SubscribeRequest::Unsubscribe {
                peer,
                subscription_id,
                reply,
            } => {
                let before = self.subscriptions.len();
                self.subscriptions
                    .retain(|sub| !(sub.peer == peer && sub.id == subscription_id));
                let result = if self.subscriptions.len() < before {
                    debug!(%peer, subscription = %subscription_id, "unsubscribe");
                    Ok(())
                } else {
                    Err(SubscribeError::UnknownSubscription(subscription_id))
                };
                let _ = reply.send(result);
            }
        }
    }

    fn handle_update(&mut self, update: StatusUpdate) {
        for sub in &mut self.subscriptions {
            if sub.rig_id != update.rig_id {
                continue;
            }

            let intersection: BTreeMap<_, _> = update
                .changed
                .iter()
                .filter(|(field, _)| sub.fields.contains(*field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            if intersection.is_empty() {
                continue;
            }

            match rpc::status_update_payload(&update.rig_id, &sub.id, &intersection) {
                Ok(payload) => sub.queue.push_back(payload),
                Err(error) => {
                    warn!(subscription = %sub.id, %error, "failed to render notification");
                    continue;
                }
            }

            while sub.queue.len() > self.queue_limit {
                sub.queue.pop_front();
                sub.dropped += 1;
                if !sub.degraded {
                    sub.degraded = true;
                    warn!(
                        subscription = %sub.id,
                        peer = %sub.peer,
                        "subscriber cannot keep up; dropping oldest updates"
                    );
                }
            }
        }
    }

    /// Moves queued notifications to the transport, oldest first.
    fn flush(&mut self) {
        for sub in &mut self.subscriptions {
            while let Some(payload) = sub.queue.front() {
                let datagram = Datagram {
                    peer: sub.peer,
                    payload: payload.clone(),
                };
                match self.outbound.try_send(datagram) {
                    Ok(()) => {
                        sub.queue.pop_front();
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => break,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        sub.queue.clear();
                        break;
                    }
                }
            }
        }
    }
}
