//! # Rig runtime
//!
//! One task per configured rig. The task owns the serial link, the model,
//! the current status vector, and the command queue; nothing else touches
//! them. See [`holyrig_types::state`] for the state machine this runs.
//!
//! Work is dispatched in priority order: queued client commands first,
//! then the status-poll cursor, round-robin over the model's polls. Polls
//! are only interleaved between commands, never overlapped with them.
//! Status changes are diffed against the current vector and forwarded to
//! the subscription manager as message-passed snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use holyrig_types::{Model, RigState, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError};
use crate::link::{ExchangeError, LinkOpener, RigLink};

/// Queue depth for client commands per rig.
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Runtime knobs, overridable per rig from the service configuration.
#[derive(Clone, Debug)]
pub struct RigSettings {
    /// Idle interval between status polls.
    pub poll_interval: Duration,
    /// Per-exchange reply deadline (*T*).
    pub exchange_timeout: Duration,
    /// Attempts per init frame before giving up (*R*).
    pub init_retries: u32,
    /// Base backoff between init attempts; doubles each retry.
    pub init_backoff: Duration,
    /// Delay between reconnection attempts while not responding (*K*).
    pub reconnect_interval: Duration,
    /// Consecutive exchange timeouts tolerated while online (*F*).
    pub timeout_budget: u32,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            exchange_timeout: Duration::from_millis(1000),
            init_retries: 3,
            init_backoff: Duration::from_millis(250),
            reconnect_interval: Duration::from_secs(5),
            timeout_budget: 3,
        }
    }
}

/// A failure delivered to the submitter of a command.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RigError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("command timed out")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("rig is not responding")]
    NotResponding,
    #[error("rig is disabled")]
    Disabled,
}

impl RigError {
    /// Caller-side errors map to invalid parameters; the rest are
    /// communication errors.
    pub fn is_invalid_params(&self) -> bool {
        matches!(self, RigError::Codec(error) if error.is_invalid_params())
    }
}

/// A request enqueued to a rig task.
#[derive(Debug)]
pub enum RigRequest {
    Execute {
        command: String,
        args: BTreeMap<String, Value>,
        done: oneshot::Sender<Result<(), RigError>>,
    },
    GetStatus {
        reply: oneshot::Sender<BTreeMap<String, Value>>,
    },
    Disable,
}

/// A status diff emitted after a successful poll.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub rig_id: String,
    pub changed: BTreeMap<String, Value>,
}

/// Cheap cloneable handle to one rig task.
#[derive(Clone, Debug)]
pub struct RigHandle {
    id: String,
    model: Arc<Model>,
    requests: mpsc::Sender<RigRequest>,
    state: watch::Receiver<RigState>,
}

impl RigHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn state(&self) -> RigState {
        *self.state.borrow()
    }

    /// Enqueues a command and waits for its completion.
    pub async fn execute(
        &self,
        command: String,
        args: BTreeMap<String, Value>,
    ) -> Result<(), RigError> {
        if self.state() == RigState::Disabled {
            return Err(RigError::Disabled);
        }

        let (done, completion) = oneshot::channel();
        self.requests
            .send(RigRequest::Execute {
                command,
                args,
                done,
            })
            .await
            .map_err(|_| RigError::Disabled)?;

        completion.await.map_err(|_| RigError::Disabled)?
    }

    /// Snapshot of the current status vector.
    pub async fn status(&self) -> Result<BTreeMap<String, Value>, RigError> {
        let (reply, snapshot) = oneshot::channel();
        self.requests
            .send(RigRequest::GetStatus { reply })
            .await
            .map_err(|_| RigError::Disabled)?;
        snapshot.await.map_err(|_| RigError::Disabled)
    }

    /// Administratively disables the rig. Takes effect at the next time the
    /// task reads its queue; in-flight I/O completes first.
    pub async fn disable(&self) {
        let _ = self.requests.send(RigRequest::Disable).await;
    }
}

/// Spawns the task driving one rig and returns its handle.
pub fn spawn(
    id: String,
    model: Arc<Model>,
    opener: Box<dyn LinkOpener>,
    settings: RigSettings,
    updates: mpsc::Sender<StatusUpdate>,
) -> RigHandle {
    let (requests_tx, requests_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(RigState::NotConnected);

    let task = RigTask {
        id: id.clone(),
        model: model.clone(),
        opener,
        settings,
        requests: requests_rx,
        state: state_tx,
        updates,
        status: BTreeMap::new(),
        poll_cursor: 0,
        timeouts: 0,
    };
    tokio::spawn(task.run());

    RigHandle {
        id,
        model,
        requests: requests_tx,
        state: state_rx,
    }
}

enum Outcome {
    NotResponding,
    Disabled,
    Shutdown,
}

struct RigTask {
    id: String,
    model: Arc<Model>,
    opener: Box<dyn LinkOpener>,
    settings: RigSettings,
    requests: mpsc::Receiver<RigRequest>,
    state: watch::Sender<RigState>,
    updates: mpsc::Sender<StatusUpdate>,
    status: BTreeMap<String, Value>,
    poll_cursor: usize,
    timeouts: u32,
}

impl RigTask {
    async fn run(mut self) {
        loop {
            let link = match self.connect().await {
                Ok(link) => link,
                Err(outcome) => match outcome {
                    Outcome::Disabled => break,
                    Outcome::Shutdown => return,
                    Outcome::NotResponding => match self.not_responding().await {
                        Outcome::Disabled => break,
                        Outcome::Shutdown => return,
                        Outcome::NotResponding => continue,
                    },
                },
            };

            match self.online(link).await {
                Outcome::Disabled => break,
                Outcome::Shutdown => return,
                Outcome::NotResponding => match self.not_responding().await {
                    Outcome::Disabled => break,
                    Outcome::Shutdown => return,
                    Outcome::NotResponding => continue,
                },
            }
        }

        self.set_state(RigState::Disabled);
        info!(rig = %self.id, "disabled");
        // Keep rejecting enqueues until every handle is gone.
        while let Some(request) = self.requests.recv().await {
            reject(request, &self.status, RigError::Disabled);
        }
    }

    /// NotConnected → Initializing → Online, or NotResponding on failure.
    async fn connect(&mut self) -> Result<RigLink, Outcome> {
        self.set_state(RigState::NotConnected);
        self.status.clear();
        self.timeouts = 0;

        let link = match self.opener.open().await {
            Ok(link) => RigLink::new(link),
            Err(error) => {
                warn!(rig = %self.id, %error, "failed to open link");
                return Err(Outcome::NotResponding);
            }
        };

        self.set_state(RigState::Initializing);
        let mut link = link;
        match self.run_init(&mut link).await {
            Ok(()) => {
                self.set_state(RigState::Online);
                info!(rig = %self.id, "online");
                Ok(link)
            }
            Err(()) => Err(Outcome::NotResponding),
        }
    }

    /// Sends every init frame in order, retrying each with backoff.
    async fn run_init(&mut self, link: &mut RigLink) -> Result<(), ()> {
        for (index, frame) in self.model.init_frames().iter().enumerate() {
            let bytes = codec::encode_frame(frame);
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                let result = link
                    .exchange(&bytes, frame.reply(), self.settings.exchange_timeout)
                    .await;

                let failure = match result {
                    Ok(None) => break,
                    Ok(Some(reply)) => match codec::validate_reply(frame, &reply) {
                        Ok(()) => break,
                        Err(error) => error.to_string(),
                    },
                    Err(error) => error.to_string(),
                };

                warn!(rig = %self.id, init = index, attempt, failure, "init frame failed");
                if attempt >= self.settings.init_retries {
                    return Err(());
                }
                sleep(self.settings.init_backoff * 2u32.pow(attempt - 1)).await;
            }
        }

        Ok(())
    }

    /// The Online work loop: commands first, polls in the gaps.
    async fn online(&mut self, mut link: RigLink) -> Outcome {
        let mut poll = interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                request = self.requests.recv() => match request {
                    None => return Outcome::Shutdown,
                    Some(RigRequest::Disable) => return Outcome::Disabled,
                    Some(RigRequest::GetStatus { reply }) => {
                        let _ = reply.send(self.status.clone());
                    }
                    Some(RigRequest::Execute { command, args, done }) => {
                        // A dropped completion channel is a cancelled
                        // command; skip it before any I/O starts.
                        if done.is_closed() {
                            debug!(rig = %self.id, command, "command cancelled before I/O");
                            continue;
                        }

                        let result = self.execute(&mut link, &command, &args).await;
                        let escalate = self.escalation(&result);
                        let _ = done.send(result);
                        if escalate {
                            return Outcome::NotResponding;
                        }
                    }
                },

                _ = poll.tick() => {
                    if self.poll_once(&mut link).await.is_err() {
                        return Outcome::NotResponding;
                    }
                }
            }
        }
    }

    async fn execute(
        &mut self,
        link: &mut RigLink,
        command: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<(), RigError> {
        let template = self
            .model
            .command(command)
            .ok_or_else(|| CodecError::UnsupportedCommand(command.to_owned()))?;
        let bytes = codec::encode_command(&self.model, command, args)?;

        match link
            .exchange(&bytes, template.reply(), self.settings.exchange_timeout)
            .await
        {
            Ok(None) => {
                self.timeouts = 0;
                Ok(())
            }
            Ok(Some(reply)) => {
                self.timeouts = 0;
                codec::validate_reply(template, &reply)?;
                Ok(())
            }
            Err(ExchangeError::Timeout) => {
                self.timeouts += 1;
                Err(RigError::Timeout)
            }
            Err(error) => Err(RigError::Io(error.to_string())),
        }
    }

    /// Whether the outcome of an exchange forces NotResponding.
    fn escalation(&self, result: &Result<(), RigError>) -> bool {
        match result {
            Err(RigError::Io(_)) => true,
            Err(RigError::Timeout) => self.timeouts >= self.settings.timeout_budget,
            _ => false,
        }
    }

    /// Issues the next status poll; `Err` means go to NotResponding.
    async fn poll_once(&mut self, link: &mut RigLink) -> Result<(), ()> {
        let polls = self.model.status_polls();
        if polls.is_empty() {
            return Ok(());
        }

        let (name, poll) = polls[self.poll_cursor % polls.len()].clone();
        self.poll_cursor = (self.poll_cursor + 1) % polls.len();

        let bytes = codec::encode_frame(poll.template());
        match link
            .exchange(&bytes, poll.template().reply(), self.settings.exchange_timeout)
            .await
        {
            Ok(None) => Ok(()),
            Ok(Some(reply)) => {
                self.timeouts = 0;
                match codec::decode_status(&self.model, &poll, &reply) {
                    Ok(values) => self.apply_status(values).await,
                    Err(error) => {
                        warn!(rig = %self.id, poll = %name, %error, "poll reply rejected");
                    }
                }
                Ok(())
            }
            Err(ExchangeError::Timeout) => {
                self.timeouts += 1;
                warn!(rig = %self.id, poll = %name, "poll timed out");
                if self.timeouts >= self.settings.timeout_budget {
                    Err(())
                } else {
                    Ok(())
                }
            }
            Err(error) => {
                warn!(rig = %self.id, poll = %name, %error, "poll I/O error");
                Err(())
            }
        }
    }

    /// Merges freshly decoded fields and publishes the diff.
    async fn apply_status(&mut self, values: Vec<(String, Value)>) {
        let mut changed = BTreeMap::new();
        for (name, value) in values {
            if self.status.get(&name) != Some(&value) {
                self.status.insert(name.clone(), value.clone());
                changed.insert(name, value);
            }
        }

        if !changed.is_empty() {
            let update = StatusUpdate {
                rig_id: self.id.clone(),
                changed,
            };
            let _ = self.updates.send(update).await;
        }
    }

    /// NotResponding: fail fast on commands, retry the link every *K*.
    async fn not_responding(&mut self) -> Outcome {
        self.set_state(RigState::NotResponding);
        self.status.clear();

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    None => return Outcome::Shutdown,
                    Some(RigRequest::Disable) => return Outcome::Disabled,
                    Some(request) => reject(request, &self.status, RigError::NotResponding),
                },
                _ = sleep(self.settings.reconnect_interval) => {
                    return Outcome::NotResponding;
                }
            }
        }
    }

    fn set_state(&self, state: RigState) {
        debug!(rig = %self.id, ?state, "state");
        let _ = self.state.send(state);
    }
}

fn reject(request: RigRequest, status: &BTreeMap<String, Value>, error: RigError) {
    match request {
        RigRequest::Execute { done, .. } => {
            let _ = done.send(Err(error));
        }
        RigRequest::GetStatus { reply } => {
            let _ = reply.send(status.clone());
        }
        RigRequest::Disable => {}
    }
}
