//! Notification store: the single writer over reconciliation state.
//!
//! Three producers feed this store concurrently - the live channel, the
//! periodic baseline fetch, and gateway mutation results. All of them go
//! through one `mpsc` command queue consumed by one task, so every merge,
//! push, and rollback is applied atomically with respect to the others.
//! That single-writer discipline is structural: nothing outside the actor
//! task can reach [`StoreState`].
//!
//! # Optimistic mutations
//!
//! A mutation command applies its optimistic change, records the
//! compensating inverse, and spawns the gateway call off the writer task
//! (the writer never blocks on I/O). The gateway result comes back as a
//! `Resolve` command: on success the pending record is dropped, on failure
//! the inverse is applied and the error is handed to the caller - the
//! visible list never silently diverges from confirmed server state.

pub mod state;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::gateway::{GatewayError, NotificationApi};
use crate::model::Notification;

use state::{MarkAllRollback, MarkReadRollback, StoreState};

pub use state::StoreEntry;

/// Errors surfaced to mutation callers.
#[derive(Debug)]
pub enum StoreError {
    /// The id is not present in the store.
    NotFound(String),
    /// The gateway call failed; the optimistic change was rolled back.
    Gateway(GatewayError),
    /// The store task is gone.
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "No notification with id {id}"),
            Self::Gateway(e) => write!(f, "Gateway call failed (change rolled back): {e}"),
            Self::Closed => write!(f, "Notification store closed"),
        }
    }
}

impl std::error::Error for StoreError {}

type Reply = oneshot::Sender<Result<(), StoreError>>;

/// Commands processed by the writer task.
enum Command {
    MergeBaseline(Vec<Notification>),
    Push(Notification),
    MarkRead { id: String, reply: Reply },
    MarkAllRead { reply: Reply },
    Delete { id: String, reply: Reply },
    /// Gateway result for an in-flight mutation.
    Resolve {
        op: u64,
        result: Result<(), GatewayError>,
    },
}

/// Compensating inverse of an in-flight optimistic mutation.
enum Inverse {
    MarkRead(MarkReadRollback),
    MarkAll(Vec<MarkAllRollback>),
    Delete { id: String },
}

/// An optimistic mutation awaiting its gateway result.
struct PendingMutation {
    inverse: Inverse,
    reply: Reply,
}

/// Handle to the notification store.
///
/// Cheap to clone; all clones feed the same writer task. Mutation methods
/// resolve only after the gateway confirmed or the rollback was applied.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
    visible_rx: watch::Receiver<Vec<Notification>>,
    cancel: CancellationToken,
}

impl StoreHandle {
    /// Spawn the store for one user, backed by the given gateway.
    pub fn spawn(user_id: String, gateway: Arc<dyn NotificationApi>) -> Self {
        let (tx, rx) = mpsc::channel(constants::STORE_QUEUE_CAPACITY);
        let (visible_tx, visible_rx) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();

        let actor = Actor {
            user_id,
            gateway,
            state: StoreState::new(),
            pending: HashMap::new(),
            next_op: 0,
            resolve_tx: tx.clone(),
            visible_tx,
        };
        tokio::spawn(actor.run(rx, cancel.clone()));

        Self {
            tx,
            visible_rx,
            cancel,
        }
    }

    /// Merge a baseline snapshot into the store.
    pub async fn merge_baseline(&self, baseline: Vec<Notification>) -> Result<(), StoreError> {
        self.tx
            .send(Command::MergeBaseline(baseline))
            .await
            .map_err(|_| StoreError::Closed)
    }

    /// Feed one pushed notification into the store.
    pub async fn push(&self, notification: Notification) -> Result<(), StoreError> {
        self.tx
            .send(Command::Push(notification))
            .await
            .map_err(|_| StoreError::Closed)
    }

    /// Mark a notification read, optimistically.
    ///
    /// Resolves after the gateway call: `Ok` once confirmed, or the error
    /// after the entry was reverted to its pre-mutation state.
    pub async fn mark_read(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|reply| Command::MarkRead {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Mark everything read, optimistically, with a single gateway call.
    pub async fn mark_all_read(&self) -> Result<(), StoreError> {
        self.mutate(|reply| Command::MarkAllRead { reply }).await
    }

    /// Delete a notification, optimistically.
    ///
    /// On gateway failure the entry reappears at its original sorted
    /// position and the error is returned.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|reply| Command::Delete {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Observe the visible list; updated after every state change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.visible_rx.clone()
    }

    /// Current visible list, newest first.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.visible_rx.borrow().clone()
    }

    /// Stop the writer task. In-flight gateway calls resolve into a
    /// closed queue and are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn mutate(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StoreError::Closed)?;
        reply_rx.await.map_err(|_| StoreError::Closed)?
    }
}

/// The single writer.
struct Actor {
    user_id: String,
    gateway: Arc<dyn NotificationApi>,
    state: StoreState,
    pending: HashMap<u64, PendingMutation>,
    next_op: u64,
    /// Sender used by spawned gateway tasks to feed results back in.
    resolve_tx: mpsc::Sender<Command>,
    visible_tx: watch::Sender<Vec<Notification>>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }
        log::debug!("Notification store for {} stopped", self.user_id);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::MergeBaseline(baseline) => {
                log::debug!("Merging baseline of {} notifications", baseline.len());
                self.state.merge_baseline(baseline);
                self.publish();
            }
            Command::Push(notification) => {
                if self.state.apply_push(notification) {
                    self.publish();
                }
            }
            Command::MarkRead { id, reply } => match self.state.begin_mark_read(&id) {
                None => {
                    let _ = reply.send(Err(StoreError::NotFound(id)));
                }
                Some(rollback) => {
                    self.publish();
                    let op = self.register(Inverse::MarkRead(rollback), reply);
                    let gateway = Arc::clone(&self.gateway);
                    let resolve_tx = self.resolve_tx.clone();
                    tokio::spawn(async move {
                        let result = gateway.mark_read(&id).await;
                        let _ = resolve_tx.send(Command::Resolve { op, result }).await;
                    });
                }
            },
            Command::MarkAllRead { reply } => {
                let rollbacks = self.state.begin_mark_all_read();
                if !rollbacks.is_empty() {
                    self.publish();
                }
                let op = self.register(Inverse::MarkAll(rollbacks), reply);
                let gateway = Arc::clone(&self.gateway);
                let resolve_tx = self.resolve_tx.clone();
                let user_id = self.user_id.clone();
                tokio::spawn(async move {
                    let result = gateway.mark_all_read(&user_id).await;
                    let _ = resolve_tx.send(Command::Resolve { op, result }).await;
                });
            }
            Command::Delete { id, reply } => {
                if !self.state.begin_delete(&id) {
                    let _ = reply.send(Err(StoreError::NotFound(id)));
                    return;
                }
                self.publish();
                let op = self.register(Inverse::Delete { id: id.clone() }, reply);
                let gateway = Arc::clone(&self.gateway);
                let resolve_tx = self.resolve_tx.clone();
                tokio::spawn(async move {
                    let result = gateway.delete(&id).await;
                    let _ = resolve_tx.send(Command::Resolve { op, result }).await;
                });
            }
            Command::Resolve { op, result } => self.resolve(op, result),
        }
    }

    fn register(&mut self, inverse: Inverse, reply: Reply) -> u64 {
        let op = self.next_op;
        self.next_op += 1;
        self.pending.insert(op, PendingMutation { inverse, reply });
        op
    }

    fn resolve(&mut self, op: u64, result: Result<(), GatewayError>) {
        let Some(pending) = self.pending.remove(&op) else {
            log::warn!("Resolve for unknown op {op}");
            return;
        };

        match result {
            Ok(()) => {
                // Optimistic state is now confirmed. A confirmed delete
                // frees its tombstone; the id stays dead for the session.
                if let Inverse::Delete { id } = &pending.inverse {
                    self.state.confirm_delete(id);
                }
                let _ = pending.reply.send(Ok(()));
            }
            Err(e) => {
                log::warn!("Gateway mutation failed, rolling back: {}", e);
                match &pending.inverse {
                    Inverse::MarkRead(rollback) => self.state.rollback_mark_read(rollback),
                    Inverse::MarkAll(rollbacks) => self.state.rollback_mark_all_read(rollbacks),
                    Inverse::Delete { id } => self.state.rollback_delete(id),
                }
                self.publish();
                let _ = pending.reply.send(Err(StoreError::Gateway(e)));
            }
        }
    }

    fn publish(&self) {
        self.visible_tx.send_replace(self.state.visible());
    }
}
