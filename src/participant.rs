//! Behavior shared by clients and workers.
//!
//! A [`Participant`] sits between a [`Connection`] and a role (client or
//! worker state). It owns:
//!
//! - the blocking-action pattern: send a request, wait for one specific
//!   response packet, resolve a future with the handler's result
//! - the send lock: while a blocking action waits for its response, every
//!   other send from the same participant is queued and flushed in FIFO order
//!   once the response (or an ERROR packet) arrives
//! - the event stream (`broadcast`) of the role
//!
//! All state sits behind one mutex that is never held across an await.
//! Responses are handled synchronously inside the connection's read loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};

use crate::connection::{CloseReason, CommandListener, Connection};
use crate::error::{GearmanError, Result};
use crate::id::IdGenerator;
use crate::lock;
use crate::protocol::{catalog, Argument, Command, CommandType};

/// Completion of a blocking action, run with the core locked.
type Completion<S> = Box<dyn FnOnce(&mut Core<S>, Result<Command>) + Send>;

/// Continuation of a plain send, run with the core locked once the command
/// was handed to the connection (or failed to be).
pub(crate) type Then<S> = Box<dyn FnOnce(&mut Core<S>, Result<()>) + Send>;

/// Role specific state and packet handling.
pub(crate) trait Role: Send + Sized + 'static {
    /// Event published on the participant's stream.
    type Event: Clone + Send + fmt::Debug + 'static;

    /// Handle a packet that does not answer the pending blocking action.
    ///
    /// Returns the command back if the role does not handle it.
    fn handle_command(core: &mut Core<Self>, command: Command) -> Option<Command>;

    /// The number of outstanding blocking actions changed.
    fn actions_changed(_core: &mut Core<Self>) {}

    /// The connection closed. Pending and queued actions are already
    /// rejected.
    fn connection_closed(core: &mut Core<Self>, reason: &CloseReason);

    fn ping_event() -> Self::Event;

    fn violation_event(message: String) -> Self::Event;

    fn close_event(reason: CloseReason) -> Self::Event;
}

struct PendingAction<S: Role> {
    expected: &'static CommandType,
    complete: Completion<S>,
}

struct QueuedSend<S: Role> {
    command: Command,
    action: Option<PendingAction<S>>,
    then: Option<Then<S>>,
}

/// Participant state guarded by the participant mutex.
pub(crate) struct Core<S: Role> {
    pub(crate) state: S,
    connection: Arc<Connection>,
    ids: Arc<dyn IdGenerator>,
    events: broadcast::Sender<S::Event>,
    locked: bool,
    pending: Option<PendingAction<S>>,
    queue: VecDeque<QueuedSend<S>>,
    actions: usize,
    closed: bool,
}

impl<S: Role> Core<S> {
    /// The underlying connection.
    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Generate a fresh id.
    pub(crate) fn generate_id(&self) -> String {
        self.ids.generate()
    }

    /// Number of blocking actions sent or queued and not yet settled.
    pub(crate) fn actions(&self) -> usize {
        self.actions
    }

    /// Whether the connection closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Publish an event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: S::Event) {
        let _ = self.events.send(event);
    }

    /// Send a command, queueing it while the send lock is held.
    pub(crate) fn send(&mut self, command: Command) -> Result<()> {
        if self.locked {
            self.queue.push_back(QueuedSend {
                command,
                action: None,
                then: None,
            });
            return Ok(());
        }
        self.connection.send(&command)
    }

    /// Send a command and run `then` once it was written to the connection.
    pub(crate) fn send_then(&mut self, command: Command, then: Then<S>) {
        self.dispatch_send(command, None, Some(then));
    }

    fn dispatch_send(
        &mut self,
        command: Command,
        action: Option<PendingAction<S>>,
        then: Option<Then<S>>,
    ) {
        if self.locked {
            self.queue.push_back(QueuedSend {
                command,
                action,
                then,
            });
            return;
        }

        let result = self.connection.send(&command);
        match (action, result) {
            (Some(action), Ok(())) => {
                self.locked = true;
                self.pending = Some(action);
            }
            (Some(action), Err(e)) => self.finish_action(action, Err(e)),
            (None, result) => match then {
                Some(then) => then(self, result),
                None => {
                    if let Err(e) = result {
                        tracing::warn!("Failed to send {}: {}", command, e);
                    }
                }
            },
        }
    }

    fn finish_action(&mut self, action: PendingAction<S>, result: Result<Command>) {
        self.actions = self.actions.saturating_sub(1);
        (action.complete)(self, result);
        S::actions_changed(self);
    }

    fn unlock(&mut self) {
        self.locked = false;
        while !self.locked {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            self.dispatch_send(queued.command, queued.action, queued.then);
        }
    }

    fn dispatch(&mut self, command: Command) {
        if command.is(&catalog::ERROR) {
            let error = GearmanError::Server {
                code: command.get_string(Argument::Code).unwrap_or_default(),
                message: command.get_string(Argument::Message).unwrap_or_default(),
            };
            match self.pending.take() {
                Some(action) => {
                    self.finish_action(action, Err(error));
                    self.unlock();
                }
                None => {
                    tracing::error!("{} with no request pending", error);
                    self.emit(S::violation_event(error.to_string()));
                }
            }
            return;
        }

        let answers_pending = self
            .pending
            .as_ref()
            .is_some_and(|action| command.is(action.expected));
        if answers_pending {
            if let Some(action) = self.pending.take() {
                self.finish_action(action, Ok(command));
                self.unlock();
            }
            return;
        }

        if let Some(command) = S::handle_command(self, command) {
            let message = format!("Unexpected command packet: {}", command);
            tracing::error!("{}", message);
            self.emit(S::violation_event(message));
        }
    }

    /// Half-close the connection once everything queued behind the send lock
    /// was written.
    ///
    /// Queued packets are written past the lock. Queued blocking actions are
    /// rejected unwritten with [`GearmanError::ConnectionLost`]. A pending
    /// action settles when the connection closes.
    pub(crate) fn end(&mut self) {
        while let Some(queued) = self.queue.pop_front() {
            if let Some(action) = queued.action {
                tracing::debug!("Dropping {} queued behind the send lock", queued.command);
                self.finish_action(action, Err(GearmanError::ConnectionLost));
                continue;
            }
            let result = self.connection.send(&queued.command);
            match queued.then {
                Some(then) => then(self, result),
                None => {
                    if let Err(e) = result {
                        tracing::warn!("Failed to send {}: {}", queued.command, e);
                    }
                }
            }
        }
        self.connection.end();
    }

    fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.locked = false;

        if let Some(action) = self.pending.take() {
            self.finish_action(action, Err(GearmanError::ConnectionLost));
        }
        while let Some(queued) = self.queue.pop_front() {
            if let Some(action) = queued.action {
                self.finish_action(action, Err(GearmanError::ConnectionLost));
            }
            if let Some(then) = queued.then {
                then(self, Err(GearmanError::ConnectionLost));
            }
        }

        S::connection_closed(self, &reason);
        self.emit(S::close_event(reason));
    }
}

/// A connection together with its role state.
pub(crate) struct Participant<S: Role> {
    connection: Arc<Connection>,
    core: Mutex<Core<S>>,
}

impl<S: Role> Participant<S> {
    pub(crate) fn new(
        connection: Arc<Connection>,
        state: S,
        ids: Arc<dyn IdGenerator>,
        event_capacity: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            connection: connection.clone(),
            core: Mutex::new(Core {
                state,
                connection,
                ids,
                events,
                locked: false,
                pending: None,
                queue: VecDeque::new(),
                actions: 0,
                closed: false,
            }),
        })
    }

    /// Start delivering packets to this participant.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        self.connection.start(self.clone())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Core<S>> {
        lock(&self.core)
    }

    /// Subscribe to the event stream.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<S::Event> {
        self.lock().events.subscribe()
    }

    /// Send `command` and wait for a packet of type `expected`.
    ///
    /// `handler` runs inside the read loop with the core locked and receives
    /// the response, or the error that settled the action instead: an ERROR
    /// packet, a failed send or [`GearmanError::ConnectionLost`]. The send
    /// lock is held from the moment `command` is written until the action
    /// settles.
    pub(crate) async fn blocking_action<T, F>(
        &self,
        command: Command,
        expected: &'static CommandType,
        handler: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Core<S>, Result<Command>) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut core = self.lock();
            core.actions += 1;
            S::actions_changed(&mut core);

            let action = PendingAction {
                expected,
                complete: Box::new(move |core: &mut Core<S>, response: Result<Command>| {
                    let _ = tx.send(handler(core, response));
                }),
            };
            core.dispatch_send(command, Some(action), None);
        }

        rx.await.unwrap_or(Err(GearmanError::ConnectionLost))
    }

    /// Send `command` and wait until it was handed to the connection, then
    /// run `then` with the core locked.
    pub(crate) async fn send_confirmed<F>(&self, command: Command, then: F) -> Result<()>
    where
        F: FnOnce(&mut Core<S>) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.lock().send_then(
            command,
            Box::new(move |core: &mut Core<S>, result: Result<()>| {
                if result.is_ok() {
                    then(core);
                }
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or(Err(GearmanError::ConnectionLost))
    }

    /// Round trip an ECHO_REQ carrying a fresh nonce.
    pub(crate) async fn ping(&self) -> Result<bool> {
        let nonce = Bytes::from(self.lock().generate_id());
        let command = Command::request(&catalog::ECHO_REQ).with(Argument::Data, nonce.clone())?;

        self.blocking_action(command, &catalog::ECHO_RES, move |core, response| {
            let response = response?;
            if response.get(Argument::Data)? != Some(&nonce) {
                return Err(GearmanError::Protocol("echo mismatch".to_string()));
            }
            core.emit(S::ping_event());
            Ok(true)
        })
        .await
    }

    /// Close the connection, after flushing queued packets if `graceful`.
    /// See [`Core::end`] for what happens to sends waiting on the send lock.
    pub(crate) fn disconnect(&self, graceful: bool) {
        if graceful {
            self.lock().end();
        } else {
            self.connection.close();
        }
    }
}

impl<S: Role> CommandListener for Participant<S> {
    fn on_command(&self, command: Command) {
        self.lock().dispatch(command);
    }

    fn on_close(&self, reason: CloseReason) {
        self.lock().close(reason);
    }
}
