//! Job execution.
//!
//! A [`Worker`] registers functions with the server and pulls jobs for them.
//! At most `max_parallel_requests` slots are in use at a time; a slot is
//! taken by every GRAB_JOB sent and released by NO_JOB or when the job it
//! received completes or fails.
//!
//! ```text
//! register ─► CAN_DO ─► GRAB_JOB ─┬─ NO_JOB ─► PRE_SLEEP ... NOOP ─► GRAB_JOB
//!                                 └─ JOB_ASSIGN ─► handler ─► WORK_COMPLETE ─► GRAB_JOB
//! ```

pub(crate) mod job;
mod registry;

pub use job::{Job, JobStatus};
pub use registry::{BoxFuture, FnHandler, Handler, TypedHandler};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::connection::{CloseReason, Connection};
use crate::error::{GearmanError, Result};
use crate::id::IdGenerator;
use crate::participant::{Core, Participant, Role};
use crate::protocol::{catalog, Argument, Command};
use job::JobSink;
use registry::FunctionRegistry;

/// Worker level events, see [`Worker::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A job was assigned and handed to its handler.
    NewJob(Job),
    Ping,
    /// The server sent something that made no sense at this point.
    ProtocolViolation(String),
    Close(CloseReason),
}

pub(crate) struct WorkerState {
    functions: FunctionRegistry,
    max_parallel: usize,
    /// Slots in use: grabs awaiting an answer plus running jobs.
    inflight: usize,
    grabs_in_flight: usize,
    accepting: bool,
    grab_uniques: bool,
    running: HashMap<String, Job>,
    shutdown_requested: bool,
    shut_down: watch::Sender<bool>,
    sink: Weak<dyn JobSink>,
}

impl WorkerState {
    fn new(max_parallel: usize, grab_uniques: bool) -> Self {
        let (shut_down, _) = watch::channel(false);
        Self {
            functions: FunctionRegistry::default(),
            max_parallel: max_parallel.max(1),
            inflight: 0,
            grabs_in_flight: 0,
            accepting: true,
            grab_uniques,
            running: HashMap::new(),
            shutdown_requested: false,
            shut_down,
            sink: Weak::<Participant<WorkerState>>::new(),
        }
    }
}

/// Ask for a job if a slot is free.
fn grab_job(core: &mut Core<WorkerState>) {
    let state = &mut core.state;
    if !state.accepting || state.inflight >= state.max_parallel {
        return;
    }
    state.inflight += 1;
    state.grabs_in_flight += 1;

    let command_type = if state.grab_uniques {
        &catalog::GRAB_JOB_UNIQ
    } else {
        &catalog::GRAB_JOB
    };
    if let Err(e) = core.send(Command::request(command_type)) {
        tracing::warn!("Failed to grab a job: {}", e);
    }
}

/// A grab was answered with NO_JOB or a job.
fn grab_answered(core: &mut Core<WorkerState>) {
    let state = &mut core.state;
    state.grabs_in_flight = state.grabs_in_flight.saturating_sub(1);
    if !state.accepting && !state.shutdown_requested && state.grabs_in_flight == 0 {
        core.connection().pause();
    }
}

/// Send a job's terminal packet and free its slot.
fn finish_job(core: &mut Core<WorkerState>, handle: String, command: Command) -> Result<()> {
    if core.is_closed() || core.connection().is_closed() {
        core.state.running.remove(&handle);
        return Err(GearmanError::ConnectionClosed);
    }

    core.send_then(
        command,
        Box::new(move |core: &mut Core<WorkerState>, result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!("Failed to report job {}: {}", handle, e);
            }
            core.state.running.remove(&handle);
            if core.state.shutdown_requested && core.state.running.is_empty() {
                disconnect_now(core);
            }
        }),
    );

    core.state.inflight = core.state.inflight.saturating_sub(1);
    grab_job(core);
    Ok(())
}

/// Drop every ability and close once queued packets are written.
fn disconnect_now(core: &mut Core<WorkerState>) {
    if !core.connection().is_closed() {
        if let Err(e) = core.send(Command::request(&catalog::RESET_ABILITIES)) {
            tracing::debug!("RESET_ABILITIES not sent: {}", e);
        }
    }
    core.end();
}

fn assign_job(core: &mut Core<WorkerState>, command: &Command) -> Result<()> {
    let handle = command.get_string(Argument::JobHandle)?;
    let function = command.get_string(Argument::FunctionName)?;
    let unique_id = if command.command_type().has_argument(Argument::UniqueId) {
        Some(command.get_string(Argument::UniqueId)?)
    } else {
        None
    };
    let workload = command.get(Argument::Data)?.cloned().unwrap_or_default();

    grab_answered(core);

    let Some(handler) = core.state.functions.get(&function) else {
        let message = format!("No handler registered for {} (job {})", function, handle);
        tracing::error!("{}", message);
        core.emit(WorkerEvent::ProtocolViolation(message));
        let fail = Command::request(&catalog::WORK_FAIL).with(Argument::JobHandle, handle.clone())?;
        return finish_job(core, handle, fail);
    };

    grab_job(core);

    let job = Job::new(function, handle.clone(), workload, unique_id, core.state.sink.clone());
    core.emit(WorkerEvent::NewJob(job.clone()));
    core.state.running.insert(handle, job.clone());

    tokio::spawn(async move {
        if let Err(e) = handler.call(job.clone()).await {
            if job.status() == JobStatus::Running {
                tracing::warn!("Job {} failed: {}", job.handle(), e);
                if let Err(e) = job.fail(Some(Bytes::from(e.to_string()))) {
                    tracing::warn!("Failed to report job {}: {}", job.handle(), e);
                }
            }
        }
    });
    Ok(())
}

impl Role for WorkerState {
    type Event = WorkerEvent;

    fn handle_command(core: &mut Core<Self>, command: Command) -> Option<Command> {
        if command.is(&catalog::NOOP) {
            grab_job(core);
        } else if command.is(&catalog::NO_JOB) {
            core.state.inflight = core.state.inflight.saturating_sub(1);
            grab_answered(core);
            if core.state.accepting {
                if let Err(e) = core.send(Command::request(&catalog::PRE_SLEEP)) {
                    tracing::warn!("Failed to send PRE_SLEEP: {}", e);
                }
            }
        } else if command.is(&catalog::JOB_ASSIGN) || command.is(&catalog::JOB_ASSIGN_UNIQ) {
            if let Err(e) = assign_job(core, &command) {
                tracing::error!("Malformed {}: {}", command, e);
                core.emit(WorkerEvent::ProtocolViolation(e.to_string()));
            }
        } else {
            return Some(command);
        }
        None
    }

    fn connection_closed(core: &mut Core<Self>, _reason: &CloseReason) {
        let state = &mut core.state;
        state.accepting = false;
        state.running.clear();
        state.inflight = 0;
        state.grabs_in_flight = 0;
        state.shut_down.send_replace(true);
    }

    fn ping_event() -> WorkerEvent {
        WorkerEvent::Ping
    }

    fn violation_event(message: String) -> WorkerEvent {
        WorkerEvent::ProtocolViolation(message)
    }

    fn close_event(reason: CloseReason) -> WorkerEvent {
        WorkerEvent::Close(reason)
    }
}

impl JobSink for Participant<WorkerState> {
    fn update(&self, command: Command) -> Result<()> {
        self.lock().send(command)
    }

    fn finish(&self, handle: &str, command: Command) -> Result<()> {
        finish_job(&mut self.lock(), handle.to_string(), command)
    }
}

/// Gearman worker.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Worker {
    participant: Arc<Participant<WorkerState>>,
}

impl Worker {
    pub(crate) fn start(
        connection: Arc<Connection>,
        ids: Arc<dyn IdGenerator>,
        event_capacity: usize,
        max_parallel_requests: usize,
        grab_uniques: bool,
    ) -> Result<Self> {
        let state = WorkerState::new(max_parallel_requests, grab_uniques);
        let participant = Participant::new(connection, state, ids, event_capacity);

        let sink: Arc<dyn JobSink> = participant.clone();
        participant.lock().state.sink = Arc::downgrade(&sink);
        participant.start()?;

        Ok(Self { participant })
    }

    /// Subscribe to worker level events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.participant.subscribe()
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<bool> {
        self.participant.ping().await
    }

    /// Announce `function` and run its jobs with `handler`.
    ///
    /// With a `timeout` the server considers a job failed once it runs
    /// longer (CAN_DO_TIMEOUT, whole seconds rounded up, at least 1).
    pub async fn register<H: Handler>(
        &self,
        function: &str,
        timeout: Option<Duration>,
        handler: H,
    ) -> Result<()> {
        let command = match timeout {
            Some(timeout) => Command::request(&catalog::CAN_DO_TIMEOUT)
                .with(Argument::FunctionName, function.to_string())?
                .with(Argument::Timeout, timeout_secs(timeout).to_string())?,
            None => Command::request(&catalog::CAN_DO)
                .with(Argument::FunctionName, function.to_string())?,
        };

        let function = function.to_string();
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.participant
            .send_confirmed(command, move |core| {
                core.state.functions.insert(function, handler);
                grab_job(core);
            })
            .await
    }

    /// [`Worker::register`] with an async closure.
    pub async fn register_fn<F, Fut>(&self, function: &str, handler: F) -> Result<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(function, None, FnHandler::new(handler)).await
    }

    /// Withdraw `function`.
    ///
    /// # Errors
    ///
    /// [`GearmanError::NotRegistered`] if it was never registered.
    pub async fn unregister(&self, function: &str) -> Result<()> {
        if !self.participant.lock().state.functions.contains(function) {
            return Err(GearmanError::NotRegistered(function.to_string()));
        }

        let command = Command::request(&catalog::CANT_DO)
            .with(Argument::FunctionName, function.to_string())?;
        let function = function.to_string();
        self.participant
            .send_confirmed(command, move |core| {
                core.state.functions.remove(&function);
                grab_job(core);
            })
            .await
    }

    /// Withdraw every function.
    pub async fn unregister_all(&self) -> Result<()> {
        self.participant
            .send_confirmed(Command::request(&catalog::RESET_ABILITIES), |core| {
                core.state.functions.clear();
            })
            .await
    }

    /// Set the id the server shows for this worker.
    pub async fn set_id(&self, id: &str) -> Result<()> {
        let command = Command::request(&catalog::SET_CLIENT_ID)
            .with(Argument::WorkerId, id.to_string())?;
        self.participant.send_confirmed(command, |_| {}).await
    }

    /// Stop taking new jobs. Running jobs continue.
    pub fn pause(&self) {
        let mut core = self.participant.lock();
        core.state.accepting = false;
        if core.state.grabs_in_flight == 0 {
            core.connection().pause();
        }
    }

    /// Take new jobs again.
    ///
    /// # Errors
    ///
    /// [`GearmanError::ShuttingDown`] once a shutdown was requested.
    pub fn resume(&self) -> Result<()> {
        let mut core = self.participant.lock();
        if core.state.shutdown_requested {
            return Err(GearmanError::ShuttingDown);
        }
        core.state.accepting = true;
        core.connection().resume();
        grab_job(&mut core);
        Ok(())
    }

    /// Limit the number of jobs grabbed or running at the same time.
    pub fn set_max_parallel_requests(&self, max: usize) {
        let mut core = self.participant.lock();
        core.state.max_parallel = max.max(1);
        grab_job(&mut core);
    }

    /// Stop taking jobs, wait for running jobs to finish, then disconnect.
    ///
    /// Calling it again waits for the same shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        let mut shut_down = {
            let mut core = self.participant.lock();
            if !core.state.shutdown_requested {
                core.state.shutdown_requested = true;
                core.state.accepting = false;
                if core.state.running.is_empty() {
                    disconnect_now(&mut core);
                }
            }
            core.state.shut_down.subscribe()
        };
        wait_shut_down(&mut shut_down).await
    }

    /// Abandon running jobs and disconnect immediately.
    pub async fn force_shutdown(&self) -> Result<()> {
        let mut shut_down = {
            let mut core = self.participant.lock();
            core.state.shutdown_requested = true;
            core.state.accepting = false;
            core.state.running.clear();
            core.connection().close();
            core.state.shut_down.subscribe()
        };
        wait_shut_down(&mut shut_down).await
    }

    /// Close the connection, after flushing queued packets if `graceful`.
    /// The server is told to forget this worker's functions first.
    pub fn disconnect(&self, graceful: bool) {
        if graceful {
            disconnect_now(&mut self.participant.lock());
            return;
        }
        {
            let mut core = self.participant.lock();
            if let Err(e) = core.send(Command::request(&catalog::RESET_ABILITIES)) {
                tracing::debug!("RESET_ABILITIES not sent: {}", e);
            }
        }
        self.participant.disconnect(false);
    }

    /// Handles of the jobs that have not finished.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut handles: Vec<_> = self
            .participant
            .lock()
            .state
            .running
            .keys()
            .cloned()
            .collect();
        handles.sort();
        handles
    }

    /// Slots in use.
    pub fn inflight_requests(&self) -> usize {
        self.participant.lock().state.inflight
    }

    /// Registered function names, sorted.
    pub fn registered_functions(&self) -> Vec<String> {
        self.participant.lock().state.functions.names()
    }
}

/// Whole seconds for CAN_DO_TIMEOUT, rounded up and never 0.
fn timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

async fn wait_shut_down(shut_down: &mut watch::Receiver<bool>) -> Result<()> {
    shut_down
        .wait_for(|done| *done)
        .await
        .map(|_| ())
        .map_err(|_| GearmanError::ConnectionLost)
}
