//! Job submission.
//!
//! A [`Client`] submits jobs and follows them until they finish. Foreground
//! jobs come back as a [`Task`] that streams the job's data, warnings, status
//! reports and its terminal event.
//!
//! The connection is only read while something is outstanding: a live task
//! or a request waiting for its response.

mod event;
mod task;

pub use event::ClientEvent;
pub use task::{Priority, StatusEvent, Submission, Task, TaskEvent, TaskInfo, TaskRef};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};

use crate::codec::Codec;
use crate::connection::{CloseReason, Connection};
use crate::error::{GearmanError, Result};
use crate::id::IdGenerator;
use crate::participant::{Core, Participant, Role};
use crate::protocol::{catalog, Argument, Command};

/// The only option servers accept: forward WORK_EXCEPTION packets.
pub const EXCEPTIONS_OPTION: &str = "exceptions";

/// Exception payload of tasks swept by a lost connection.
const LOST_CONNECTION: &[u8] = b"Lost connection";

/// `(function, unique id)` of a foreground submission.
type DedupKey = (String, String);

struct LiveTask {
    info: TaskInfo,
    events: mpsc::UnboundedSender<TaskEvent>,
    dedup: Option<DedupKey>,
}

pub(crate) struct ClientState {
    tasks: HashMap<String, LiveTask>,
    reserved: HashSet<DedupKey>,
    outstanding: watch::Sender<usize>,
}

impl ClientState {
    fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            tasks: HashMap::new(),
            reserved: HashSet::new(),
            outstanding,
        }
    }

    fn remove_task(&mut self, handle: &str) -> Option<LiveTask> {
        let task = self.tasks.remove(handle)?;
        if let Some(key) = &task.dedup {
            self.reserved.remove(key);
        }
        Some(task)
    }
}

/// Reads only while tasks or requests are outstanding.
fn refresh(core: &mut Core<ClientState>) {
    let outstanding = core.state.tasks.len() + core.actions();
    if outstanding == 0 {
        core.connection().pause();
    } else {
        core.connection().resume();
    }
    core.state.outstanding.send_replace(outstanding);
}

impl Role for ClientState {
    type Event = ClientEvent;

    fn handle_command(core: &mut Core<Self>, command: Command) -> Option<Command> {
        let is_work_event = [
            &catalog::WORK_COMPLETE,
            &catalog::WORK_STATUS,
            &catalog::WORK_FAIL,
            &catalog::WORK_EXCEPTION,
            &catalog::WORK_DATA,
            &catalog::WORK_WARNING,
        ]
        .into_iter()
        .any(|command_type| command.is(command_type));
        if !is_work_event {
            return Some(command);
        }

        if let Err(e) = handle_work_event(core, &command) {
            tracing::error!("Malformed {}: {}", command, e);
            core.emit(ClientEvent::ProtocolViolation(e.to_string()));
        }
        None
    }

    fn actions_changed(core: &mut Core<Self>) {
        refresh(core);
    }

    fn connection_closed(core: &mut Core<Self>, _reason: &CloseReason) {
        for (_, task) in core.state.tasks.drain() {
            let _ = task
                .events
                .send(TaskEvent::Exception(Bytes::from_static(LOST_CONNECTION)));
        }
        core.state.reserved.clear();
        refresh(core);
    }

    fn ping_event() -> ClientEvent {
        ClientEvent::Ping
    }

    fn violation_event(message: String) -> ClientEvent {
        ClientEvent::ProtocolViolation(message)
    }

    fn close_event(reason: CloseReason) -> ClientEvent {
        ClientEvent::Close(reason)
    }
}

fn handle_work_event(core: &mut Core<ClientState>, command: &Command) -> Result<()> {
    let handle = command.get_string(Argument::JobHandle)?;
    let Some(task) = core.state.tasks.get(&handle) else {
        tracing::warn!("{} for unknown task {}", command.name(), handle);
        core.emit(ClientEvent::TaskUnknown {
            handle,
            command: command.name(),
        });
        return Ok(());
    };

    let data = || -> Result<Bytes> { Ok(command.get(Argument::Data)?.cloned().unwrap_or_default()) };
    let event = if command.is(&catalog::WORK_COMPLETE) {
        TaskEvent::Complete(data()?)
    } else if command.is(&catalog::WORK_FAIL) {
        TaskEvent::Failure
    } else if command.is(&catalog::WORK_EXCEPTION) {
        TaskEvent::Exception(data()?)
    } else if command.is(&catalog::WORK_DATA) {
        TaskEvent::Data(data()?)
    } else if command.is(&catalog::WORK_WARNING) {
        TaskEvent::Warning(data()?)
    } else {
        TaskEvent::Status(StatusEvent {
            task: TaskRef::Known(task.info.clone()),
            known: true,
            running: true,
            numerator: command.get_u32(Argument::Numerator)?,
            denominator: command.get_u32(Argument::Denominator)?,
        })
    };

    if event.is_terminal() {
        // Removed before the event goes out, so the receiver already sees the
        // handle as unknown.
        if let Some(task) = core.state.remove_task(&handle) {
            let _ = task.events.send(event);
        }
        refresh(core);
    } else {
        let _ = task.events.send(event);
    }
    Ok(())
}

fn submit_command(
    submission: &Submission,
    unique_id: &str,
    background: bool,
) -> Result<Command> {
    Command::request(submission.priority.submit_type(background))
        .with(Argument::FunctionName, submission.function.clone())?
        .with(Argument::UniqueId, unique_id.to_string())?
        .with(
            Argument::Data,
            submission.workload.clone().unwrap_or_default(),
        )
}

fn confirmed_handle(response: Result<Command>) -> Result<String> {
    let handle = response?.get_string(Argument::JobHandle)?;
    if handle.is_empty() {
        return Err(GearmanError::Protocol(
            "JOB_CREATED without a job handle".to_string(),
        ));
    }
    Ok(handle)
}

/// Gearman client.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    participant: Arc<Participant<ClientState>>,
}

impl Client {
    /// Wrap a connection and start reading from it.
    ///
    /// Reads stay paused until a request is sent.
    pub(crate) fn start(
        connection: Arc<Connection>,
        ids: Arc<dyn IdGenerator>,
        event_capacity: usize,
    ) -> Result<Self> {
        connection.pause();
        let participant = Participant::new(connection, ClientState::new(), ids, event_capacity);
        participant.start()?;
        Ok(Self { participant })
    }

    /// Subscribe to client level events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.participant.subscribe()
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<bool> {
        self.participant.ping().await
    }

    /// Submit a foreground job and wait for the server to accept it.
    ///
    /// # Errors
    ///
    /// - [`GearmanError::DuplicateJob`] if a live task of this client has the
    ///   same function and unique id. Nothing is sent in that case.
    /// - [`GearmanError::Server`] if the server rejected the submission.
    /// - [`GearmanError::ConnectionLost`] if the connection closed first.
    pub async fn submit(&self, submission: Submission) -> Result<Task> {
        let (unique_id, dedup) = {
            let mut core = self.participant.lock();
            match submission.unique_id.clone().filter(|id| !id.is_empty()) {
                Some(id) => {
                    let key = (submission.function.clone(), id.clone());
                    if !core.state.reserved.insert(key.clone()) {
                        return Err(GearmanError::DuplicateJob {
                            function: key.0,
                            unique_id: key.1,
                        });
                    }
                    (id, Some(key))
                }
                None => (core.generate_id(), None),
            }
        };

        let command = match submit_command(&submission, &unique_id, false) {
            Ok(command) => command,
            Err(e) => {
                if let Some(key) = &dedup {
                    self.participant.lock().state.reserved.remove(key);
                }
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let info = self
            .participant
            .blocking_action(command, &catalog::JOB_CREATED, move |core, response| {
                let handle = match confirmed_handle(response) {
                    Ok(handle) => handle,
                    Err(e) => {
                        if let Some(key) = &dedup {
                            core.state.reserved.remove(key);
                        }
                        return Err(e);
                    }
                };

                let info = TaskInfo {
                    function: submission.function,
                    workload: submission.workload,
                    handle: handle.clone(),
                    priority: submission.priority,
                    unique_id,
                };
                let live = LiveTask {
                    info: info.clone(),
                    events: tx,
                    dedup,
                };
                if let Some(replaced) = core.state.tasks.insert(handle, live) {
                    tracing::warn!("Job handle {} was reused", replaced.info.handle);
                    if let Some(key) = replaced.dedup {
                        core.state.reserved.remove(&key);
                    }
                }
                core.emit(ClientEvent::TaskSubmitted(info.clone()));
                Ok(info)
            })
            .await?;

        Ok(Task { info, events: rx })
    }

    /// Submit a foreground job whose workload is encoded with codec `C`.
    pub async fn submit_encoded<C: Codec, T: Serialize>(
        &self,
        submission: Submission,
        workload: &T,
    ) -> Result<Task> {
        let workload = C::encode(workload)?;
        self.submit(submission.workload(workload)).await
    }

    /// Submit a background job and wait for the server to accept it.
    ///
    /// The job is not tracked: no events are delivered for it and its unique
    /// id does not block other submissions.
    pub async fn submit_background(&self, submission: Submission) -> Result<TaskInfo> {
        let unique_id = match submission.unique_id.clone().filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => self.participant.lock().generate_id(),
        };
        let command = submit_command(&submission, &unique_id, true)?;

        self.participant
            .blocking_action(command, &catalog::JOB_CREATED, move |core, response| {
                let info = TaskInfo {
                    function: submission.function,
                    workload: submission.workload,
                    handle: confirmed_handle(response)?,
                    priority: submission.priority,
                    unique_id,
                };
                core.emit(ClientEvent::TaskSubmitted(info.clone()));
                Ok(info)
            })
            .await
    }

    /// Ask the server to enable an option for this connection.
    ///
    /// Only [`EXCEPTIONS_OPTION`] is supported.
    pub async fn set_option(&self, name: &str) -> Result<()> {
        if name != EXCEPTIONS_OPTION {
            return Err(GearmanError::UnsupportedOption(name.to_string()));
        }

        let command = Command::request(&catalog::OPTION_REQ).with(Argument::OptionName, name.to_string())?;
        let requested = name.to_string();
        self.participant
            .blocking_action(command, &catalog::OPTION_RES, move |core, response| {
                let accepted = response?.get_string(Argument::OptionName)?;
                if accepted != requested {
                    return Err(GearmanError::Protocol(format!(
                        "requested option {} but server accepted {}",
                        requested, accepted
                    )));
                }
                core.emit(ClientEvent::Option(accepted));
                Ok(())
            })
            .await
    }

    /// Query the status of a job by handle.
    ///
    /// The report goes to the task's own event stream as well when the handle
    /// belongs to a live task.
    pub async fn get_status(&self, handle: &str) -> Result<StatusEvent> {
        let command = Command::request(&catalog::GET_STATUS).with(Argument::JobHandle, handle.to_string())?;
        let requested = handle.to_string();

        self.participant
            .blocking_action(command, &catalog::STATUS_RES, move |core, response| {
                let response = response?;
                let reported = response.get_string(Argument::JobHandle)?;
                if reported != requested {
                    return Err(GearmanError::Protocol(format!(
                        "status requested for {} but received for {}",
                        requested, reported
                    )));
                }

                let live = core.state.tasks.get(&reported);
                let status = StatusEvent {
                    task: match live {
                        Some(task) => TaskRef::Known(task.info.clone()),
                        None => TaskRef::Unknown(reported.clone()),
                    },
                    known: response.get_u32(Argument::Status)? != 0,
                    running: response.get_u32(Argument::RunningStatus)? != 0,
                    numerator: response.get_u32(Argument::Numerator)?,
                    denominator: response.get_u32(Argument::Denominator)?,
                };

                if let Some(task) = live {
                    let _ = task.events.send(TaskEvent::Status(status.clone()));
                }
                core.emit(ClientEvent::Status(status.clone()));
                Ok(status)
            })
            .await
    }

    /// Stop tracking a task. The server is not told.
    ///
    /// Returns whether the task was live. Its event stream ends.
    pub fn cancel(&self, handle: &str) -> bool {
        let mut core = self.participant.lock();
        let removed = core.state.remove_task(handle).is_some();
        if removed {
            refresh(&mut core);
        }
        removed
    }

    /// Handles of the live tasks.
    pub fn live_tasks(&self) -> Vec<String> {
        self.participant.lock().state.tasks.keys().cloned().collect()
    }

    /// Wait until no task is live and no request is waiting for a response.
    pub async fn wait(&self) -> Result<()> {
        let mut outstanding = self.participant.lock().state.outstanding.subscribe();
        outstanding
            .wait_for(|count| *count == 0)
            .await
            .map(|_| ())
            .map_err(|_| GearmanError::ConnectionLost)
    }

    /// Close the connection, after flushing queued packets if `graceful`.
    ///
    /// Requests still waiting behind a pending response (submissions, status
    /// queries, pings) are never written. They fail with
    /// [`GearmanError::ConnectionLost`], as does the pending request itself.
    pub fn disconnect(&self, graceful: bool) {
        self.participant.disconnect(graceful);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::UuidGenerator;
    use crate::protocol::{CommandRegistry, Magic, ReadBuffer, WriteBuffer};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Server {
        stream: DuplexStream,
        decoder: ReadBuffer,
    }

    impl Server {
        async fn recv(&mut self) -> Command {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(command) = self.decoder.shift() {
                    return command;
                }
                let n = tokio::time::timeout(Duration::from_secs(1), self.stream.read(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "client closed the stream");
                self.decoder.push(&buf[..n]).unwrap();
            }
        }

        async fn reply(&mut self, command: Command) {
            let mut out = WriteBuffer::new();
            out.push(&command).unwrap();
            self.stream.write_all(&out.shift(None).unwrap()).await.unwrap();
        }
    }

    fn setup() -> (Client, Server) {
        let (client, server) = duplex(64 * 1024);
        let registry = CommandRegistry::shared();
        let connection = Connection::new(client, registry.clone());
        let client = Client::start(connection, Arc::new(UuidGenerator), 16).unwrap();
        (
            client,
            Server {
                stream: server,
                decoder: ReadBuffer::new(registry),
            },
        )
    }

    fn created(handle: &str) -> Command {
        Command::new(&catalog::JOB_CREATED, Magic::Response)
            .with(Argument::JobHandle, handle.to_string())
            .unwrap()
    }

    fn work(command_type: &'static crate::protocol::CommandType, handle: &str) -> Command {
        Command::new(command_type, Magic::Response)
            .with(Argument::JobHandle, handle.to_string())
            .unwrap()
    }

    async fn submit(client: &Client, server: &mut Server, submission: Submission, handle: &str) -> Task {
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.submit(submission).await }
        });
        server.recv().await;
        server.reply(created(handle)).await;
        pending.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_client_starts_paused() {
        let (client, _server) = setup();
        assert!(client.participant.lock().connection().is_paused());
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_sends_generated_unique_id() {
        let (client, mut server) = setup();
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.submit(Submission::new("reverse").workload("hello")).await }
        });

        let request = server.recv().await;
        assert!(request.is(&catalog::SUBMIT_JOB));
        assert_eq!(request.get_string(Argument::FunctionName).unwrap(), "reverse");
        assert_eq!(request.get_string(Argument::Data).unwrap(), "hello");
        let unique_id = request.get_string(Argument::UniqueId).unwrap();
        assert!(!unique_id.is_empty());

        server.reply(created("H:job:1")).await;
        let task = pending.await.unwrap().unwrap();
        assert_eq!(task.info().unique_id(), unique_id);
        assert!(!client.participant.lock().connection().is_paused());
    }

    #[tokio::test]
    async fn test_work_events_reach_task() {
        let (client, mut server) = setup();
        let mut task = submit(&client, &mut server, Submission::new("count"), "H:1").await;

        server
            .reply(
                work(&catalog::WORK_STATUS, "H:1")
                    .with(Argument::Numerator, "1")
                    .unwrap()
                    .with(Argument::Denominator, "2")
                    .unwrap(),
            )
            .await;
        server
            .reply(work(&catalog::WORK_DATA, "H:1").with(Argument::Data, "a").unwrap())
            .await;
        server
            .reply(work(&catalog::WORK_WARNING, "H:1").with(Argument::Data, "w").unwrap())
            .await;
        server.reply(work(&catalog::WORK_FAIL, "H:1")).await;

        match task.next_event().await.unwrap() {
            TaskEvent::Status(status) => {
                assert_eq!(status.completion_ratio(), Some(0.5));
                assert!(status.task.is_known());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(task.next_event().await, Some(TaskEvent::Data(Bytes::from_static(b"a"))));
        assert_eq!(task.next_event().await, Some(TaskEvent::Warning(Bytes::from_static(b"w"))));
        assert_eq!(task.next_event().await, Some(TaskEvent::Failure));
        assert_eq!(task.next_event().await, None);

        client.wait().await.unwrap();
        assert!(client.live_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_handle_is_reported() {
        let (client, mut server) = setup();
        let mut events = client.events();
        let _task = submit(&client, &mut server, Submission::new("f"), "H:1").await;
        assert!(matches!(events.recv().await.unwrap(), ClientEvent::TaskSubmitted(_)));

        server
            .reply(work(&catalog::WORK_COMPLETE, "H:other").with(Argument::Data, "x").unwrap())
            .await;

        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::TaskUnknown {
                handle: "H:other".to_string(),
                command: "WORK_COMPLETE",
            }
        );
        assert_eq!(client.live_tasks(), vec!["H:1".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_releases_unique_id() {
        let (client, mut server) = setup();
        let mut task = submit(&client, &mut server, Submission::new("f").unique_id("u1"), "H:1").await;

        assert!(matches!(
            client.submit(Submission::new("f").unique_id("u1")).await,
            Err(GearmanError::DuplicateJob { .. })
        ));

        assert!(client.cancel("H:1"));
        assert!(!client.cancel("H:1"));
        assert_eq!(task.next_event().await, None);
        assert!(client.participant.lock().connection().is_paused());

        let _again = submit(&client, &mut server, Submission::new("f").unique_id("u1"), "H:2").await;
    }

    #[tokio::test]
    async fn test_same_unique_id_other_function_is_allowed() {
        let (client, mut server) = setup();
        let _a = submit(&client, &mut server, Submission::new("a").unique_id("u"), "H:1").await;
        let _b = submit(&client, &mut server, Submission::new("b").unique_id("u"), "H:2").await;
        assert_eq!(client.live_tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_submit_releases_unique_id() {
        let (client, mut server) = setup();
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.submit(Submission::new("f").unique_id("u")).await }
        });
        server.recv().await;
        server
            .reply(
                Command::new(&catalog::ERROR, Magic::Response)
                    .with(Argument::Code, "ERR")
                    .unwrap()
                    .with(Argument::Message, "queue full")
                    .unwrap(),
            )
            .await;
        assert!(matches!(pending.await.unwrap(), Err(GearmanError::Server { .. })));

        let _task = submit(&client, &mut server, Submission::new("f").unique_id("u"), "H:1").await;
    }

    #[tokio::test]
    async fn test_background_submit_is_untracked() {
        let (client, mut server) = setup();
        let pending = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .submit_background(Submission::new("f").priority(Priority::Low).unique_id("u"))
                    .await
            }
        });

        let request = server.recv().await;
        assert!(request.is(&catalog::SUBMIT_JOB_LOW_BG));
        server.reply(created("H:bg")).await;

        let info = pending.await.unwrap().unwrap();
        assert_eq!(info.handle(), "H:bg");
        assert_eq!(info.priority(), Priority::Low);
        assert!(client.live_tasks().is_empty());
        assert!(client.participant.lock().connection().is_paused());
    }

    #[tokio::test]
    async fn test_set_option() {
        let (client, mut server) = setup();
        assert!(matches!(
            client.set_option("bogus").await,
            Err(GearmanError::UnsupportedOption(_))
        ));

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.set_option(EXCEPTIONS_OPTION).await }
        });
        let request = server.recv().await;
        assert!(request.is(&catalog::OPTION_REQ));
        server
            .reply(
                Command::new(&catalog::OPTION_RES, Magic::Response)
                    .with(Argument::OptionName, EXCEPTIONS_OPTION)
                    .unwrap(),
            )
            .await;
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_for_live_task() {
        let (client, mut server) = setup();
        let mut task = submit(&client, &mut server, Submission::new("f"), "H:1").await;

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.get_status("H:1").await }
        });
        assert!(server.recv().await.is(&catalog::GET_STATUS));
        server
            .reply(
                Command::with_values(
                    &catalog::STATUS_RES,
                    Magic::Response,
                    [
                        (Argument::JobHandle, "H:1"),
                        (Argument::Status, "1"),
                        (Argument::RunningStatus, "0"),
                        (Argument::Numerator, "3"),
                        (Argument::Denominator, "10"),
                    ],
                )
                .unwrap(),
            )
            .await;

        let status = pending.await.unwrap().unwrap();
        assert!(status.task.is_known());
        assert!(status.known);
        assert!(!status.running);
        assert_eq!(status.numerator, 3);
        assert_eq!(status.denominator, 10);
        assert_eq!(task.next_event().await, Some(TaskEvent::Status(status)));
    }

    #[tokio::test]
    async fn test_status_handle_mismatch() {
        let (client, mut server) = setup();
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.get_status("H:1").await }
        });
        server.recv().await;
        server
            .reply(
                Command::with_values(
                    &catalog::STATUS_RES,
                    Magic::Response,
                    [
                        (Argument::JobHandle, "H:2"),
                        (Argument::Status, "0"),
                        (Argument::RunningStatus, "0"),
                    ],
                )
                .unwrap(),
            )
            .await;

        assert!(matches!(pending.await.unwrap(), Err(GearmanError::Protocol(_))));
    }
}
