//! Client side job handles and their events.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::codec::Codec;
use crate::error::{GearmanError, Result};
use crate::protocol::{catalog, CommandType};

/// Job priority on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// The submit command for this priority.
    pub fn submit_type(self, background: bool) -> &'static CommandType {
        match (self, background) {
            (Priority::Low, false) => &catalog::SUBMIT_JOB_LOW,
            (Priority::Normal, false) => &catalog::SUBMIT_JOB,
            (Priority::High, false) => &catalog::SUBMIT_JOB_HIGH,
            (Priority::Low, true) => &catalog::SUBMIT_JOB_LOW_BG,
            (Priority::Normal, true) => &catalog::SUBMIT_JOB_BG,
            (Priority::High, true) => &catalog::SUBMIT_JOB_HIGH_BG,
        }
    }
}

/// A job to submit.
///
/// # Example
///
/// ```
/// use gearman_async::{Priority, Submission};
///
/// let submission = Submission::new("resize")
///     .workload("image.png")
///     .priority(Priority::High)
///     .unique_id("image.png");
/// assert_eq!(submission.function_name(), "resize");
/// ```
#[derive(Debug, Clone)]
pub struct Submission {
    pub(crate) function: String,
    pub(crate) workload: Option<Bytes>,
    pub(crate) priority: Priority,
    pub(crate) unique_id: Option<String>,
}

impl Submission {
    /// Submit to `function` with no workload and normal priority.
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            workload: None,
            priority: Priority::Normal,
            unique_id: None,
        }
    }

    /// Set the workload.
    pub fn workload(mut self, workload: impl Into<Bytes>) -> Self {
        self.workload = Some(workload.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the unique id.
    ///
    /// A non-empty id makes foreground submissions exclusive: while a task
    /// with the same function and id is live, another submit fails with
    /// [`GearmanError::DuplicateJob`].
    pub fn unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function
    }
}

/// A job confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub(crate) function: String,
    pub(crate) workload: Option<Bytes>,
    pub(crate) handle: String,
    pub(crate) priority: Priority,
    pub(crate) unique_id: String,
}

impl TaskInfo {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn workload(&self) -> Option<&Bytes> {
        self.workload.as_ref()
    }

    /// Server assigned job handle.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Unique id sent with the submission, generated if none was given.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
}

/// The task a status report is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    /// A live task of this client.
    Known(TaskInfo),
    /// A handle this client does not track.
    Unknown(String),
}

impl TaskRef {
    pub fn handle(&self) -> &str {
        match self {
            TaskRef::Known(info) => info.handle(),
            TaskRef::Unknown(handle) => handle,
        }
    }

    /// Check whether the handle belongs to a live task of this client.
    pub fn is_known(&self) -> bool {
        matches!(self, TaskRef::Known(_))
    }

    pub fn info(&self) -> Option<&TaskInfo> {
        match self {
            TaskRef::Known(info) => Some(info),
            TaskRef::Unknown(_) => None,
        }
    }
}

/// Progress of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub task: TaskRef,
    /// Whether the server knows the job.
    pub known: bool,
    /// Whether a worker is running the job.
    pub running: bool,
    pub numerator: u32,
    pub denominator: u32,
}

impl StatusEvent {
    /// `numerator / denominator`, or `None` when the denominator is 0.
    pub fn completion_ratio(&self) -> Option<f64> {
        if self.denominator == 0 {
            return None;
        }
        Some(f64::from(self.numerator) / f64::from(self.denominator))
    }
}

/// Something that happened to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Data(Bytes),
    Warning(Bytes),
    Status(StatusEvent),
    /// The job finished. Terminal.
    Complete(Bytes),
    /// The job failed. Terminal.
    Failure,
    /// The job failed with an exception, or the connection was lost. Terminal.
    Exception(Bytes),
}

impl TaskEvent {
    /// Check whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Complete(_) | TaskEvent::Failure | TaskEvent::Exception(_)
        )
    }

    /// The bytes carried by the event, if any.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            TaskEvent::Data(data)
            | TaskEvent::Warning(data)
            | TaskEvent::Complete(data)
            | TaskEvent::Exception(data) => Some(data),
            TaskEvent::Status(_) | TaskEvent::Failure => None,
        }
    }

    /// Decode the payload with codec `C`.
    pub fn decode<C: Codec, T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload()
            .ok_or_else(|| GearmanError::Protocol("event carries no payload".to_string()))?;
        C::decode(payload)
    }
}

/// A submitted foreground job.
///
/// Events arrive in the order the server sent them. After a terminal event
/// the stream ends.
#[derive(Debug)]
pub struct Task {
    pub(crate) info: TaskInfo,
    pub(crate) events: mpsc::UnboundedReceiver<TaskEvent>,
}

impl Task {
    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn handle(&self) -> &str {
        self.info.handle()
    }

    /// Wait for the next event. Returns `None` once the task was completed,
    /// failed or cancelled and every event was received.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    /// Skip ahead to the terminal event.
    pub async fn finished(&mut self) -> Option<TaskEvent> {
        while let Some(event) = self.events.recv().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;

    #[test]
    fn test_submit_types() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::Normal.submit_type(false).code, 7);
        assert_eq!(Priority::High.submit_type(false).code, 21);
        assert_eq!(Priority::Low.submit_type(false).code, 33);
        assert_eq!(Priority::Normal.submit_type(true).code, 18);
        assert_eq!(Priority::High.submit_type(true).code, 32);
        assert_eq!(Priority::Low.submit_type(true).code, 34);
    }

    #[test]
    fn test_completion_ratio() {
        let mut status = StatusEvent {
            task: TaskRef::Unknown("H:1".to_string()),
            known: true,
            running: true,
            numerator: 1,
            denominator: 4,
        };
        assert_eq!(status.completion_ratio(), Some(0.25));

        status.denominator = 0;
        assert_eq!(status.completion_ratio(), None);
    }

    #[test]
    fn test_terminal_events() {
        assert!(TaskEvent::Complete(Bytes::new()).is_terminal());
        assert!(TaskEvent::Failure.is_terminal());
        assert!(TaskEvent::Exception(Bytes::new()).is_terminal());
        assert!(!TaskEvent::Data(Bytes::new()).is_terminal());
        assert!(!TaskEvent::Warning(Bytes::new()).is_terminal());
    }

    #[test]
    fn test_decode_payload() {
        let event = TaskEvent::Complete(Bytes::from_static(b"[1,2,3]"));
        let decoded: Vec<u32> = event.decode::<JsonCodec, _>().unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);

        assert!(TaskEvent::Failure.decode::<JsonCodec, Vec<u32>>().is_err());
    }

    #[test]
    fn test_task_ref() {
        let unknown = TaskRef::Unknown("H:9".to_string());
        assert_eq!(unknown.handle(), "H:9");
        assert!(!unknown.is_known());
        assert!(unknown.info().is_none());
    }

    #[tokio::test]
    async fn test_finished_skips_progress() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut task = Task {
            info: TaskInfo {
                function: "reverse".to_string(),
                workload: None,
                handle: "H:1".to_string(),
                priority: Priority::Normal,
                unique_id: "u".to_string(),
            },
            events: rx,
        };

        tx.send(TaskEvent::Data(Bytes::from_static(b"part"))).unwrap();
        tx.send(TaskEvent::Complete(Bytes::from_static(b"done"))).unwrap();
        drop(tx);

        assert_eq!(
            task.finished().await,
            Some(TaskEvent::Complete(Bytes::from_static(b"done")))
        );
        assert_eq!(task.next_event().await, None);
    }
}
