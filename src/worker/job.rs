//! Worker side unit of work.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::codec::Codec;
use crate::error::{GearmanError, Result};
use crate::protocol::{catalog, Argument, Command, CommandType};

/// Lifecycle of a job. Leaves `Running` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a job's packets go.
pub(crate) trait JobSink: Send + Sync + 'static {
    /// Send a progress packet (status, data, warning).
    fn update(&self, command: Command) -> Result<()>;

    /// Send the terminal packet and release the job's slot.
    fn finish(&self, handle: &str, command: Command) -> Result<()>;
}

struct JobInner {
    function: String,
    handle: String,
    workload: Bytes,
    unique_id: Option<String>,
    status: watch::Sender<JobStatus>,
    sink: Weak<dyn JobSink>,
}

/// A job assigned to this worker.
///
/// Cheap to clone; clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub(crate) fn new(
        function: String,
        handle: String,
        workload: Bytes,
        unique_id: Option<String>,
        sink: Weak<dyn JobSink>,
    ) -> Self {
        let (status, _) = watch::channel(JobStatus::Running);
        Self {
            inner: Arc::new(JobInner {
                function,
                handle,
                workload,
                unique_id,
                status,
                sink,
            }),
        }
    }

    pub fn function(&self) -> &str {
        &self.inner.function
    }

    /// Server assigned job handle.
    pub fn handle(&self) -> &str {
        &self.inner.handle
    }

    pub fn workload(&self) -> &Bytes {
        &self.inner.workload
    }

    /// Decode the workload with codec `C`.
    pub fn workload_as<C: Codec, T: DeserializeOwned>(&self) -> Result<T> {
        C::decode(&self.inner.workload)
    }

    /// Unique id, only known for jobs grabbed with GRAB_JOB_UNIQ.
    pub fn unique_id(&self) -> Option<&str> {
        self.inner.unique_id.as_deref()
    }

    pub fn status(&self) -> JobStatus {
        *self.inner.status.borrow()
    }

    /// Watch the status. Changes once, when the job completes or fails.
    pub fn status_changes(&self) -> watch::Receiver<JobStatus> {
        self.inner.status.subscribe()
    }

    /// Report progress as `numerator / denominator`.
    pub fn send_status(&self, numerator: u32, denominator: u32) -> Result<()> {
        let command = self
            .command(&catalog::WORK_STATUS)?
            .with(Argument::Numerator, numerator.to_string())?
            .with(Argument::Denominator, denominator.to_string())?;
        self.update(command)
    }

    /// Stream partial result data to the client.
    pub fn send_data(&self, data: impl Into<Bytes>) -> Result<()> {
        let command = self.command(&catalog::WORK_DATA)?.with(Argument::Data, data)?;
        self.update(command)
    }

    pub fn send_warning(&self, warning: impl Into<Bytes>) -> Result<()> {
        let command = self
            .command(&catalog::WORK_WARNING)?
            .with(Argument::Data, warning)?;
        self.update(command)
    }

    /// Finish the job with its result.
    ///
    /// # Errors
    ///
    /// [`GearmanError::InvalidJobState`] if the job already finished.
    pub fn complete(&self, data: impl Into<Bytes>) -> Result<()> {
        let command = self
            .command(&catalog::WORK_COMPLETE)?
            .with(Argument::Data, data)?;
        self.finish(JobStatus::Completed, command)
    }

    /// Finish the job with a result encoded by codec `C`.
    pub fn complete_encoded<C: Codec, T: Serialize>(&self, value: &T) -> Result<()> {
        self.complete(C::encode(value)?)
    }

    /// Fail the job. With an exception payload the server receives
    /// WORK_EXCEPTION, otherwise WORK_FAIL.
    pub fn fail(&self, exception: Option<Bytes>) -> Result<()> {
        let command = match exception {
            Some(exception) => self
                .command(&catalog::WORK_EXCEPTION)?
                .with(Argument::Data, exception)?,
            None => self.command(&catalog::WORK_FAIL)?,
        };
        self.finish(JobStatus::Failed, command)
    }

    fn command(&self, command_type: &'static CommandType) -> Result<Command> {
        Command::request(command_type).with(Argument::JobHandle, self.inner.handle.clone())
    }

    fn ensure_running(&self) -> Result<()> {
        match self.status() {
            JobStatus::Running => Ok(()),
            actual => Err(GearmanError::InvalidJobState {
                expected: JobStatus::Running.as_str(),
                actual: actual.as_str(),
            }),
        }
    }

    fn sink(&self) -> Result<Arc<dyn JobSink>> {
        self.inner.sink.upgrade().ok_or(GearmanError::ConnectionLost)
    }

    fn update(&self, command: Command) -> Result<()> {
        self.ensure_running()?;
        self.sink()?.update(command)
    }

    fn finish(&self, to: JobStatus, command: Command) -> Result<()> {
        let mut actual = JobStatus::Running;
        let moved = self.inner.status.send_if_modified(|status| {
            actual = *status;
            if *status != JobStatus::Running {
                return false;
            }
            *status = to;
            true
        });
        if !moved {
            return Err(GearmanError::InvalidJobState {
                expected: JobStatus::Running.as_str(),
                actual: actual.as_str(),
            });
        }

        tracing::debug!("job {} {}", self.inner.handle, to);
        self.sink()?.finish(&self.inner.handle, command)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("function", &self.inner.function)
            .field("handle", &self.inner.handle)
            .field("unique_id", &self.inner.unique_id)
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
