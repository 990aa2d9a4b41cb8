//! Execution of an expanded instance graph.

mod cluster;
mod report;
mod runner;

use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use cluster::{JobSpec, JobState, Pbs, ResourceRequest, Scheduler, Slurm, parse_walltime};
pub use report::{Counts, Entry, RunReport};
pub use runner::run;

use crate::sink::DataSink;

/// Lifecycle of one task instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Pending,
    /// Every producer completed, waiting for a free worker.
    Ready,
    Running,
    /// `cached` is set when the declared outputs already existed.
    Completed { cached: bool },
    Failed(String),
    /// A transitive producer failed, `upstream` names the instance.
    Skipped { upstream: String },
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed { .. } | Status::Failed(_) | Status::Skipped { .. } | Status::Cancelled
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Status::Completed { .. })
    }

    pub(crate) fn styled(&self) -> String {
        use console::style;

        match self {
            Status::Completed { cached: false } => style(self).green().to_string(),
            Status::Completed { cached: true } => style(self).cyan().to_string(),
            Status::Failed(_) => style(self).red().bold().to_string(),
            Status::Skipped { .. } => style(self).yellow().to_string(),
            _ => style(self).dim().to_string(),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => f.write_str("pending"),
            Status::Ready => f.write_str("ready"),
            Status::Running => f.write_str("running"),
            Status::Completed { cached: false } => f.write_str("completed"),
            Status::Completed { cached: true } => f.write_str("completed (cached)"),
            Status::Failed(reason) => write!(f, "failed: {reason}"),
            Status::Skipped { upstream } => write!(f, "skipped (upstream failure in {upstream})"),
            Status::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Run-wide stop signal. Clones share the same flag, so one can be handed
/// to a signal handler.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happens to invocations already running when a run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InFlight {
    /// Kill local processes, cancel submitted jobs.
    Terminate,
    /// Let them finish; their results are still recorded.
    #[default]
    Finish,
}

#[derive(Clone)]
pub struct ClusterOptions {
    pub scheduler: Arc<dyn Scheduler>,
    /// Used for commands without their own resource request.
    pub resources: ResourceRequest,
    pub poll_interval: Duration,
    /// Upper bound on jobs submitted and not yet finished.
    pub max_in_flight: usize,
}

impl ClusterOptions {
    pub fn new(scheduler: impl Scheduler + 'static) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            resources: ResourceRequest::default(),
            poll_interval: Duration::from_secs(30),
            max_in_flight: 64,
        }
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }
}

impl fmt::Debug for ClusterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOptions")
            .field("scheduler", &self.scheduler.name())
            .field("resources", &self.resources)
            .field("poll_interval", &self.poll_interval)
            .field("max_in_flight", &self.max_in_flight)
            .finish()
    }
}

/// How task instances are dispatched.
#[derive(Debug, Clone)]
pub enum Policy {
    /// At most `jobs` instances execute at once on this machine.
    Local { jobs: usize },
    /// Every command invocation becomes a batch job.
    Cluster(ClusterOptions),
}

impl Policy {
    pub(crate) fn limit(&self) -> usize {
        match self {
            Policy::Local { jobs } => (*jobs).max(1),
            Policy::Cluster(options) => options.max_in_flight.max(1),
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Local {
            jobs: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub policy: Policy,
    pub cancel: Cancel,
    pub in_flight: InFlight,
    /// Keep working directories once nothing downstream needs them.
    pub keep_intermediates: bool,
    pub sink: Option<DataSink>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

impl RunOptions {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            cancel: Cancel::new(),
            in_flight: InFlight::default(),
            keep_intermediates: true,
            sink: None,
        }
    }

    pub fn local(jobs: usize) -> Self {
        Self::new(Policy::Local { jobs })
    }

    pub fn cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn in_flight(mut self, in_flight: InFlight) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }

    pub fn sink(mut self, sink: DataSink) -> Self {
        self.sink = Some(sink);
        self
    }
}
