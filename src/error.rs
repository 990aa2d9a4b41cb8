use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unterminated placeholder in template '{0}'")]
    Unterminated(String),

    #[error("Empty placeholder in template '{0}'")]
    Empty(String),

    #[error("Unknown filter '{filter}' in template '{template}'")]
    Filter { template: String, filter: String },

    #[error("Template '{template}' references unbound placeholder '{name}'")]
    Unbound { template: String, name: String },
}

/// Errors raised while declaring tasks and wiring them together. All of them
/// are fatal and surface before anything is expanded or executed.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task '{0}' is declared twice")]
    DuplicateTask(String),

    #[error("Unknown slot '{slot}' on task '{task}'")]
    UnknownSlot { task: String, slot: String },

    #[error("Connecting '{from}' -> '{to}' would create a cycle")]
    Cycle { from: String, to: String },

    #[error("Input slot '{slot}' of task '{task}' is already bound")]
    SlotAlreadyBound { task: String, slot: String },

    #[error("Input slot '{slot}' of task '{task}' has neither a binding nor an incoming edge")]
    UnwiredSlot { task: String, slot: String },

    #[error("Slot '{slot}' of task '{task}' selects several files and must be a list slot")]
    SelectorNeedsList { task: String, slot: String },

    #[error("Task '{task}' maps over '{slot}', which is not a list slot")]
    MapNeedsList { task: String, slot: String },

    #[error("Slot '{slot}' of task '{task}' gathers across '{axes}' and must be a list slot")]
    GatherNeedsList {
        task: String,
        slot: String,
        axes: String,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("pattern '{pattern}' matched {found} file(s), expected {expected}")]
    Count {
        pattern: String,
        found: usize,
        expected: String,
    },
}

#[derive(Debug, Error)]
pub enum ExpandError {
    /// A file selector could not be bound to a concrete set of files.
    #[error("Unresolved input '{slot}' of task '{task}' ({bindings}): {source}")]
    UnresolvedInput {
        task: String,
        slot: String,
        bindings: String,
        pattern: String,
        #[source]
        source: SelectError,
    },

    #[error("Axis '{0}' is declared twice")]
    DuplicateAxis(String),

    #[error("Task '{task}' joins over unknown axis '{axis}'")]
    UnknownAxis { task: String, axis: String },
}

/// `ExternalToolFailure`: the invocation could not be started, exited with a
/// nonzero status, or left a declared output behind.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Couldn't launch '{program}'.\n{source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}{stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("'{program}' didn't produce output '{slot}' at {path}")]
    MissingOutput {
        program: String,
        slot: String,
        path: Utf8PathBuf,
    },

    #[error("Input '{0}' is missing")]
    MissingInput(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Invocation was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Couldn't run '{program}'.\n{source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' failed: {message}")]
    Rejected { program: String, message: String },

    #[error("Couldn't parse scheduler output '{0}'")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RouteError {
    /// Two task instances would write the same destination path.
    #[error("Destination '{destination}' is written by both '{first}' and '{second}'")]
    DestinationConflict {
        destination: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("'{owner}' completed without routed output '{slot}'")]
    MissingOutput { owner: String, slot: String },

    #[error("Couldn't copy {from} to {to}.\n{source}")]
    Copy {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Error while planning the result store:\n{0}")]
    Route(#[from] RouteError),

    #[error("Failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file {path}.\n{source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't parse config file.\n{0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid walltime '{0}', expected HH:MM:SS")]
    Walltime(String),
}

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("Couldn't read sidecar.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse sidecar.\n{0}")]
    Json(#[from] serde_json::Error),
}
