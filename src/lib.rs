#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod axis;
mod blueprint;
mod command;
pub mod config;
pub mod engine;
mod error;
mod expand;
pub mod neuro;
mod select;
mod sink;
mod task;
mod template;
mod value;

pub use crate::axis::{Axis, Bindings};
pub use crate::blueprint::{Blueprint, OpenRequirement, Pipeline, SlotRef, TaskId};
pub use crate::command::{CommandSpec, Invocation};
pub use crate::config::{SchedulerKind, Settings};
pub use crate::engine::{
    Cancel, ClusterOptions, InFlight, Policy, ResourceRequest, RunOptions, RunReport, Status, run,
};
pub use crate::error::*;
pub use crate::expand::{ExpandOptions, Instance, InstanceGraph, expand};
pub use crate::select::{Cardinality, FileSelector};
pub use crate::sink::{DataSink, SinkPlan};
pub use crate::task::{Action, Binding, InputSlot, SlotKind, TaskDef, TaskFn};
pub use crate::template::{Template, stem};
pub use crate::value::{Slots, Value};

/// Installs a global subscriber printing log lines above the progress bars.
/// Verbosity follows `RUST_LOG`, `info` by default.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
