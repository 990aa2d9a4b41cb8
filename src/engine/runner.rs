use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, EdgeRef};
use rayon::prelude::*;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::cluster::{JobSpec, JobState, submit_and_wait};
use super::report::{Entry, RunReport};
use super::{Cancel, ClusterOptions, InFlight, Policy, RunOptions, Status};
use crate::command::{CommandSpec, Invocation};
use crate::error::{RunError, ToolError};
use crate::expand::{Instance, InstanceGraph};
use crate::sink::SinkPlan;
use crate::task::{Action, SlotKind, TaskDef};
use crate::value::{Slots, Value};

/// How often the scheduler loop looks at the cancellation flag while
/// waiting for results.
const TICK: Duration = Duration::from_millis(100);

static RUN_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template("{spinner:.blue} {msg}").expect("Error setting progress bar template")
});

enum Outcome {
    Done { outputs: Slots, cached: bool },
    Failed(String),
    Cancelled,
}

/// Executes every instance of `graph`.
///
/// The scheduling loop is a parallel topological sort: an instance becomes
/// ready once every producer feeding it completed, and ready instances are
/// handed to the worker pool lowest index first while fewer than the
/// policy's limit are running. Results come back over a channel.
///
/// A failed instance takes its whole dependency subtree down with it, every
/// descendant ends up [`Status::Skipped`] naming the failure. Independent
/// branches carry on. Command instances whose declared outputs already exist
/// complete without invoking anything.
///
/// Returns an error only for problems that stop the run before it starts,
/// such as conflicting result store destinations. Everything else is
/// recorded per instance in the returned [`RunReport`].
pub fn run(graph: &InstanceGraph, options: &RunOptions) -> Result<RunReport, RunError> {
    let plan = match &options.sink {
        Some(sink) => sink.plan(graph)?,
        None => SinkPlan::default(),
    };

    for open in graph.open_requirements() {
        tracing::warn!(step = %open.step, "Open requirement, not executed: {}", open.description);
    }

    let limit = options.policy.limit();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(limit)
        .thread_name(|i| format!("cortexflow-worker-{i}"))
        .build()?;

    let count = graph.len();
    let mut status = vec![Status::Pending; count];
    let mut outputs: HashMap<NodeIndex, Slots> = HashMap::new();
    let mut times: HashMap<NodeIndex, Duration> = HashMap::new();
    let mut waiting: Vec<usize> = graph
        .graph
        .node_indices()
        .map(|i| graph.graph.edges_directed(i, Direction::Incoming).count())
        .collect();

    let root_span = tracing::span!(Level::INFO, "running_tasks", pipeline = %graph.name);
    root_span.pb_set_length(count as u64);
    root_span.pb_set_style(&RUN_STYLE);
    root_span.pb_set_message(&format!("Running {}...", graph.name));
    let _enter = root_span.enter();
    let mut reported = 0;

    // Instances with unresolved inputs never start.
    for index in graph.graph.node_indices() {
        if let Some(reason) = &graph.graph[index].unresolved {
            fail(graph, &mut status, index, reason.clone());
        }
    }

    let mut ready: BTreeSet<NodeIndex> = graph
        .graph
        .node_indices()
        .filter(|i| waiting[i.index()] == 0 && status[i.index()] == Status::Pending)
        .collect();
    for index in &ready {
        status[index.index()] = Status::Ready;
    }

    let invocations = AtomicUsize::new(0);
    let worker = Worker {
        policy: &options.policy,
        cancel: &options.cancel,
        in_flight: options.in_flight,
        invocations: &invocations,
    };
    let worker = &worker;

    let (result_sender, result_receiver) = channel::<(NodeIndex, Outcome, Duration)>();

    pool.in_place_scope(|s| {
        let mut running = 0;
        let mut cancelled = false;

        loop {
            if options.cancel.is_cancelled() && !cancelled {
                cancelled = true;
                tracing::warn!("Run cancelled, {running} invocation(s) still in flight");
            }

            if cancelled {
                ready.clear();
                for state in status.iter_mut() {
                    if matches!(state, Status::Pending | Status::Ready) {
                        *state = Status::Cancelled;
                    }
                }
            }

            while running < limit
                && let Some(index) = ready.pop_first()
            {
                status[index.index()] = Status::Running;
                running += 1;

                let inputs = gather(graph, index, &outputs);
                let instance = &graph.graph[index];
                let sender = result_sender.clone();

                s.spawn(move |_| {
                    let start = Instant::now();
                    let outcome = worker.execute(instance, inputs);
                    // The receiver outlives every worker.
                    let _ = sender.send((index, outcome, start.elapsed()));
                });
            }

            advance(&root_span, &status, &mut reported);

            if running == 0 {
                break;
            }

            let (index, outcome, duration) = match result_receiver.recv_timeout(TICK) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            running -= 1;
            times.insert(index, duration);

            match outcome {
                Outcome::Done {
                    outputs: produced,
                    cached,
                } => match plan.write(index, &produced) {
                    Ok(written) => {
                        tracing::debug!(task = %graph.graph[index], cached, routed = written.len(), "completed");
                        status[index.index()] = Status::Completed { cached };
                        outputs.insert(index, produced);

                        for edge in graph.graph.edges_directed(index, Direction::Outgoing) {
                            let target = edge.target();
                            waiting[target.index()] -= 1;
                            if waiting[target.index()] == 0 && status[target.index()] == Status::Pending {
                                status[target.index()] = Status::Ready;
                                ready.insert(target);
                            }
                        }
                    }
                    Err(err) => fail(graph, &mut status, index, err.to_string()),
                },
                Outcome::Failed(reason) => fail(graph, &mut status, index, reason),
                Outcome::Cancelled => status[index.index()] = Status::Cancelled,
            }
        }
    });

    for state in status.iter_mut() {
        if !state.is_terminal() {
            *state = Status::Cancelled;
        }
    }
    advance(&root_span, &status, &mut reported);

    if !options.keep_intermediates {
        cleanup(graph, &status, &plan);
    }

    let entries = graph
        .graph
        .node_indices()
        .map(|index| {
            let instance = &graph.graph[index];
            Entry {
                label: instance.label(),
                task: instance.task.name.clone(),
                bindings: instance.bindings.clone(),
                status: status[index.index()].clone(),
                duration: times.get(&index).copied(),
            }
        })
        .collect();

    let report = RunReport {
        pipeline: graph.name.clone(),
        entries,
        edges: graph
            .graph
            .edge_references()
            .map(|edge| (edge.source().index(), edge.target().index()))
            .collect(),
        invocations: invocations.into_inner(),
        open: graph.open.clone(),
    };

    tracing::info!("Run complete! {}", report.summary());
    Ok(report)
}

/// Marks `index` failed and every instance downstream of it skipped.
fn fail(graph: &InstanceGraph, status: &mut [Status], index: NodeIndex, reason: String) {
    let label = graph.graph[index].label();
    tracing::error!(task = %label, "{reason}");
    status[index.index()] = Status::Failed(reason);

    let mut dfs = Dfs::new(&graph.graph, index);
    while let Some(next) = dfs.next(&graph.graph) {
        if next != index && !status[next.index()].is_terminal() {
            status[next.index()] = Status::Skipped {
                upstream: label.clone(),
            };
        }
    }
}

fn advance(span: &tracing::Span, status: &[Status], reported: &mut u64) {
    let done = status.iter().filter(|s| s.is_terminal()).count() as u64;
    if done > *reported {
        span.pb_inc(done - *reported);
        *reported = done;
    }
}

/// Values for every input slot of `index`: bindings fixed at expansion plus
/// producer outputs. List slots concatenate in connection order, gathered
/// instances in axis order.
fn gather(graph: &InstanceGraph, index: NodeIndex, outputs: &HashMap<NodeIndex, Slots>) -> Slots {
    let instance = &graph.graph[index];
    let mut inputs = instance.bound.clone();
    let mut lists: Vec<(&str, Vec<Value>)> = Vec::new();

    for slot in &instance.task.inputs {
        if slot.kind == SlotKind::List && slot.binding.is_none() {
            lists.push((&slot.name, Vec::new()));
        }
    }

    for (producer, feed) in graph.feeds(index) {
        let Some(value) = outputs.get(&producer).and_then(|o| o.lookup(&feed.from)) else {
            continue;
        };

        match lists.iter_mut().find(|(name, _)| *name == feed.to) {
            Some((_, items)) => items.extend(value.items()),
            None => {
                inputs.insert(feed.to.clone(), value.clone());
            }
        }
    }

    for (slot, items) in lists {
        inputs.insert(slot, Value::List(items));
    }

    inputs
}

/// Zips the mapped slots into one set of inputs per element.
fn split_elements(task: &TaskDef, inputs: &Slots) -> anyhow::Result<Vec<Slots>> {
    let columns: Vec<(&str, Vec<Value>)> = task
        .map_over
        .iter()
        .map(|slot| {
            let items = inputs.lookup(slot).map(Value::items).unwrap_or_default();
            (slot.as_str(), items)
        })
        .collect();

    let len = columns.first().map_or(0, |(_, items)| items.len());
    if let Some((slot, items)) = columns.iter().find(|(_, items)| items.len() != len) {
        anyhow::bail!(
            "Mapped slots of '{}' differ in length: '{}' has {} element(s), '{}' has {}",
            task.name,
            columns[0].0,
            len,
            slot,
            items.len()
        );
    }

    Ok((0..len)
        .map(|k| {
            let mut element = inputs.clone();
            for (slot, items) in &columns {
                element.insert(*slot, items[k].clone());
            }
            element
        })
        .collect())
}

/// Removes working directories nothing needs any more: the instance
/// completed and so did every consumer. Leaves without routes are kept, they
/// hold the only copy of their outputs.
fn cleanup(graph: &InstanceGraph, status: &[Status], plan: &SinkPlan) {
    for index in graph.graph.node_indices() {
        if !status[index.index()].is_completed() {
            continue;
        }

        let mut consumers = graph
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .peekable();
        let has_consumers = consumers.peek().is_some();
        let consumed = consumers.all(|c| status[c.index()].is_completed());

        if !consumed || !(has_consumers || plan.has_targets(index)) {
            continue;
        }

        let dir = &graph.graph[index].dir;
        if !dir.exists() {
            continue;
        }

        match fs::remove_dir_all(dir) {
            Ok(()) => tracing::debug!(%dir, "removed intermediates"),
            Err(err) => tracing::warn!(%dir, "Couldn't remove intermediates: {err}"),
        }
    }
}

struct Worker<'a> {
    policy: &'a Policy,
    cancel: &'a Cancel,
    in_flight: InFlight,
    invocations: &'a AtomicUsize,
}

impl Worker<'_> {
    fn execute(&self, instance: &Instance, inputs: Slots) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let span = tracing::span!(Level::INFO, "task", name = %instance);
        span.pb_set_style(&TASK_STYLE);
        span.pb_set_message(&format!("Running {instance}"));
        let _enter = span.enter();

        // A panicking callback only poisons its own instance; everything it
        // touched was cloned for it.
        match catch_unwind(AssertUnwindSafe(|| self.perform(instance, inputs))) {
            Ok(Ok((outputs, cached))) => Outcome::Done { outputs, cached },
            Ok(Err(err)) => match err.downcast_ref::<ToolError>() {
                Some(ToolError::Cancelled) => Outcome::Cancelled,
                _ => Outcome::Failed(format!("{err:#}")),
            },
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };
                Outcome::Failed(msg)
            }
        }
    }

    fn perform(&self, instance: &Instance, inputs: Slots) -> anyhow::Result<(Slots, bool)> {
        let task = &instance.task;
        if !task.is_mapped() {
            return self.act(task, &inputs, &instance.dir, &instance.label());
        }

        let elements = split_elements(task, &inputs)?;
        let total = elements.len();

        let results = elements
            .into_par_iter()
            .enumerate()
            .map(|(k, element)| {
                let dir = instance.dir.join(format!("_{}{}", task.name, k));
                self.act(task, &element, &dir, &format!("{instance}#{k}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut outputs = Slots::new();
        for slot in &task.outputs {
            let values = results
                .iter()
                .filter_map(|(element, _)| element.lookup(slot).cloned())
                .collect::<Vec<_>>();
            outputs.insert(slot.clone(), Value::List(values));
        }

        let cached = total > 0 && results.iter().all(|(_, cached)| *cached);
        Ok((outputs, cached))
    }

    /// Runs the action once. The flag is set when nothing had to run.
    fn act(&self, task: &TaskDef, inputs: &Slots, dir: &Utf8Path, label: &str) -> anyhow::Result<(Slots, bool)> {
        match &task.action {
            Action::Function(callback) => {
                let outputs = callback(inputs)?;
                for slot in &task.outputs {
                    if !outputs.contains(slot) {
                        anyhow::bail!("Task '{}' didn't return output '{}'", task.name, slot);
                    }
                }
                Ok((outputs, false))
            }
            Action::Command(spec) => {
                let invocation = spec.prepare(inputs, dir)?;

                if invocation.declares_outputs() && invocation.outputs_present() {
                    tracing::debug!(task = label, "outputs present, skipping invocation");
                    return Ok((invocation.collect()?, true));
                }

                if self.cancel.is_cancelled() {
                    return Err(ToolError::Cancelled.into());
                }

                self.invocations.fetch_add(1, Ordering::Relaxed);

                match self.policy {
                    Policy::Local { .. } => invocation.run(self.cancel, self.in_flight)?,
                    Policy::Cluster(options) => self.submit(options, spec, &invocation, label)?,
                }

                Ok((invocation.collect()?, false))
            }
        }
    }

    fn submit(
        &self,
        options: &ClusterOptions,
        spec: &CommandSpec,
        invocation: &Invocation,
        label: &str,
    ) -> Result<(), ToolError> {
        let resources = spec
            .resources
            .clone()
            .unwrap_or_else(|| options.resources.clone());
        let job = JobSpec::new(label, invocation.dir(), vec![invocation.command_line()], resources);

        let terminate = self.in_flight == InFlight::Terminate;
        let state = submit_and_wait(options.scheduler.as_ref(), &job, options.poll_interval, || {
            terminate && self.cancel.is_cancelled()
        })?;

        match state {
            JobState::Succeeded => Ok(()),
            JobState::Failed(_) if terminate && self.cancel.is_cancelled() => Err(ToolError::Cancelled),
            JobState::Failed(reason) => Err(invocation.failure(format!("job {reason} (log: {})", job.log()))),
            other => Err(invocation.failure(format!("{other:?}"))),
        }
    }
}
