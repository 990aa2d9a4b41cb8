use std::collections::HashSet;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::algo::has_path_connecting;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::command::DIR_VAR;
use crate::error::GraphError;
use crate::task::{Action, Binding, InputSlot, SlotKind, TaskDef};

/// Handle to a declared task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) NodeIndex);

impl TaskId {
    /// Refers to one of the task's slots, input or output depending on where
    /// it is used.
    pub fn slot(self, name: impl Into<String>) -> SlotRef {
        SlotRef {
            task: self,
            slot: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRef {
    pub(crate) task: TaskId,
    pub(crate) slot: String,
}

/// Edge payload: producer output slot feeding a consumer input slot.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub from: String,
    pub to: String,
    /// Connection order, used to concatenate repeated list inputs.
    pub order: usize,
}

/// An output slot copied into the result store under `destination`.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub task: TaskId,
    pub slot: String,
    pub destination: String,
}

/// A step that is known to be needed but whose behaviour is not specified
/// yet. It is reported and never executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequirement {
    pub step: String,
    pub description: String,
}

/// The blueprint of a pipeline.
///
/// `Blueprint` accumulates task templates and the data-dependency edges
/// between them. Every fallible operation validates eagerly, so a finished
/// [`Pipeline`] is always acyclic and fully wired.
///
/// # Example
///
/// ```rust
/// use cortexflow::{Action, Blueprint, InputSlot, Slots, TaskDef};
///
/// let mut blueprint = Blueprint::new("demo");
/// let a = blueprint
///     .declare(TaskDef::new("a", Action::function(|_| Ok(Slots::new().with("out", 1.0)))).output("out"))
///     .unwrap();
/// let b = blueprint
///     .declare(
///         TaskDef::new("b", Action::function(|inputs| Ok(inputs.clone())))
///             .input(InputSlot::single("in")),
///     )
///     .unwrap();
/// blueprint.connect(a.slot("out"), b.slot("in")).unwrap();
/// let pipeline = blueprint.finish().unwrap();
/// assert_eq!(pipeline.len(), 2);
/// ```
#[derive(Debug)]
pub struct Blueprint {
    name: String,
    graph: Graph<Arc<TaskDef>, Link>,
    routes: Vec<Route>,
    open: Vec<OpenRequirement>,
    edges: usize,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
            routes: Vec::new(),
            open: Vec::new(),
            edges: 0,
        }
    }

    /// Registers a task template built from its parts.
    pub fn declare_task<I, O, S>(
        &mut self,
        name: impl Into<String>,
        action: impl Into<Action>,
        inputs: I,
        outputs: O,
    ) -> Result<TaskId, GraphError>
    where
        I: IntoIterator<Item = InputSlot>,
        O: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declare(TaskDef::new(name, action).inputs(inputs).outputs(outputs))
    }

    /// Registers a task template.
    pub fn declare(&mut self, task: TaskDef) -> Result<TaskId, GraphError> {
        if self.graph.node_weights().any(|t| t.name == task.name) {
            return Err(GraphError::DuplicateTask(task.name));
        }

        validate_task(&task)?;

        let index = self.graph.add_node(Arc::new(task));
        Ok(TaskId(index))
    }

    /// Adds a data dependency from a producer output slot to a consumer input
    /// slot.
    pub fn connect(&mut self, producer: SlotRef, consumer: SlotRef) -> Result<(), GraphError> {
        let from = self.task(producer.task)?;
        let to = self.task(consumer.task)?;

        if !from.has_output(&producer.slot) {
            return Err(unknown(&from, &producer.slot));
        }

        let slot = to
            .input_slot(&consumer.slot)
            .ok_or_else(|| unknown(&to, &consumer.slot))?;

        if slot.binding.is_some() {
            return Err(GraphError::SlotAlreadyBound {
                task: to.name.clone(),
                slot: consumer.slot,
            });
        }

        let taken = self
            .graph
            .edges_directed(consumer.task.0, petgraph::Direction::Incoming)
            .any(|edge| edge.weight().to == consumer.slot);

        if taken && slot.kind == SlotKind::Single {
            return Err(GraphError::SlotAlreadyBound {
                task: to.name.clone(),
                slot: consumer.slot,
            });
        }

        if producer.task == consumer.task
            || has_path_connecting(&self.graph, consumer.task.0, producer.task.0, None)
        {
            return Err(GraphError::Cycle {
                from: format!("{}.{}", from.name, producer.slot),
                to: format!("{}.{}", to.name, consumer.slot),
            });
        }

        // Axes the consumer has collapsed but the producer still varies over.
        let gathered: Vec<&str> = to
            .join_over
            .iter()
            .filter(|axis| !from.join_over.contains(axis))
            .map(String::as_str)
            .collect();

        if !gathered.is_empty() && slot.kind == SlotKind::Single {
            return Err(GraphError::GatherNeedsList {
                task: to.name.clone(),
                slot: consumer.slot,
                axes: gathered.join(", "),
            });
        }

        self.graph.add_edge(
            producer.task.0,
            consumer.task.0,
            Link {
                from: producer.slot,
                to: consumer.slot,
                order: self.edges,
            },
        );
        self.edges += 1;

        Ok(())
    }

    /// Copies an output slot into the result store under `destination`
    /// whenever an instance of the task completes.
    pub fn route(
        &mut self,
        producer: SlotRef,
        destination: impl Into<String>,
    ) -> Result<(), GraphError> {
        let task = self.task(producer.task)?;
        if !task.has_output(&producer.slot) {
            return Err(unknown(&task, &producer.slot));
        }

        self.routes.push(Route {
            task: producer.task,
            slot: producer.slot,
            destination: destination.into(),
        });

        Ok(())
    }

    /// Records a step with unknown behaviour instead of guessing at it.
    pub fn open_requirement(&mut self, step: impl Into<String>, description: impl Into<String>) {
        self.open.push(OpenRequirement {
            step: step.into(),
            description: description.into(),
        });
    }

    /// Freezes the blueprint into an immutable pipeline. Every input slot
    /// must carry a binding or be fed by at least one edge.
    pub fn finish(self) -> Result<Pipeline, GraphError> {
        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let fed: HashSet<&str> = self
                .graph
                .edges_directed(index, petgraph::Direction::Incoming)
                .map(|edge| edge.weight().to.as_str())
                .collect();

            if let Some(slot) = task
                .inputs
                .iter()
                .find(|slot| slot.binding.is_none() && !fed.contains(slot.name.as_str()))
            {
                return Err(GraphError::UnwiredSlot {
                    task: task.name.clone(),
                    slot: slot.name.clone(),
                });
            }
        }

        Ok(Pipeline {
            name: self.name,
            graph: self.graph,
            routes: self.routes,
            open: self.open,
        })
    }

    fn task(&self, id: TaskId) -> Result<Arc<TaskDef>, GraphError> {
        self.graph
            .node_weight(id.0)
            .cloned()
            .ok_or_else(|| GraphError::UnknownSlot {
                task: format!("#{}", id.0.index()),
                slot: String::new(),
            })
    }
}

fn unknown(task: &TaskDef, slot: &str) -> GraphError {
    GraphError::UnknownSlot {
        task: task.name.clone(),
        slot: slot.to_string(),
    }
}

fn validate_task(task: &TaskDef) -> Result<(), GraphError> {
    let inputs: HashSet<&str> = task.inputs.iter().map(|s| s.name.as_str()).collect();

    for slot in &task.map_over {
        let input = task.input_slot(slot).ok_or_else(|| unknown(task, slot))?;
        if input.kind != SlotKind::List {
            return Err(GraphError::MapNeedsList {
                task: task.name.clone(),
                slot: slot.clone(),
            });
        }
    }

    for slot in &task.inputs {
        if let Some(Binding::Select(selector)) = &slot.binding {
            let one = matches!(selector.cardinality(), crate::select::Cardinality::One);
            if !one && slot.kind == SlotKind::Single {
                return Err(GraphError::SelectorNeedsList {
                    task: task.name.clone(),
                    slot: slot.name.clone(),
                });
            }
        }
    }

    if let Action::Command(spec) = &task.action {
        let produced = spec.produced();

        for name in spec.referenced_inputs() {
            if !inputs.contains(name) {
                return Err(unknown(task, name));
            }
        }

        for arg in &spec.args {
            match arg {
                crate::command::Arg::Output(slot) if !produced.contains(&slot.as_str()) => {
                    return Err(unknown(task, slot));
                }
                crate::command::Arg::Format(template) => {
                    for name in template.placeholders() {
                        let known = name == DIR_VAR
                            || inputs.contains(name)
                            || produced.contains(&name);
                        if !known {
                            return Err(unknown(task, name));
                        }
                    }
                }
                _ => {}
            }
        }

        for slot in &produced {
            if !task.has_output(slot) {
                return Err(unknown(task, slot));
            }
        }

        for slot in &task.outputs {
            if !produced.contains(&slot.as_str()) {
                return Err(unknown(task, slot));
            }
        }
    }

    Ok(())
}

/// An immutable, validated task graph produced by [`Blueprint::finish`].
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) name: String,
    pub(crate) graph: Graph<Arc<TaskDef>, Link>,
    pub(crate) routes: Vec<Route>,
    pub(crate) open: Vec<OpenRequirement>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDef> {
        self.graph.node_weights().map(Arc::as_ref)
    }

    pub fn task(&self, name: &str) -> Option<TaskId> {
        self.graph
            .node_indices()
            .find(|&i| self.graph[i].name == name)
            .map(TaskId)
    }

    pub fn open_requirements(&self) -> &[OpenRequirement] {
        &self.open
    }

    /// Names of the result store categories this pipeline writes.
    pub fn destinations(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.destination.as_str()).collect()
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "\\\"");
            writeln!(
                f,
                "    {}[\"{}\\n({})\"]",
                index.index(),
                name,
                task.action.kind()
            )?;
        }

        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    {} -- \"{} → {}\" --> {}",
                edge.source().index(),
                edge.weight().from,
                edge.weight().to,
                edge.target().index()
            )?;
        }

        if !self.routes.is_empty() {
            writeln!(f, "    Sink[(Result store)]")?;
            for route in &self.routes {
                writeln!(
                    f,
                    "    {} -- \"{}\" --> Sink",
                    route.task.0.index(),
                    route.destination
                )?;
            }
        }

        for (i, open) in self.open.iter().enumerate() {
            writeln!(f, "    Open{}{{{{\"{}: unspecified\"}}}}", i, open.step)?;
        }

        Ok(())
    }
}
