use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::command::CommandSpec;
use crate::select::FileSelector;
use crate::value::{Slots, Value};

/// Whether a slot takes one value or collects several.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Single,
    /// Accepts repeated edges; their values are concatenated in connection
    /// order, gathered instances in axis order.
    List,
}

/// A value source fixed at declaration time.
#[derive(Debug, Clone)]
pub enum Binding {
    Literal(Value),
    Select(FileSelector),
}

#[derive(Debug, Clone)]
pub struct InputSlot {
    pub(crate) name: String,
    pub(crate) kind: SlotKind,
    pub(crate) binding: Option<Binding>,
}

impl InputSlot {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SlotKind::Single,
            binding: None,
        }
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SlotKind::List,
            binding: None,
        }
    }

    pub fn literal(mut self, value: impl Into<Value>) -> Self {
        self.binding = Some(Binding::Literal(value.into()));
        self
    }

    pub fn select(mut self, selector: FileSelector) -> Self {
        self.binding = Some(Binding::Select(selector));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }
}

/// Native callback used by function tasks.
pub type TaskFn = Arc<dyn Fn(&Slots) -> anyhow::Result<Slots> + Send + Sync>;

/// What a task does once its inputs are resolved.
#[derive(Clone)]
pub enum Action {
    /// Invoke an external program.
    Command(CommandSpec),
    /// Run an in-process function. These never count as tool invocations.
    Function(TaskFn),
}

impl Action {
    pub fn function<F>(callback: F) -> Self
    where
        F: Fn(&Slots) -> anyhow::Result<Slots> + Send + Sync + 'static,
    {
        Action::Function(Arc::new(callback))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Action::Command(_) => "command",
            Action::Function(_) => "function",
        }
    }
}

impl Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Command(spec) => write!(f, "Action::Command({})", spec.program),
            Action::Function(_) => write!(f, "Action::Function(*)"),
        }
    }
}

impl From<CommandSpec> for Action {
    fn from(spec: CommandSpec) -> Self {
        Action::Command(spec)
    }
}

/// A task template: named slots plus the action run for every instance.
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub(crate) name: String,
    pub(crate) action: Action,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<String>,
    pub(crate) map_over: Vec<String>,
    pub(crate) join_over: Vec<String>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>, action: impl Into<Action>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            map_over: Vec::new(),
            join_over: Vec::new(),
        }
    }

    pub fn input(mut self, slot: InputSlot) -> Self {
        self.inputs.push(slot);
        self
    }

    pub fn inputs(mut self, slots: impl IntoIterator<Item = InputSlot>) -> Self {
        self.inputs.extend(slots);
        self
    }

    pub fn output(mut self, slot: impl Into<String>) -> Self {
        self.outputs.push(slot.into());
        self
    }

    pub fn outputs<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(slots.into_iter().map(Into::into));
        self
    }

    /// Runs the action once per element of the given list slots, zipped.
    /// Every output becomes a list with one entry per element.
    pub fn map_over<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.map_over.extend(slots.into_iter().map(Into::into));
        self
    }

    /// Collapses the axis: one instance covers every value of it, and edges
    /// from producers that still vary over it gather into list slots.
    pub fn join_over(mut self, axis: impl Into<String>) -> Self {
        self.join_over.push(axis.into());
        self
    }

    /// Binds a declared slot to a file selector. An undeclared slot is
    /// added as a single slot.
    pub fn select(self, slot: &str, selector: FileSelector) -> Self {
        self.bind(slot, Binding::Select(selector))
    }

    /// Binds a declared slot to a fixed value.
    pub fn literal(self, slot: &str, value: impl Into<Value>) -> Self {
        self.bind(slot, Binding::Literal(value.into()))
    }

    fn bind(mut self, slot: &str, binding: Binding) -> Self {
        match self.inputs.iter_mut().find(|s| s.name == slot) {
            Some(input) => input.binding = Some(binding),
            None => self.inputs.push(InputSlot {
                name: slot.to_string(),
                kind: SlotKind::Single,
                binding: Some(binding),
            }),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub(crate) fn input_slot(&self, name: &str) -> Option<&InputSlot> {
        self.inputs.iter().find(|slot| slot.name == name)
    }

    pub(crate) fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|slot| slot == name)
    }

    pub(crate) fn is_mapped(&self) -> bool {
        !self.map_over.is_empty()
    }
}
