//! Replication of a pipeline across iteration axes.
//!
//! Every task template becomes one instance per combination of the axes it
//! is not joined over. File selectors are resolved here, before anything
//! runs, so a missing input shows up as an [`ExpandError::UnresolvedInput`]
//! instead of a tool failure halfway through a run.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::axis::{Axis, Bindings, product};
use crate::blueprint::{OpenRequirement, Pipeline, Route, TaskId};
use crate::error::ExpandError;
use crate::task::{Binding, TaskDef};
use crate::value::{Slots, Value};

#[derive(Debug, Clone)]
pub struct ExpandOptions {
    base_dir: Utf8PathBuf,
    work_dir: Utf8PathBuf,
    strict: bool,
}

impl ExpandOptions {
    /// File selectors resolve against `base_dir`, instances work inside
    /// `work_dir`.
    pub fn new(base_dir: impl Into<Utf8PathBuf>, work_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            work_dir: work_dir.into(),
            strict: false,
        }
    }

    /// Fail the whole expansion on the first unresolved input instead of
    /// marking the affected instance as failed.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// One fully path-resolved execution of a task template.
#[derive(Debug, Clone)]
pub struct Instance {
    pub(crate) task: Arc<TaskDef>,
    pub(crate) template: TaskId,
    pub(crate) bindings: Bindings,
    pub(crate) dir: Utf8PathBuf,
    pub(crate) bound: Slots,
    pub(crate) unresolved: Option<String>,
}

impl Instance {
    pub fn task_name(&self) -> &str {
        &self.task.name
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Axis-scoped working directory of this instance.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Value bound at expansion time, literal or resolved selector.
    pub fn input(&self, slot: &str) -> Option<&Value> {
        self.bound.lookup(slot)
    }

    pub fn is_resolved(&self) -> bool {
        self.unresolved.is_none()
    }

    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bindings.is_empty() {
            write!(f, "{}", self.task.name)
        } else {
            write!(f, "{}[{}]", self.task.name, self.bindings)
        }
    }
}

/// Edge between instances.
#[derive(Debug, Clone)]
pub(crate) struct Feed {
    pub from: String,
    pub to: String,
    /// Connection order of the template edge.
    pub order: usize,
    /// Position among the producer instances gathered by this edge.
    pub position: usize,
}

/// The expanded task-instance graph. Node indices follow a topological order.
#[derive(Debug)]
pub struct InstanceGraph {
    pub(crate) name: String,
    pub(crate) graph: Graph<Instance, Feed>,
    pub(crate) routes: Vec<Route>,
    pub(crate) open: Vec<OpenRequirement>,
    pub(crate) unresolved: Vec<ExpandError>,
}

impl InstanceGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.graph.node_weights()
    }

    pub fn instances_of<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a Instance> + 'a {
        self.graph.node_weights().filter(move |i| i.task.name == task)
    }

    pub fn find(&self, task: &str, bindings: &Bindings) -> Option<&Instance> {
        self.graph
            .node_weights()
            .find(|i| i.task.name == task && &i.bindings == bindings)
    }

    /// Inputs that could not be resolved; their instances start out failed.
    pub fn unresolved(&self) -> &[ExpandError] {
        &self.unresolved
    }

    pub fn open_requirements(&self) -> &[OpenRequirement] {
        &self.open
    }

    /// Producers feeding `index`, grouped per input slot in gathering order.
    pub(crate) fn feeds(&self, index: NodeIndex) -> Vec<(NodeIndex, &Feed)> {
        let mut feeds: Vec<_> = self
            .graph
            .edges_directed(index, petgraph::Direction::Incoming)
            .map(|edge| (edge.source(), edge.weight()))
            .collect();
        feeds.sort_by_key(|(_, feed)| (feed.order, feed.position));
        feeds
    }
}

/// Expands `pipeline` across the cartesian product of `axes`.
pub fn expand(
    pipeline: &Pipeline,
    axes: &[Axis],
    options: &ExpandOptions,
) -> Result<InstanceGraph, ExpandError> {
    let mut names = HashSet::new();
    for axis in axes {
        if !names.insert(axis.name()) {
            return Err(ExpandError::DuplicateAxis(axis.name().to_string()));
        }
    }

    for task in pipeline.tasks() {
        for axis in &task.join_over {
            if !names.contains(axis.as_str()) {
                return Err(ExpandError::UnknownAxis {
                    task: task.name.clone(),
                    axis: axis.clone(),
                });
            }
        }
    }

    // Blueprint::connect refuses cycles, so this cannot fail.
    let order = petgraph::algo::toposort(&pipeline.graph, None).expect("Cycle detected in task graph");

    let root = options.work_dir.join(&pipeline.name);
    let mut graph: Graph<Instance, Feed> = Graph::new();
    let mut by_task: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    let mut unresolved = Vec::new();

    for template in order {
        let task = &pipeline.graph[template];
        let task_axes: Vec<&Axis> = axes
            .iter()
            .filter(|axis| !task.join_over.iter().any(|j| j == axis.name()))
            .collect();

        let mut instances = Vec::new();

        for bindings in product(&task_axes) {
            let mut bound = Slots::new();
            let mut failure = None;

            for slot in &task.inputs {
                match &slot.binding {
                    Some(Binding::Literal(value)) => {
                        bound.insert(slot.name.clone(), value.clone());
                    }
                    Some(Binding::Select(selector)) => {
                        match selector.resolve(&options.base_dir, &bindings) {
                            Ok(value) => {
                                bound.insert(slot.name.clone(), value);
                            }
                            Err(source) => {
                                let err = ExpandError::UnresolvedInput {
                                    task: task.name.clone(),
                                    slot: slot.name.clone(),
                                    bindings: bindings.to_string(),
                                    pattern: selector.pattern().to_string(),
                                    source,
                                };

                                if options.strict {
                                    return Err(err);
                                }

                                tracing::warn!("{err}");
                                failure.get_or_insert_with(|| err.to_string());
                                unresolved.push(err);
                            }
                        }
                    }
                    None => {}
                }
            }

            let mut feeds = Vec::new();
            for edge in pipeline
                .graph
                .edges_directed(template, petgraph::Direction::Incoming)
            {
                let producers = by_task.get(&edge.source()).map(Vec::as_slice).unwrap_or(&[]);
                let matching = producers
                    .iter()
                    .filter(|&&p| graph[p].bindings.agrees_with(&bindings));

                for (position, &producer) in matching.enumerate() {
                    feeds.push((
                        producer,
                        Feed {
                            from: edge.weight().from.clone(),
                            to: edge.weight().to.clone(),
                            order: edge.weight().order,
                            position,
                        },
                    ));
                }
            }

            let dir = root.join(bindings.scope_dir()).join(&task.name);
            let index = graph.add_node(Instance {
                task: task.clone(),
                template: TaskId(template),
                bindings,
                dir,
                bound,
                unresolved: failure,
            });

            for (producer, feed) in feeds {
                graph.add_edge(producer, index, feed);
            }

            instances.push(index);
        }

        by_task.insert(template, instances);
    }

    tracing::info!(
        pipeline = %pipeline.name,
        instances = graph.node_count(),
        unresolved = unresolved.len(),
        "expanded task graph"
    );

    Ok(InstanceGraph {
        name: pipeline.name.clone(),
        graph,
        routes: pipeline.routes.clone(),
        open: pipeline.open.clone(),
        unresolved,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::blueprint::Blueprint;
    use crate::select::FileSelector;
    use crate::task::{Action, InputSlot};

    fn base_with_t1w(subjects: &[&str], sessions: &[&str]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        for sub in subjects {
            for ses in sessions {
                let anat = base.join(sub).join(ses).join("anat");
                fs::create_dir_all(&anat).unwrap();
                fs::write(anat.join(format!("{sub}_{ses}_T1w.nii.gz")), b"").unwrap();
            }
        }
        (dir, base)
    }

    fn noop() -> Action {
        Action::function(|inputs| Ok(inputs.clone()))
    }

    fn reader() -> TaskDef {
        TaskDef::new("reader", noop())
            .input(
                InputSlot::single("t1w").select(
                    FileSelector::one("{subject_id}/{session_id}/anat/{subject_id}_{session_id}_T1w.nii.gz")
                        .unwrap(),
                ),
            )
            .output("t1w")
    }

    fn axes(subjects: &[&str], sessions: &[&str]) -> Vec<Axis> {
        vec![
            Axis::new("subject_id", subjects.iter().copied()),
            Axis::new("session_id", sessions.iter().copied()),
        ]
    }

    #[test]
    fn expansion_is_a_cartesian_product() {
        let subjects = ["sub-01", "sub-02", "sub-03"];
        let sessions = ["ses-01", "ses-02"];
        let (_dir, base) = base_with_t1w(&subjects, &sessions);

        let mut blueprint = Blueprint::new("myelin");
        blueprint.declare(reader()).unwrap();
        let pipeline = blueprint.finish().unwrap();

        let options = ExpandOptions::new(&base, base.join("work"));
        let graph = expand(&pipeline, &axes(&subjects, &sessions), &options).unwrap();

        assert_eq!(graph.len(), 6);
        assert!(graph.unresolved().is_empty());

        let a = graph
            .find(
                "reader",
                &Bindings::new([("subject_id", "sub-01"), ("session_id", "ses-01")]),
            )
            .unwrap();
        let b = graph
            .find(
                "reader",
                &Bindings::new([("subject_id", "sub-01"), ("session_id", "ses-02")]),
            )
            .unwrap();

        let a = a.input("t1w").unwrap().to_string();
        let b = b.input("t1w").unwrap().to_string();
        assert_eq!(a.replace("ses-01", "ses-02"), b);
    }

    #[test]
    fn instance_dirs_are_axis_scoped() {
        let (_dir, base) = base_with_t1w(&["sub-01"], &["ses-01"]);
        let mut blueprint = Blueprint::new("myelin");
        blueprint.declare(reader()).unwrap();

        let graph = expand(
            &blueprint.finish().unwrap(),
            &axes(&["sub-01"], &["ses-01"]),
            &ExpandOptions::new(&base, "/work"),
        )
        .unwrap();

        let instance = graph.instances().next().unwrap();
        assert_eq!(
            instance.dir(),
            "/work/myelin/_subject_id_sub-01_session_id_ses-01/reader"
        );
        assert_eq!(
            instance.label(),
            "reader[subject_id=sub-01, session_id=ses-01]"
        );
    }

    #[test]
    fn missing_files_fail_only_their_instance() {
        let (_dir, base) = base_with_t1w(&["sub-01"], &["ses-01"]);
        let mut blueprint = Blueprint::new("myelin");
        blueprint.declare(reader()).unwrap();
        let pipeline = blueprint.finish().unwrap();
        let axes = axes(&["sub-01", "sub-02"], &["ses-01"]);

        let graph = expand(&pipeline, &axes, &ExpandOptions::new(&base, "/work")).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.unresolved().len(), 1);
        assert_eq!(graph.instances().filter(|i| i.is_resolved()).count(), 1);

        let err = expand(&pipeline, &axes, &ExpandOptions::new(&base, "/work").strict(true))
            .unwrap_err();
        match err {
            ExpandError::UnresolvedInput { task, pattern, .. } => {
                assert_eq!(task, "reader");
                assert!(pattern.contains("{subject_id}"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn joined_tasks_gather_across_the_axis() {
        let subjects = ["sub-01", "sub-02"];
        let sessions = ["ses-01", "ses-02", "ses-03"];
        let (_dir, base) = base_with_t1w(&subjects, &sessions);

        let mut blueprint = Blueprint::new("myelin");
        let reader = blueprint.declare(reader()).unwrap();
        let combine = blueprint
            .declare(
                TaskDef::new("combine", noop())
                    .input(InputSlot::list("masks"))
                    .join_over("session_id"),
            )
            .unwrap();
        blueprint
            .connect(reader.slot("t1w"), combine.slot("masks"))
            .unwrap();

        let graph = expand(
            &blueprint.finish().unwrap(),
            &axes(&subjects, &sessions),
            &ExpandOptions::new(&base, "/work"),
        )
        .unwrap();

        assert_eq!(graph.len(), 6 + 2);
        let combines: Vec<_> = graph
            .graph
            .node_indices()
            .filter(|&i| graph.graph[i].task_name() == "combine")
            .collect();
        assert_eq!(combines.len(), 2);

        for index in combines {
            let feeds = graph.feeds(index);
            assert_eq!(feeds.len(), 3);
            let subject = graph.graph[index].bindings().get("subject_id").unwrap();
            let sessions: Vec<_> = feeds
                .iter()
                .map(|(p, _)| {
                    let producer = &graph.graph[*p];
                    assert_eq!(producer.bindings().get("subject_id"), Some(subject));
                    producer.bindings().get("session_id").unwrap().to_string()
                })
                .collect();
            assert_eq!(sessions, vec!["ses-01", "ses-02", "ses-03"]);
        }
    }

    #[test]
    fn joining_an_unknown_axis_is_an_error() {
        let mut blueprint = Blueprint::new("qsm");
        blueprint
            .declare(TaskDef::new("combine", noop()).join_over("echo"))
            .unwrap();
        let err = expand(
            &blueprint.finish().unwrap(),
            &[Axis::new("subject_id", ["sub-01"])],
            &ExpandOptions::new("/data", "/work"),
        )
        .unwrap_err();
        assert!(matches!(err, ExpandError::UnknownAxis { .. }));
    }

    #[test]
    fn duplicate_axes_are_rejected() {
        let blueprint = Blueprint::new("qsm");
        let err = expand(
            &blueprint.finish().unwrap(),
            &[Axis::new("subject_id", ["a"]), Axis::new("subject_id", ["b"])],
            &ExpandOptions::new("/data", "/work"),
        )
        .unwrap_err();
        assert!(matches!(err, ExpandError::DuplicateAxis(_)));
    }
}
