//! Result store.
//!
//! Routed outputs land in `<base>/<container>/<destination>/<scope>/`, where
//! `<scope>` is the axis scope of the producing instance. Every destination
//! is claimed by exactly one instance; the claims are checked for the whole
//! instance graph before the run starts.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;

use crate::error::RouteError;
use crate::expand::InstanceGraph;
use crate::value::{Slots, Value};

#[derive(Debug, Clone)]
pub struct DataSink {
    base: Utf8PathBuf,
    container: String,
}

impl DataSink {
    pub fn new(base: impl Into<Utf8PathBuf>, container: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            container: container.into(),
        }
    }

    pub fn root(&self) -> Utf8PathBuf {
        self.base.join(&self.container)
    }

    /// Assigns a destination directory to every routed slot of every
    /// instance. Two instances claiming the same directory is a conflict.
    pub fn plan(&self, graph: &InstanceGraph) -> Result<SinkPlan, RouteError> {
        let root = self.root();
        let mut claims: HashMap<Utf8PathBuf, NodeIndex> = HashMap::new();
        let mut targets: HashMap<NodeIndex, Vec<Target>> = HashMap::new();

        for route in &graph.routes {
            for index in graph.graph.node_indices() {
                let instance = &graph.graph[index];
                if instance.template != route.task {
                    continue;
                }

                let dir = root
                    .join(&route.destination)
                    .join(instance.bindings.scope_dir());

                match claims.entry(dir.clone()) {
                    Entry::Occupied(entry) if *entry.get() != index => {
                        return Err(RouteError::DestinationConflict {
                            destination: dir,
                            first: graph.graph[*entry.get()].label(),
                            second: instance.label(),
                        });
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(entry) => {
                        entry.insert(index);
                    }
                }

                targets.entry(index).or_default().push(Target {
                    slot: route.slot.clone(),
                    dir,
                    owner: instance.label(),
                });
            }
        }

        Ok(SinkPlan { targets })
    }
}

#[derive(Debug)]
struct Target {
    slot: String,
    dir: Utf8PathBuf,
    owner: String,
}

/// Destinations of one run, per instance.
#[derive(Debug, Default)]
pub struct SinkPlan {
    targets: HashMap<NodeIndex, Vec<Target>>,
}

impl SinkPlan {
    /// Number of routed slot writes across all instances.
    pub fn len(&self) -> usize {
        self.targets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub(crate) fn has_targets(&self, index: NodeIndex) -> bool {
        self.targets.contains_key(&index)
    }

    /// Copies the routed outputs of a completed instance. Paths are copied
    /// by file name, other values are written as `<slot>.txt`. Every
    /// destination is checked before the first copy.
    pub(crate) fn write(&self, index: NodeIndex, outputs: &Slots) -> Result<Vec<Utf8PathBuf>, RouteError> {
        let Some(targets) = self.targets.get(&index) else {
            return Ok(Vec::new());
        };

        let mut copies: Vec<(Source, Utf8PathBuf)> = Vec::new();

        for target in targets {
            let value = outputs
                .lookup(&target.slot)
                .ok_or_else(|| RouteError::MissingOutput {
                    owner: target.owner.clone(),
                    slot: target.slot.clone(),
                })?;

            for (from, name) in sources(&target.slot, value) {
                let to = target.dir.join(&name);

                if copies.iter().any(|(_, other)| *other == to) {
                    return Err(RouteError::DestinationConflict {
                        destination: to,
                        first: target.owner.clone(),
                        second: target.owner.clone(),
                    });
                }

                copies.push((from, to));
            }
        }

        for target in targets {
            fs::create_dir_all(&target.dir).map_err(|source| RouteError::Copy {
                from: Utf8PathBuf::from(&target.slot),
                to: target.dir.clone(),
                source,
            })?;
        }

        for (from, to) in &copies {
            match from {
                Source::File(path) => copy(path, to)?,
                Source::Text(text) => fs::write(to, text).map_err(|source| RouteError::Copy {
                    from: Utf8PathBuf::from(to.file_name().unwrap_or_default()),
                    to: to.clone(),
                    source,
                })?,
            }
        }

        Ok(copies.into_iter().map(|(_, to)| to).collect())
    }
}

enum Source<'a> {
    File(&'a Utf8Path),
    Text(String),
}

fn sources<'a>(slot: &str, value: &'a Value) -> Vec<(Source<'a>, String)> {
    let paths = value.paths();
    if paths.is_empty() {
        return vec![(Source::Text(value.to_string()), format!("{slot}.txt"))];
    }

    paths
        .into_iter()
        .map(|path| {
            let name = path.file_name().unwrap_or(slot).to_string();
            (Source::File(path), name)
        })
        .collect()
}

fn copy(from: &Utf8Path, to: &Utf8Path) -> Result<(), RouteError> {
    fs::copy(from, to)
        .map(|_| ())
        .map_err(|source| RouteError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{Axis, Bindings};
    use crate::blueprint::Blueprint;
    use crate::expand::{ExpandOptions, expand};
    use crate::task::{Action, TaskDef};

    fn producer(name: &str) -> TaskDef {
        TaskDef::new(name, Action::function(|_| Ok(Slots::new()))).output("out_file")
    }

    fn subjects() -> Vec<Axis> {
        vec![Axis::new("subject_id", ["sub-01", "sub-02"])]
    }

    #[test]
    fn distinct_axis_values_never_collide() {
        let mut blueprint = Blueprint::new("qsm");
        let a = blueprint.declare(producer("a")).unwrap();
        blueprint.route(a.slot("out_file"), "qsm_final").unwrap();

        let graph = expand(
            &blueprint.finish().unwrap(),
            &subjects(),
            &ExpandOptions::new("/data", "/work"),
        )
        .unwrap();

        let plan = DataSink::new("/out", "qsm").plan(&graph).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn shared_destination_is_a_conflict() {
        let out = tempfile::tempdir().unwrap();
        let out = Utf8PathBuf::try_from(out.path().to_path_buf()).unwrap();

        let mut blueprint = Blueprint::new("qsm");
        let a = blueprint.declare(producer("a")).unwrap();
        let b = blueprint.declare(producer("b")).unwrap();
        blueprint.route(a.slot("out_file"), "mask_sum").unwrap();
        blueprint.route(b.slot("out_file"), "mask_sum").unwrap();

        let graph = expand(
            &blueprint.finish().unwrap(),
            &subjects(),
            &ExpandOptions::new("/data", "/work"),
        )
        .unwrap();

        let sink = DataSink::new(&out, "qsm");
        match sink.plan(&graph).unwrap_err() {
            RouteError::DestinationConflict {
                destination,
                first,
                second,
            } => {
                assert!(destination.as_str().ends_with("mask_sum/_subject_id_sub-01"));
                assert_eq!(first, "a[subject_id=sub-01]");
                assert_eq!(second, "b[subject_id=sub-01]");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!sink.root().exists());
    }

    #[test]
    fn write_copies_files_into_scoped_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let produced = tmp.join("qsm_final.nii.gz");
        fs::write(&produced, b"data").unwrap();

        let mut blueprint = Blueprint::new("qsm");
        let a = blueprint.declare(producer("a").output("range")).unwrap();
        blueprint.route(a.slot("out_file"), "qsm_final").unwrap();
        blueprint.route(a.slot("range"), "qsm_final").unwrap();

        let graph = expand(
            &blueprint.finish().unwrap(),
            &[Axis::new("subject_id", ["sub-01"])],
            &ExpandOptions::new(&tmp, tmp.join("work")),
        )
        .unwrap();

        let sink = DataSink::new(tmp.join("out"), "qsm");
        let plan = sink.plan(&graph).unwrap();
        let outputs = Slots::new()
            .with("out_file", produced.clone())
            .with("range", "-100 300");

        let index = graph.graph.node_indices().next().unwrap();
        let written = plan.write(index, &outputs).unwrap();

        let dir = sink
            .root()
            .join("qsm_final")
            .join(Bindings::new([("subject_id", "sub-01")]).scope_dir());
        assert_eq!(
            written,
            vec![dir.join("qsm_final.nii.gz"), dir.join("range.txt")]
        );
        assert_eq!(fs::read(dir.join("qsm_final.nii.gz")).unwrap(), b"data");
        assert_eq!(fs::read_to_string(dir.join("range.txt")).unwrap(), "-100 300");
    }

    #[test]
    fn colliding_file_names_are_a_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        for dir in ["e1", "e2"] {
            fs::create_dir_all(tmp.join(dir)).unwrap();
            fs::write(tmp.join(dir).join("qsm.nii.gz"), b"").unwrap();
        }

        let mut blueprint = Blueprint::new("qsm");
        let a = blueprint.declare(producer("a")).unwrap();
        blueprint.route(a.slot("out_file"), "qsm_singleEchoes").unwrap();
        let graph = expand(&blueprint.finish().unwrap(), &[], &ExpandOptions::new(&tmp, &tmp)).unwrap();

        let plan = DataSink::new(tmp.join("out"), "qsm").plan(&graph).unwrap();
        let outputs = Slots::new().with(
            "out_file",
            vec![tmp.join("e1/qsm.nii.gz"), tmp.join("e2/qsm.nii.gz")],
        );
        let index = graph.graph.node_indices().next().unwrap();
        assert!(matches!(
            plan.write(index, &outputs),
            Err(RouteError::DestinationConflict { .. })
        ));
        assert!(!tmp.join("out").exists());
    }

    #[test]
    fn missing_routed_output_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let produced = tmp.join("mask.nii.gz");
        fs::write(&produced, b"").unwrap();

        let mut blueprint = Blueprint::new("qsm");
        let a = blueprint.declare(producer("a").output("range")).unwrap();
        blueprint.route(a.slot("out_file"), "mask_sum").unwrap();
        blueprint.route(a.slot("range"), "mask_sum").unwrap();
        let graph = expand(&blueprint.finish().unwrap(), &[], &ExpandOptions::new(&tmp, &tmp)).unwrap();

        let plan = DataSink::new(tmp.join("out"), "qsm").plan(&graph).unwrap();
        let index = graph.graph.node_indices().next().unwrap();
        match plan.write(index, &Slots::new().with("out_file", produced)) {
            Err(RouteError::MissingOutput { owner, slot }) => {
                assert_eq!(owner, "a");
                assert_eq!(slot, "range");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(!tmp.join("out").exists());
    }
}
