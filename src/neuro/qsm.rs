//! Multi-echo quantitative susceptibility mapping per subject.
//!
//! Each echo gets a brain mask from its magnitude image and a phase image
//! rescaled to ±π using the range of the first echo. TGV-QSM reconstructs
//! every echo separately; the per-echo maps and masks are then summed and
//! the map sum is divided by the mask sum.

use anyhow::{Context, anyhow};

use crate::axis::Axis;
use crate::blueprint::{Blueprint, Pipeline, SlotRef, TaskId};
use crate::config::Settings;
use crate::error::GraphError;
use crate::neuro::scale::{multi_maths_operands, parse_range, scale_to_pi};
use crate::neuro::sidecar::read_sidecar;
use crate::neuro::tools::{self, TgvOptions};
use crate::select::FileSelector;
use crate::task::{Action, InputSlot, TaskDef};
use crate::value::{Slots, Value};

pub const NAME: &str = "qsm";

/// Builds the pipeline and the axes it is replicated over.
pub fn pipeline(settings: &Settings) -> Result<(Pipeline, Vec<Axis>), GraphError> {
    let s = &settings.qsm;
    let phase = FileSelector::many(s.phase.as_str())?;

    let mut blueprint = Blueprint::new(NAME);

    let bet = blueprint.declare(
        tools::bet("bet", s.bet_frac)?.select("in_file", FileSelector::many(s.magnitude.as_str())?),
    )?;

    let stats = blueprint.declare(tools::fslstats_range("stats").select("in_file", phase.clone()))?;

    let scale = blueprint.declare(
        TaskDef::new("scale_to_pi", Action::function(scale_phase))
            .input(InputSlot::list("ranges"))
            .output("op_string"),
    )?;
    blueprint.connect(stats.slot("out_stat"), scale.slot("ranges"))?;

    let phs_range = blueprint.declare(tools::image_maths_op("phs_range")?.select("in_file", phase))?;
    blueprint.connect(scale.slot("op_string"), phs_range.slot("op_string"))?;

    let params = blueprint.declare(
        TaskDef::new("read_json", Action::function(echo_parameters))
            .input(InputSlot::list("in_file").select(FileSelector::many(s.params.as_str())?))
            .outputs(["EchoTime", "MagneticFieldStrength"])
            .map_over(["in_file"]),
    )?;

    let qsm = blueprint.declare(tools::tgv_qsm(
        "qsm",
        &TgvOptions {
            iterations: s.iterations,
            alpha: s.alpha,
            threads: s.threads,
            resources: s.resources.clone(),
        },
    )?)?;
    blueprint.connect(params.slot("EchoTime"), qsm.slot("TE"))?;
    blueprint.connect(params.slot("MagneticFieldStrength"), qsm.slot("b0"))?;
    blueprint.connect(bet.slot("mask_file"), qsm.slot("file_mask"))?;
    blueprint.connect(phs_range.slot("out_file"), qsm.slot("file_phase"))?;

    let add_masks = sum(&mut blueprint, "add_masks", bet.slot("mask_file"))?;
    let add_qsms = sum(&mut blueprint, "add_qsms", qsm.slot("out_file"))?;

    let final_qsm = blueprint.declare(tools::image_maths(
        "divide_added_qsm_by_added_masks",
        "-div",
        false,
    )?)?;
    blueprint.connect(add_qsms.slot("out_file"), final_qsm.slot("in_file"))?;
    blueprint.connect(add_masks.slot("out_file"), final_qsm.slot("in_file2"))?;

    blueprint.route(add_masks.slot("out_file"), "mask_sum")?;
    blueprint.route(add_qsms.slot("out_file"), "qsm_sum")?;
    blueprint.route(final_qsm.slot("out_file"), "qsm_final_default")?;
    blueprint.route(qsm.slot("out_file"), "qsm_singleEchoes")?;
    blueprint.route(bet.slot("mask_file"), "mask_singleEchoes")?;

    let axes = vec![Axis::new("subject_id", s.subjects.iter().cloned())];

    Ok((blueprint.finish()?, axes))
}

/// Declares `generate_<name>_lists` and `<name>`, summing the images of
/// `files`.
fn sum(blueprint: &mut Blueprint, name: &str, files: SlotRef) -> Result<TaskId, GraphError> {
    let lists = blueprint.declare(
        TaskDef::new(format!("generate_{name}_lists"), Action::function(summation))
            .input(InputSlot::list("in_files"))
            .outputs(["in_file", "operands"]),
    )?;
    blueprint.connect(files, lists.slot("in_files"))?;

    let add = blueprint.declare(tools::multi_image_maths(name)?)?;
    blueprint.connect(lists.slot("in_file"), add.slot("in_file"))?;
    blueprint.connect(lists.slot("operands"), add.slot("operands"))?;

    Ok(add)
}

/// `fslmaths` operation mapping the phase onto ±π, from the range of the
/// first echo.
fn scale_phase(inputs: &Slots) -> anyhow::Result<Slots> {
    let first = inputs
        .list("ranges")?
        .first()
        .ok_or_else(|| anyhow!("No phase range to scale from"))?;

    let text = first.to_string();
    let (min, max) = parse_range(&text).ok_or_else(|| anyhow!("Malformed fslstats range '{text}'"))?;

    Ok(Slots::new().with("op_string", scale_to_pi(min, max)))
}

fn echo_parameters(inputs: &Slots) -> anyhow::Result<Slots> {
    let path = inputs.path("in_file")?;
    let (echo_time, field_strength) =
        read_sidecar(path).with_context(|| format!("Couldn't read sidecar {path}"))?;

    Ok(Slots::new()
        .with("EchoTime", echo_time)
        .with("MagneticFieldStrength", field_strength))
}

fn summation(inputs: &Slots) -> anyhow::Result<Slots> {
    let (first, operands) =
        multi_maths_operands(inputs.list("in_files")?).ok_or_else(|| anyhow!("Nothing to sum"))?;

    Ok(Slots::new()
        .with("in_file", first)
        .with("operands", Value::List(operands)))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::axis::Bindings;
    use crate::expand::{ExpandOptions, expand};

    fn settings(base: &Utf8Path) -> Settings {
        let mut settings = Settings {
            experiment_dir: base.to_path_buf(),
            ..Settings::default()
        };
        settings.qsm.subjects = vec!["sub-01".to_string(), "sub-02".to_string()];
        settings
    }

    #[test]
    fn wiring_and_routes() {
        let (pipeline, axes) = pipeline(&settings(Utf8Path::new("/data"))).unwrap();

        assert_eq!(pipeline.len(), 11);
        assert_eq!(axes[0].values(), ["sub-01", "sub-02"]);
        assert!(pipeline.open_requirements().is_empty());
        assert_eq!(
            pipeline.destinations(),
            vec![
                "mask_sum",
                "qsm_sum",
                "qsm_final_default",
                "qsm_singleEchoes",
                "mask_singleEchoes"
            ]
        );
    }

    #[test]
    fn expands_echo_lists_per_subject() {
        let tmp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        for sub in ["sub-01", "sub-02"] {
            let anat = base.join(sub).join("ses-02/anat");
            fs::create_dir_all(&anat).unwrap();
            for echo in 1..=3 {
                for file in [
                    format!("{sub}_gre_M_echo_{echo}.nii.gz"),
                    format!("{sub}_gre_P_echo_{echo}.nii.gz"),
                    format!("{sub}_gre_P_echo_{echo}.json"),
                ] {
                    fs::write(anat.join(file), b"").unwrap();
                }
            }
        }

        let settings = settings(&base);
        let (pipeline, axes) = pipeline(&settings).unwrap();
        let graph = expand(
            &pipeline,
            &axes,
            &ExpandOptions::new(&base, settings.working_dir()).strict(true),
        )
        .unwrap();

        assert_eq!(graph.len(), 22);

        let bindings = Bindings::new([("subject_id", "sub-02")]);
        let stats = graph.find("stats", &bindings).unwrap();
        let phases = stats.input("in_file").and_then(Value::as_list).unwrap();
        assert_eq!(phases.len(), 3);
        assert!(phases[0].to_string().ends_with("sub-02_gre_P_echo_1.nii.gz"));

        let params = graph.find("read_json", &bindings).unwrap();
        assert_eq!(params.input("in_file").and_then(Value::as_list).map(<[_]>::len), Some(3));
    }

    #[test]
    fn scale_uses_first_echo() {
        let inputs = Slots::new().with(
            "ranges",
            vec![Value::from("-100.000000 300.000000 "), Value::from("-4096 4095")],
        );
        let outputs = scale_phase(&inputs).unwrap();
        assert_eq!(
            outputs.text("op_string").unwrap(),
            "-add 100.0000000000 -div 200.0000000000 -mul 6.28318530718 -sub 3.14159265359"
        );

        let empty = Slots::new().with("ranges", Vec::<Value>::new());
        assert!(scale_phase(&empty).is_err());
    }

    #[test]
    fn echo_parameters_fall_back_to_defaults() {
        let inputs = Slots::new().with("in_file", Utf8PathBuf::from("/nonexistent/echo_1.json"));
        let outputs = echo_parameters(&inputs).unwrap();
        assert_eq!(outputs.number("EchoTime").unwrap(), 0.001);
        assert_eq!(outputs.number("MagneticFieldStrength").unwrap(), 7.0);
    }

    #[test]
    fn summation_splits_first_file() {
        let inputs = Slots::new().with(
            "in_files",
            vec![
                Utf8PathBuf::from("m1.nii.gz"),
                Utf8PathBuf::from("m2.nii.gz"),
            ],
        );
        let outputs = summation(&inputs).unwrap();
        assert_eq!(outputs.path("in_file").unwrap().as_str(), "m1.nii.gz");
        assert_eq!(outputs.get("operands").unwrap().to_args(), vec!["-add", "m2.nii.gz"]);
    }
}
