//! Task templates wrapping the FSL, ANTs and TGV-QSM command line tools.
//!
//! Every builder returns a [`TaskDef`] whose slot names follow the tool's
//! own vocabulary (`in_file`, `out_file`, `mask_file`, ...). Tools applied
//! to each of several scans are mapped over their main input.

use crate::command::CommandSpec;
use crate::engine::ResourceRequest;
use crate::error::TemplateError;
use crate::task::{InputSlot, TaskDef};

fn fsl(program: &str) -> CommandSpec {
    CommandSpec::new(program).env("FSLOUTPUTTYPE", "NIFTI_GZ")
}

/// Linear registration of each `in_file` onto `reference` using mutual
/// information, initialised from the qform.
pub fn flirt(name: &str) -> Result<TaskDef, TemplateError> {
    let spec = fsl("flirt")
        .arg("-in")
        .input("in_file")
        .arg("-ref")
        .input("reference")
        .arg("-out")
        .output("out_file")
        .arg("-omat")
        .output("out_matrix_file")
        .args(["-cost", "mutualinfo", "-usesqform"])
        .produces("out_file", "{in_file:stem}_flirt.nii.gz")?
        .produces("out_matrix_file", "{in_file:stem}_flirt.mat")?;

    Ok(TaskDef::new(name, spec)
        .input(InputSlot::list("in_file"))
        .input(InputSlot::single("reference"))
        .outputs(["out_file", "out_matrix_file"])
        .map_over(["in_file"]))
}

/// Robust brain extraction of each `in_file`, with a binary mask.
pub fn bet(name: &str, frac: f64) -> Result<TaskDef, TemplateError> {
    let spec = fsl("bet")
        .input("in_file")
        .output("out_file")
        .arg("-f")
        .arg(frac.to_string())
        .args(["-m", "-R"])
        .produces("out_file", "{in_file:stem}_brain.nii.gz")?
        .produces("mask_file", "{in_file:stem}_brain_mask.nii.gz")?;

    Ok(TaskDef::new(name, spec)
        .input(InputSlot::list("in_file"))
        .outputs(["out_file", "mask_file"])
        .map_over(["in_file"]))
}

/// Robust intensity range of each `in_file`, as the `<min> <max>` text.
pub fn fslstats_range(name: &str) -> TaskDef {
    let spec = fsl("fslstats").input("in_file").arg("-R").capture("out_stat");

    TaskDef::new(name, spec)
        .input(InputSlot::list("in_file"))
        .output("out_stat")
        .map_over(["in_file"])
}

/// Applies the operation string in `op_string` to each `in_file`.
pub fn image_maths_op(name: &str) -> Result<TaskDef, TemplateError> {
    let spec = fsl("fslmaths")
        .input("in_file")
        .split("op_string")
        .output("out_file")
        .produces("out_file", "{in_file:stem}_maths.nii.gz")?;

    Ok(TaskDef::new(name, spec)
        .input(InputSlot::list("in_file"))
        .input(InputSlot::single("op_string"))
        .output("out_file")
        .map_over(["in_file"]))
}

/// Binary operation `in_file <op> in_file2`. When `mapped`, `in_file2` is a
/// list and the operation runs once per element against the same
/// `in_file`.
pub fn image_maths(name: &str, op: &str, mapped: bool) -> Result<TaskDef, TemplateError> {
    let output = if mapped {
        "{in_file2:stem}_maths.nii.gz"
    } else {
        "{in_file:stem}_maths.nii.gz"
    };

    let spec = fsl("fslmaths")
        .input("in_file")
        .arg(op)
        .input("in_file2")
        .output("out_file")
        .produces("out_file", output)?;

    let task = TaskDef::new(name, spec)
        .input(InputSlot::single("in_file"))
        .output("out_file");

    Ok(if mapped {
        task.input(InputSlot::list("in_file2")).map_over(["in_file2"])
    } else {
        task.input(InputSlot::single("in_file2"))
    })
}

/// `fslmaths in_file <operands...> out_file`, where `operands` is a flat
/// list of operators and operand files.
pub fn multi_image_maths(name: &str) -> Result<TaskDef, TemplateError> {
    let spec = fsl("fslmaths")
        .input("in_file")
        .input("operands")
        .output("out_file")
        .produces("out_file", "{in_file:stem}_maths.nii.gz")?;

    Ok(TaskDef::new(name, spec)
        .input(InputSlot::single("in_file"))
        .input(InputSlot::list("operands"))
        .output("out_file"))
}

/// ANTs template-based brain extraction of `anatomical_image`.
pub fn ants_brain_extraction(name: &str) -> Result<TaskDef, TemplateError> {
    let spec = CommandSpec::new("antsBrainExtraction.sh")
        .args(["-d", "3"])
        .arg("-a")
        .input("anatomical_image")
        .arg("-e")
        .input("brain_template")
        .arg("-m")
        .input("brain_probability_mask")
        .arg("-o")
        .format("{dir}/highres001_")?
        .produces("BrainExtractionMask", "highres001_BrainExtractionMask.nii.gz")?
        .produces("BrainExtractionBrain", "highres001_BrainExtractionBrain.nii.gz")?;

    Ok(TaskDef::new(name, spec)
        .input(InputSlot::single("anatomical_image"))
        .input(InputSlot::single("brain_template"))
        .input(InputSlot::single("brain_probability_mask"))
        .outputs(["BrainExtractionMask", "BrainExtractionBrain"]))
}

/// ANTs cortical thickness pipeline on `anatomical_image`.
/// `segmentation_priors` is a `%d` pattern over the prior images.
pub fn ants_cortical_thickness(name: &str) -> Result<TaskDef, TemplateError> {
    let spec = CommandSpec::new("antsCorticalThickness.sh")
        .args(["-d", "3"])
        .arg("-a")
        .input("anatomical_image")
        .arg("-e")
        .input("brain_template")
        .arg("-m")
        .input("brain_probability_mask")
        .arg("-p")
        .input("segmentation_priors")
        .arg("-t")
        .input("t1_registration_template")
        .arg("-o")
        .format("{dir}/antsCT_")?
        .produces("BrainSegmentation", "antsCT_BrainSegmentation.nii.gz")?
        .produces("CorticalThickness", "antsCT_CorticalThickness.nii.gz")?;

    Ok(TaskDef::new(name, spec)
        .input(InputSlot::single("anatomical_image"))
        .input(InputSlot::single("brain_template"))
        .input(InputSlot::single("brain_probability_mask"))
        .input(InputSlot::single("segmentation_priors"))
        .input(InputSlot::single("t1_registration_template"))
        .outputs(["BrainSegmentation", "CorticalThickness"]))
}

/// N4 bias field correction of each `input_image`.
pub fn n4(name: &str) -> Result<TaskDef, TemplateError> {
    let spec = CommandSpec::new("N4BiasFieldCorrection")
        .args(["-d", "3"])
        .arg("-i")
        .input("input_image")
        .args(["-s", "3", "-b", "[300]", "-c", "[50x50x30x20]"])
        .arg("-o")
        .output("output_image")
        .produces("output_image", "{input_image:stem}_corrected.nii.gz")?;

    Ok(TaskDef::new(name, spec)
        .input(InputSlot::list("input_image"))
        .output("output_image")
        .map_over(["input_image"]))
}

/// Parameters of the TGV-QSM solver.
#[derive(Debug, Clone, PartialEq)]
pub struct TgvOptions {
    pub iterations: u32,
    pub alpha: [f64; 2],
    pub threads: u32,
    pub resources: ResourceRequest,
}

/// TGV susceptibility reconstruction, one run per echo. The phase, mask,
/// echo time and field strength lists are zipped.
pub fn tgv_qsm(name: &str, options: &TgvOptions) -> Result<TaskDef, TemplateError> {
    let spec = CommandSpec::new("tgv_qsm")
        .arg("-p")
        .input("file_phase")
        .arg("-m")
        .input("file_mask")
        .arg("-t")
        .input("TE")
        .arg("-f")
        .input("b0")
        .arg("--alpha")
        .args(options.alpha.map(|a| a.to_string()))
        .arg("-i")
        .arg(options.iterations.to_string())
        .arg("--num-threads")
        .arg(options.threads.to_string())
        .args(["-o", "_qsm_recon"])
        .produces("out_file", "{file_phase:stem}_qsm_recon_000.nii.gz")?
        .resources(options.resources.clone());

    Ok(TaskDef::new(name, spec)
        .inputs(["file_phase", "file_mask", "TE", "b0"].map(InputSlot::list))
        .output("out_file")
        .map_over(["file_phase", "file_mask", "TE", "b0"]))
}

#[cfg(test)]
mod tests {
    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::blueprint::Blueprint;
    use crate::task::Action;
    use crate::value::Slots;

    fn command(task: &TaskDef) -> &CommandSpec {
        match task.action() {
            Action::Command(spec) => spec,
            Action::Function(_) => panic!("expected a command"),
        }
    }

    fn path(p: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(p)
    }

    #[test]
    fn every_tool_declares_cleanly() {
        let mut blueprint = Blueprint::new("tools");
        let tgv = TgvOptions {
            iterations: 1000,
            alpha: [0.0015, 0.0005],
            threads: 1,
            resources: ResourceRequest::new().cpus(16),
        };

        let tasks = [
            flirt("flirt").unwrap(),
            bet("bet", 0.4).unwrap(),
            fslstats_range("stats"),
            image_maths_op("scale").unwrap(),
            image_maths("mul", "-mul", true).unwrap(),
            image_maths("div", "-div", false).unwrap(),
            multi_image_maths("sum").unwrap(),
            ants_brain_extraction("be").unwrap(),
            ants_cortical_thickness("ct").unwrap(),
            n4("n4").unwrap(),
            tgv_qsm("qsm", &tgv).unwrap(),
        ];

        for task in tasks {
            blueprint.declare(task).unwrap();
        }
    }

    #[test]
    fn flirt_arguments() {
        let task = flirt("flirt_space").unwrap();
        let inputs = Slots::new()
            .with("in_file", path("/data/sub-01/space.nii.gz"))
            .with("reference", path("/data/sub-01/T1w.nii.gz"));
        let invocation = command(&task)
            .prepare(&inputs, Utf8Path::new("/w/flirt"))
            .unwrap();

        assert_eq!(
            invocation.args,
            vec![
                "-in",
                "/data/sub-01/space.nii.gz",
                "-ref",
                "/data/sub-01/T1w.nii.gz",
                "-out",
                "/w/flirt/space_flirt.nii.gz",
                "-omat",
                "/w/flirt/space_flirt.mat",
                "-cost",
                "mutualinfo",
                "-usesqform"
            ]
        );
        assert!(
            invocation
                .env
                .contains(&("FSLOUTPUTTYPE".to_string(), "NIFTI_GZ".to_string()))
        );
    }

    #[test]
    fn bet_mask_follows_output_name() {
        let task = bet("bet", 0.4).unwrap();
        let inputs = Slots::new().with("in_file", path("/d/gre_M_echo_1.nii.gz"));
        let invocation = command(&task).prepare(&inputs, Utf8Path::new("/w")).unwrap();

        assert_eq!(
            invocation.args,
            vec!["/d/gre_M_echo_1.nii.gz", "/w/gre_M_echo_1_brain.nii.gz", "-f", "0.4", "-m", "-R"]
        );
        assert_eq!(
            invocation.outputs[1].1,
            path("/w/gre_M_echo_1_brain_mask.nii.gz")
        );
    }

    #[test]
    fn n4_arguments() {
        let task = n4("n4_space").unwrap();
        let inputs = Slots::new().with("input_image", path("/w/space_flirt_maths.nii.gz"));
        let invocation = command(&task).prepare(&inputs, Utf8Path::new("/w/n4")).unwrap();

        assert_eq!(
            invocation.args,
            vec![
                "-d",
                "3",
                "-i",
                "/w/space_flirt_maths.nii.gz",
                "-s",
                "3",
                "-b",
                "[300]",
                "-c",
                "[50x50x30x20]",
                "-o",
                "/w/n4/space_flirt_maths_corrected.nii.gz"
            ]
        );
    }

    #[test]
    fn tgv_carries_its_resources() {
        let resources = ResourceRequest::new().cpus(16).memory_gb(20);
        let task = tgv_qsm(
            "qsm",
            &TgvOptions {
                iterations: 1000,
                alpha: [0.0015, 0.0005],
                threads: 1,
                resources: resources.clone(),
            },
        )
        .unwrap();

        let spec = command(&task);
        assert_eq!(spec.resources, Some(resources));

        let inputs = Slots::new()
            .with("file_phase", path("/w/phs_maths.nii.gz"))
            .with("file_mask", path("/w/mag_brain_mask.nii.gz"))
            .with("TE", 0.0021)
            .with("b0", 3.0);
        let invocation = spec.prepare(&inputs, Utf8Path::new("/w/qsm")).unwrap();
        assert_eq!(
            invocation.args,
            vec![
                "-p",
                "/w/phs_maths.nii.gz",
                "-m",
                "/w/mag_brain_mask.nii.gz",
                "-t",
                "0.0021",
                "-f",
                "3",
                "--alpha",
                "0.0015",
                "0.0005",
                "-i",
                "1000",
                "--num-threads",
                "1",
                "-o",
                "_qsm_recon"
            ]
        );
        assert_eq!(
            invocation.outputs[0].1,
            path("/w/qsm/phs_maths_qsm_recon_000.nii.gz")
        );
    }
}
