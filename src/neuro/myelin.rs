//! Myelin mapping: FLAIR and SPACE scans registered to the T1w, masked with
//! the ANTs brain mask and bias corrected, per subject and session.

use camino::Utf8Path;

use crate::axis::Axis;
use crate::blueprint::{Blueprint, Pipeline};
use crate::config::Settings;
use crate::error::GraphError;
use crate::neuro::tools;
use crate::select::FileSelector;

pub const NAME: &str = "myelin_mapping";

const MIN_MASK: &str = "minimum-intensity mask combination step, specification unknown";

/// Builds the pipeline and the axes it is replicated over.
pub fn pipeline(settings: &Settings) -> Result<(Pipeline, Vec<Axis>), GraphError> {
    let s = &settings.myelin;
    let t1w = FileSelector::one(s.t1w.as_str())?;

    let mut blueprint = Blueprint::new(NAME);

    let flirt_space = blueprint.declare(
        tools::flirt("flirt_space")?
            .select("in_file", FileSelector::many(s.space.as_str())?)
            .select("reference", t1w.clone()),
    )?;
    let flirt_flair = blueprint.declare(
        tools::flirt("flirt_flair")?
            .select("in_file", FileSelector::many(s.flair.as_str())?)
            .select("reference", t1w.clone()),
    )?;

    let ants_be = blueprint.declare(
        tools::ants_brain_extraction("ants_be")?
            .select("anatomical_image", t1w.clone())
            .literal("brain_template", settings.resolve(&s.brain_template))
            .literal("brain_probability_mask", settings.resolve(&s.brain_probability_mask)),
    )?;

    let antsct = blueprint.declare(
        tools::ants_cortical_thickness("antsct")?
            .select("anatomical_image", t1w)
            .literal("brain_template", settings.resolve(&s.ct_template))
            .literal("brain_probability_mask", settings.resolve(&s.ct_probability_mask))
            .literal("segmentation_priors", settings.resolve(Utf8Path::new(&s.ct_priors)))
            .literal("t1_registration_template", settings.resolve(&s.ct_registration_template)),
    )?;

    let mask_flair = blueprint.declare(tools::image_maths("mult_mask_flair", "-mul", true)?)?;
    blueprint.connect(ants_be.slot("BrainExtractionMask"), mask_flair.slot("in_file"))?;
    blueprint.connect(flirt_flair.slot("out_file"), mask_flair.slot("in_file2"))?;

    let mask_space = blueprint.declare(tools::image_maths("mult_mask_space", "-mul", true)?)?;
    blueprint.connect(ants_be.slot("BrainExtractionMask"), mask_space.slot("in_file"))?;
    blueprint.connect(flirt_space.slot("out_file"), mask_space.slot("in_file2"))?;

    let n4_flair = blueprint.declare(tools::n4("n4_flair")?)?;
    blueprint.connect(mask_flair.slot("out_file"), n4_flair.slot("input_image"))?;

    let n4_space = blueprint.declare(tools::n4("n4_space")?)?;
    blueprint.connect(mask_space.slot("out_file"), n4_space.slot("input_image"))?;

    blueprint.open_requirement("min_mask_flair", MIN_MASK);
    blueprint.open_requirement("min_mask_space", MIN_MASK);

    blueprint.route(mask_space.slot("out_file"), "spacemasked")?;
    blueprint.route(mask_flair.slot("out_file"), "flairmasked")?;
    blueprint.route(n4_space.slot("output_image"), "spaceN4")?;
    blueprint.route(n4_flair.slot("output_image"), "flairN4")?;
    blueprint.route(antsct.slot("BrainSegmentation"), "brainsegmentation")?;
    blueprint.route(ants_be.slot("BrainExtractionMask"), "mask_ants_t1w")?;
    blueprint.route(ants_be.slot("BrainExtractionBrain"), "brain_ants_t1w")?;

    let axes = vec![
        Axis::new("subject_id", s.subjects.iter().cloned()),
        Axis::new("session_id", s.sessions.iter().cloned()),
    ];

    Ok((blueprint.finish()?, axes))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::axis::Bindings;
    use crate::expand::{ExpandOptions, expand};
    use crate::value::Value;

    fn settings(base: &Utf8Path) -> Settings {
        let mut settings = Settings {
            experiment_dir: base.to_path_buf(),
            ..Settings::default()
        };
        settings.myelin.subjects = vec!["sub-SB16".to_string()];
        settings.myelin.sessions = vec!["ses-01_7T".to_string(), "ses-02_7T".to_string()];
        settings
    }

    #[test]
    fn wiring_routes_and_open_steps() {
        let (pipeline, axes) = pipeline(&settings(Utf8Path::new("/data"))).unwrap();

        assert_eq!(pipeline.name(), NAME);
        assert_eq!(pipeline.len(), 8);
        assert_eq!(axes.len(), 2);
        assert_eq!(
            pipeline.destinations(),
            vec![
                "spacemasked",
                "flairmasked",
                "spaceN4",
                "flairN4",
                "brainsegmentation",
                "mask_ants_t1w",
                "brain_ants_t1w"
            ]
        );

        let open = pipeline.open_requirements();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].step, "min_mask_flair");
        assert_eq!(open[1].description, MIN_MASK);
    }

    #[test]
    fn expands_over_subjects_and_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();

        let touch = |rel: &str| {
            let path = base.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"").unwrap();
        };
        touch("sub-SB16/ses-01_7T/anat/sub-SB16_ses-01_7T_T1w.nii.gz");
        touch("sub-SB16/ses-02_7T/anat/sub-SB16_ses-02_7T_T1w.nii.gz");
        touch("sub-SB16/ses-02_3T/anat/sub-SB16_space_run-1.nii.gz");
        touch("sub-SB16/ses-02_3T/anat/sub-SB16_space_run-2.nii.gz");
        touch("sub-SB16/ses-02_3T/anat/sub-SB16_flair.nii.gz");

        let settings = settings(&base);
        let (pipeline, axes) = pipeline(&settings).unwrap();
        let graph = expand(
            &pipeline,
            &axes,
            &ExpandOptions::new(&base, settings.working_dir()).strict(true),
        )
        .unwrap();

        assert_eq!(graph.len(), 16);

        let bindings = Bindings::new([("subject_id", "sub-SB16"), ("session_id", "ses-02_7T")]);
        let flirt = graph.find("flirt_space", &bindings).unwrap();
        assert_eq!(flirt.input("in_file").and_then(Value::as_list).map(<[_]>::len), Some(2));
        assert_eq!(
            flirt.input("reference").and_then(Value::as_path),
            Some(base.join("sub-SB16/ses-02_7T/anat/sub-SB16_ses-02_7T_T1w.nii.gz").as_path())
        );

        let antsct = graph.find("antsct", &bindings).unwrap();
        assert_eq!(
            antsct.input("segmentation_priors").map(Value::to_string),
            Some(base.join("derivatives/myelin_mapping/Priors/priors%d.nii.gz").into_string())
        );
    }

    #[test]
    fn missing_scans_leave_instances_unresolved() {
        let (pipeline, axes) = pipeline(&settings(Utf8Path::new("/nonexistent"))).unwrap();
        let graph = expand(&pipeline, &axes, &ExpandOptions::new("/nonexistent", "/w")).unwrap();

        // flirt x2, ants_be and antsct for each of the two sessions
        assert_eq!(graph.instances().filter(|i| !i.is_resolved()).count(), 8);
        // both flirt slots fail on their own
        assert_eq!(graph.unresolved().len(), 12);
    }
}
