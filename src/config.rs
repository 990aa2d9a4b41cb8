//! Pipeline settings read from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration. Relative paths are resolved against
//! `experiment_dir`.

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::engine::ResourceRequest;
use crate::error::ConfigError;

/// Where task instances run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Local,
    Slurm,
    Pbs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Base directory file selectors resolve against.
    pub experiment_dir: Utf8PathBuf,
    /// Defaults to `<experiment_dir>/work`.
    pub working_dir: Option<Utf8PathBuf>,
    /// Result store container inside `experiment_dir`.
    pub output_container: String,
    /// Local worker count, defaults to the number of CPUs.
    pub jobs: Option<usize>,
    pub strict: bool,
    pub keep_intermediates: bool,
    pub scheduler: SchedulerKind,
    pub poll_interval_secs: u64,
    pub max_in_flight: usize,
    pub myelin: MyelinSettings,
    pub qsm: QsmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            experiment_dir: Utf8PathBuf::from("."),
            working_dir: None,
            output_container: "derivatives".to_string(),
            jobs: None,
            strict: false,
            keep_intermediates: true,
            scheduler: SchedulerKind::Local,
            poll_interval_secs: 30,
            max_in_flight: 64,
            myelin: MyelinSettings::default(),
            qsm: QsmSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn working_dir(&self) -> Utf8PathBuf {
        match &self.working_dir {
            Some(dir) => self.resolve(dir),
            None => self.experiment_dir.join("work"),
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Joins a relative path onto `experiment_dir`.
    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.experiment_dir.join(path)
        }
    }
}

/// Myelin mapping: T1w-referenced FLAIR and SPACE masking and bias
/// correction per subject and session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MyelinSettings {
    pub subjects: Vec<String>,
    pub sessions: Vec<String>,
    pub t1w: String,
    pub space: String,
    pub flair: String,
    pub brain_template: Utf8PathBuf,
    pub brain_probability_mask: Utf8PathBuf,
    pub ct_template: Utf8PathBuf,
    pub ct_probability_mask: Utf8PathBuf,
    /// `antsCorticalThickness.sh -p` pattern, e.g. `Priors/priors%d.nii.gz`.
    pub ct_priors: String,
    pub ct_registration_template: Utf8PathBuf,
    pub resources: ResourceRequest,
}

impl Default for MyelinSettings {
    fn default() -> Self {
        let templates = Utf8Path::new("derivatives/myelin_mapping");
        Self {
            subjects: Vec::new(),
            sessions: Vec::new(),
            t1w: "{subject_id}/{session_id}/anat/{subject_id}_{session_id}_T1w.nii.gz".to_string(),
            space: "{subject_id}/ses-02_3T/anat/*space*.nii.gz".to_string(),
            flair: "{subject_id}/ses-02_3T/anat/*flair*.nii.gz".to_string(),
            brain_template: templates.join("T_template.nii.gz"),
            brain_probability_mask: templates.join("T_template_BrainCerebellumProbabilityMask.nii.gz"),
            ct_template: templates.join("T_template.nii.gz"),
            ct_probability_mask: templates.join("T_template_BrainCerebellumProbabilityMask.nii.gz"),
            ct_priors: templates.join("Priors/priors%d.nii.gz").into_string(),
            ct_registration_template: templates.join("T_template_BrainCerebellum.nii.gz"),
            resources: ResourceRequest::new()
                .nodes(1)
                .cpus(4)
                .memory_mb(16000)
                .partition("long,wks,all"),
        }
    }
}

/// Multi-echo QSM reconstruction per subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QsmSettings {
    pub subjects: Vec<String>,
    pub magnitude: String,
    pub phase: String,
    pub params: String,
    pub bet_frac: f64,
    pub iterations: u32,
    pub alpha: [f64; 2],
    pub threads: u32,
    /// Resources of each TGV-QSM job.
    pub resources: ResourceRequest,
}

impl Default for QsmSettings {
    fn default() -> Self {
        Self {
            subjects: Vec::new(),
            magnitude: "{subject_id}/ses-02/anat/*gre_M_echo_*.nii.gz".to_string(),
            phase: "{subject_id}/ses-02/anat/*gre_P_echo_*.nii.gz".to_string(),
            params: "{subject_id}/ses-02/anat/*gre_P_echo_*.json".to_string(),
            bet_frac: 0.4,
            iterations: 1000,
            alpha: [0.0015, 0.0005],
            threads: 1,
            resources: ResourceRequest::new()
                .nodes(1)
                .cpus(16)
                .memory_gb(20)
                .walltime(Duration::from_secs(3 * 3600)),
        }
    }
}
