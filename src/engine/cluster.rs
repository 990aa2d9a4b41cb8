//! Batch scheduler handoff.
//!
//! A task invocation is serialized into a [`JobSpec`] carrying a structured
//! [`ResourceRequest`]; each [`Scheduler`] adapter renders that request in its
//! own directive syntax and drives the scheduler's command line tools.

use std::fs;
use std::process::Command;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::command::quote;
use crate::error::{ConfigError, SchedulerError};

/// Resources requested for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceRequest {
    pub nodes: u32,
    pub cpus: u32,
    pub memory_mb: Option<u64>,
    /// SLURM partition or PBS queue.
    pub partition: Option<String>,
    #[serde(with = "walltime")]
    pub walltime: Option<Duration>,
    pub account: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            nodes: 1,
            cpus: 1,
            memory_mb: None,
            partition: None,
            walltime: None,
            account: None,
        }
    }
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(mut self, nodes: u32) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn memory_mb(mut self, memory: u64) -> Self {
        self.memory_mb = Some(memory);
        self
    }

    pub fn memory_gb(self, memory: u64) -> Self {
        self.memory_mb(memory * 1024)
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn walltime(mut self, walltime: Duration) -> Self {
        self.walltime = Some(walltime);
        self
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// `sbatch` options, one per directive line.
    pub fn slurm_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--nodes={}", self.nodes),
            format!("--cpus-per-task={}", self.cpus),
        ];

        if let Some(memory) = self.memory_mb {
            args.push(format!("--mem={memory}M"));
        }
        if let Some(partition) = &self.partition {
            args.push(format!("--partition={partition}"));
        }
        if let Some(walltime) = self.walltime {
            args.push(format!("--time={}", format_walltime(walltime)));
        }
        if let Some(account) = &self.account {
            args.push(format!("--account={account}"));
        }

        args
    }

    /// The `qsub -l` resource list, e.g.
    /// `nodes=1:ppn=16,mem=20gb,vmem=20gb,walltime=03:00:00`.
    pub fn pbs_resource_list(&self) -> String {
        let mut list = format!("nodes={}:ppn={}", self.nodes, self.cpus);

        if let Some(memory) = self.memory_mb {
            let memory = if memory % 1024 == 0 {
                format!("{}gb", memory / 1024)
            } else {
                format!("{memory}mb")
            };
            list.push_str(&format!(",mem={memory},vmem={memory}"));
        }
        if let Some(walltime) = self.walltime {
            list.push_str(&format!(",walltime={}", format_walltime(walltime)));
        }

        list
    }
}

/// Parses `HH:MM:SS`; hours may exceed 24.
pub fn parse_walltime(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::Walltime(text.to_string());

    let parts: Vec<&str> = text.trim().split(':').collect();
    let [hours, minutes, seconds] = parts.as_slice() else {
        return Err(invalid());
    };

    let hours: u64 = hours.parse().map_err(|_| invalid())?;
    let minutes: u64 = minutes.parse().map_err(|_| invalid())?;
    let seconds: u64 = seconds.parse().map_err(|_| invalid())?;

    if minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }

    Ok(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

fn format_walltime(walltime: Duration) -> String {
    let secs = walltime.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

mod walltime {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(walltime) => s.serialize_str(&super::format_walltime(*walltime)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        text.map(|text| super::parse_walltime(&text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// One batch job: a shell script running `commands` inside `workdir`.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub workdir: Utf8PathBuf,
    pub commands: Vec<String>,
    pub resources: ResourceRequest,
}

impl JobSpec {
    pub fn new(
        name: &str,
        workdir: impl Into<Utf8PathBuf>,
        commands: Vec<String>,
        resources: ResourceRequest,
    ) -> Self {
        Self {
            name: sanitize(name),
            workdir: workdir.into(),
            commands,
            resources,
        }
    }

    /// Batch script with the scheduler's `directives` in its header.
    pub fn script(&self, directives: &[String]) -> String {
        let mut script = String::from("#!/bin/sh\n");
        for directive in directives {
            script.push_str(directive);
            script.push('\n');
        }
        script.push_str("set -e\n");
        script.push_str(&format!("cd {}\n", quote(self.workdir.as_str())));
        for command in &self.commands {
            script.push_str(command);
            script.push('\n');
        }
        script
    }

    fn write(&self, directives: &[String]) -> Result<Utf8PathBuf, SchedulerError> {
        fs::create_dir_all(&self.workdir)?;
        let path = self.workdir.join(format!("{}.sh", self.name));
        fs::write(&path, self.script(directives))?;
        Ok(path)
    }

    /// Combined scheduler log of the job.
    pub(crate) fn log(&self) -> Utf8PathBuf {
        self.workdir.join(format!("{}.log", self.name))
    }
}

/// Job names end up in file names and scheduler listings.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed(_))
    }
}

/// Adapter to an external batch system. Implementations only translate,
/// scheduling decisions stay with the batch system.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Header lines requesting the job's resources.
    fn directives(&self, job: &JobSpec) -> Vec<String>;

    /// Submits the job and returns the scheduler's job id.
    fn submit(&self, job: &JobSpec) -> Result<String, SchedulerError>;

    fn poll(&self, id: &str) -> Result<JobState, SchedulerError>;

    fn cancel(&self, id: &str) -> Result<(), SchedulerError>;
}

fn call(program: &str, args: &[&str]) -> Result<String, SchedulerError> {
    tracing::debug!(program, ?args, "calling scheduler");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| SchedulerError::Command {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SchedulerError::Rejected {
            program: program.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// SLURM through `sbatch`, `sacct` and `scancel`.
#[derive(Debug, Clone, Default)]
pub struct Slurm;

impl Scheduler for Slurm {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn directives(&self, job: &JobSpec) -> Vec<String> {
        let mut lines = vec![format!("#SBATCH --job-name={}", job.name)];
        lines.extend(
            job.resources
                .slurm_args()
                .into_iter()
                .map(|arg| format!("#SBATCH {arg}")),
        );
        lines.push(format!("#SBATCH --output={}", job.log()));
        lines.push(format!("#SBATCH --chdir={}", job.workdir));
        lines
    }

    fn submit(&self, job: &JobSpec) -> Result<String, SchedulerError> {
        let script = job.write(&self.directives(job))?;
        let output = call("sbatch", &["--parsable", script.as_str()])?;
        parse_sbatch(&output)
    }

    fn poll(&self, id: &str) -> Result<JobState, SchedulerError> {
        let output = call("sacct", &["-j", id, "-n", "-X", "-P", "-o", "State"])?;
        Ok(parse_sacct(&output))
    }

    fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        call("scancel", &[id]).map(|_| ())
    }
}

/// `sbatch --parsable` prints `id` or `id;cluster`.
fn parse_sbatch(output: &str) -> Result<String, SchedulerError> {
    let id = output.trim().split(';').next().unwrap_or_default();
    if id.is_empty() {
        return Err(SchedulerError::Parse(output.to_string()));
    }
    Ok(id.to_string())
}

fn parse_sacct(output: &str) -> JobState {
    let state = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next());

    match state {
        // Not in the accounting database yet.
        None => JobState::Queued,
        Some("PENDING" | "REQUEUED" | "CONFIGURING" | "SUSPENDED" | "RESIZING") => JobState::Queued,
        Some("RUNNING" | "COMPLETING" | "STAGE_OUT") => JobState::Running,
        Some("COMPLETED") => JobState::Succeeded,
        Some(other) => JobState::Failed(other.to_string()),
    }
}

/// PBS/Torque through `qsub`, `qstat` and `qdel`.
#[derive(Debug, Clone, Default)]
pub struct Pbs;

impl Scheduler for Pbs {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn directives(&self, job: &JobSpec) -> Vec<String> {
        let mut lines = vec![
            format!("#PBS -N {}", job.name),
            format!("#PBS -l {}", job.resources.pbs_resource_list()),
        ];
        if let Some(queue) = &job.resources.partition {
            lines.push(format!("#PBS -q {queue}"));
        }
        if let Some(account) = &job.resources.account {
            lines.push(format!("#PBS -A {account}"));
        }
        lines.push(format!("#PBS -j oe -o {}", job.log()));
        lines
    }

    fn submit(&self, job: &JobSpec) -> Result<String, SchedulerError> {
        let script = job.write(&self.directives(job))?;
        let output = call("qsub", &[script.as_str()])?;
        let id = output.trim();
        if id.is_empty() {
            return Err(SchedulerError::Parse(output));
        }
        Ok(id.to_string())
    }

    fn poll(&self, id: &str) -> Result<JobState, SchedulerError> {
        let output = call("qstat", &["-x", "-f", id])?;
        parse_qstat(&output)
    }

    fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        call("qdel", &[id]).map(|_| ())
    }
}

fn parse_qstat(output: &str) -> Result<JobState, SchedulerError> {
    let field = |name: &str| {
        output.lines().find_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == name).then(|| value.trim())
        })
    };

    let state = field("job_state").ok_or_else(|| SchedulerError::Parse(output.to_string()))?;

    Ok(match state {
        "Q" | "H" | "W" | "T" | "S" => JobState::Queued,
        "R" | "E" | "B" => JobState::Running,
        "C" | "F" => match field("Exit_status") {
            Some("0") => JobState::Succeeded,
            Some(code) => JobState::Failed(format!("exit status {code}")),
            None => JobState::Failed("no exit status".to_string()),
        },
        other => return Err(SchedulerError::Parse(format!("job_state = {other}"))),
    })
}

/// Submits `job` and blocks until the scheduler reports it finished.
pub(crate) fn submit_and_wait(
    scheduler: &dyn Scheduler,
    job: &JobSpec,
    poll_interval: Duration,
    mut cancelled: impl FnMut() -> bool,
) -> Result<JobState, SchedulerError> {
    let id = scheduler.submit(job)?;
    tracing::info!(scheduler = scheduler.name(), id, job = %job.name, "submitted");

    loop {
        if cancelled() {
            scheduler.cancel(&id)?;
            return Ok(JobState::Failed("cancelled".to_string()));
        }

        let state = scheduler.poll(&id)?;
        if state.is_finished() {
            return Ok(state);
        }

        sleep_checking(poll_interval, &mut cancelled);
    }
}

fn sleep_checking(total: Duration, cancelled: &mut impl FnMut() -> bool) {
    const STEP: Duration = Duration::from_millis(200);

    let mut left = total;
    while !left.is_zero() && !cancelled() {
        let step = left.min(STEP);
        std::thread::sleep(step);
        left -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn myelin_request() -> ResourceRequest {
        ResourceRequest::new()
            .nodes(1)
            .cpus(4)
            .memory_mb(16000)
            .partition("long,wks,all")
    }

    fn qsm_request() -> ResourceRequest {
        ResourceRequest::new()
            .nodes(1)
            .cpus(16)
            .memory_gb(20)
            .walltime(Duration::from_secs(3 * 3600))
    }

    #[test]
    fn slurm_arguments() {
        assert_eq!(
            myelin_request().slurm_args(),
            vec![
                "--nodes=1",
                "--cpus-per-task=4",
                "--mem=16000M",
                "--partition=long,wks,all"
            ]
        );
    }

    #[test]
    fn pbs_resource_list() {
        assert_eq!(
            qsm_request().pbs_resource_list(),
            "nodes=1:ppn=16,mem=20gb,vmem=20gb,walltime=03:00:00"
        );
        assert_eq!(
            myelin_request().pbs_resource_list(),
            "nodes=1:ppn=4,mem=16000mb,vmem=16000mb"
        );
    }

    #[test]
    fn walltime_parsing() {
        assert_eq!(parse_walltime("03:00:00").unwrap(), Duration::from_secs(10800));
        assert_eq!(parse_walltime("100:30:05").unwrap(), Duration::from_secs(361805));
        assert!(parse_walltime("3h").is_err());
        assert!(parse_walltime("01:75:00").is_err());
        assert_eq!(format_walltime(Duration::from_secs(361805)), "100:30:05");
    }

    #[test]
    fn request_from_toml() {
        let request: ResourceRequest = toml::from_str(
            r#"
            cpus = 16
            memory_mb = 20480
            walltime = "03:00:00"
            "#,
        )
        .unwrap();
        assert_eq!(request, qsm_request());

        let err = toml::from_str::<ResourceRequest>(r#"walltime = "soon""#).unwrap_err();
        assert!(err.to_string().contains("walltime"));
    }

    #[test]
    fn scripts_carry_directives() {
        let job = JobSpec::new(
            "bet[subject_id=sub-01]",
            "/work/qsm/bet",
            vec!["bet in.nii.gz out.nii.gz".to_string()],
            qsm_request(),
        );
        assert_eq!(job.name, "bet_subject_id_sub-01_");

        let script = job.script(&Pbs.directives(&job));
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/bin/sh");
        assert_eq!(lines[1], "#PBS -N bet_subject_id_sub-01_");
        assert_eq!(
            lines[2],
            "#PBS -l nodes=1:ppn=16,mem=20gb,vmem=20gb,walltime=03:00:00"
        );
        assert!(script.contains("set -e\ncd /work/qsm/bet\nbet in.nii.gz out.nii.gz\n"));

        let script = job.script(&Slurm.directives(&job));
        assert!(script.contains("#SBATCH --cpus-per-task=16\n"));
        assert!(script.contains("#SBATCH --time=03:00:00\n"));
    }

    #[test]
    fn sbatch_and_sacct_output() {
        assert_eq!(parse_sbatch("12345\n").unwrap(), "12345");
        assert_eq!(parse_sbatch("12345;cluster\n").unwrap(), "12345");
        assert!(parse_sbatch("\n").is_err());

        assert_eq!(parse_sacct(""), JobState::Queued);
        assert_eq!(parse_sacct("PENDING\n"), JobState::Queued);
        assert_eq!(parse_sacct("RUNNING\n"), JobState::Running);
        assert_eq!(parse_sacct("COMPLETED\n"), JobState::Succeeded);
        assert_eq!(
            parse_sacct("CANCELLED by 1000\n"),
            JobState::Failed("CANCELLED".to_string())
        );
    }

    #[test]
    fn qstat_output() {
        let running = "Job Id: 42.server\n    job_state = R\n    queue = batch\n";
        assert_eq!(parse_qstat(running).unwrap(), JobState::Running);

        let done = "Job Id: 42.server\n    job_state = C\n    Exit_status = 0\n";
        assert_eq!(parse_qstat(done).unwrap(), JobState::Succeeded);

        let failed = "Job Id: 42.server\n    job_state = F\n    Exit_status = 271\n";
        assert_eq!(
            parse_qstat(failed).unwrap(),
            JobState::Failed("exit status 271".to_string())
        );

        assert!(parse_qstat("garbage").is_err());
    }

    struct Scripted(std::sync::Mutex<Vec<JobState>>);

    impl Scheduler for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn directives(&self, _: &JobSpec) -> Vec<String> {
            Vec::new()
        }

        fn submit(&self, _: &JobSpec) -> Result<String, SchedulerError> {
            Ok("1".to_string())
        }

        fn poll(&self, _: &str) -> Result<JobState, SchedulerError> {
            Ok(self.0.lock().unwrap().remove(0))
        }

        fn cancel(&self, _: &str) -> Result<(), SchedulerError> {
            Ok(())
        }
    }

    #[test]
    fn waits_until_finished() {
        let scheduler = Scripted(std::sync::Mutex::new(vec![
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
        ]));
        let job = JobSpec::new("a", "/tmp", Vec::new(), ResourceRequest::default());
        let state = submit_and_wait(&scheduler, &job, Duration::ZERO, || false).unwrap();
        assert_eq!(state, JobState::Succeeded);
        assert!(scheduler.0.lock().unwrap().is_empty());
    }
}
