//! External program invocations.
//!
//! A [`CommandSpec`] is the static argument template of a tool, an
//! [`Invocation`] is that template with every slot substituted for one task
//! instance (or one mapped element of it). Success means a zero exit status
//! and the presence of every declared output.

use std::fs::{self, File};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::engine::{Cancel, InFlight, ResourceRequest};
use crate::error::{TemplateError, ToolError};
use crate::template::Template;
use crate::value::{Slots, Value};

const POLL: Duration = Duration::from_millis(50);
const STDERR_LOG: &str = "stderr.log";
const STDOUT_LOG: &str = "stdout.log";

/// Pseudo-slot holding the directory an invocation runs in.
pub(crate) const DIR_VAR: &str = "dir";

#[derive(Debug, Clone)]
pub(crate) enum Arg {
    /// Literal argument.
    Lit(String),
    /// Value of an input slot, lists expand into several arguments.
    Input(String),
    /// Text of an input slot split on whitespace.
    Split(String),
    /// Path of a declared output.
    Output(String),
    /// Rendered template over inputs, outputs and `{dir}`.
    Format(Template),
}

#[derive(Debug, Clone)]
pub(crate) struct OutputFile {
    pub slot: String,
    pub name: Template,
}

/// Argument template of an external tool plus the files it is expected to
/// leave behind.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub(crate) program: String,
    pub(crate) args: Vec<Arg>,
    pub(crate) outputs: Vec<OutputFile>,
    pub(crate) stdout: Option<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) resources: Option<ResourceRequest>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            outputs: Vec::new(),
            stdout: None,
            env: Vec::new(),
            resources: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Lit(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|arg| Arg::Lit(arg.into())));
        self
    }

    pub fn input(mut self, slot: impl Into<String>) -> Self {
        self.args.push(Arg::Input(slot.into()));
        self
    }

    pub fn split(mut self, slot: impl Into<String>) -> Self {
        self.args.push(Arg::Split(slot.into()));
        self
    }

    pub fn output(mut self, slot: impl Into<String>) -> Self {
        self.args.push(Arg::Output(slot.into()));
        self
    }

    pub fn format(mut self, template: &str) -> Result<Self, TemplateError> {
        self.args.push(Arg::Format(Template::parse(template)?));
        Ok(self)
    }

    /// Declares an output file, named by a template over the inputs and
    /// created inside the invocation directory.
    pub fn produces(mut self, slot: impl Into<String>, name: &str) -> Result<Self, TemplateError> {
        self.outputs.push(OutputFile {
            slot: slot.into(),
            name: Template::parse(name)?,
        });
        Ok(self)
    }

    /// Captures standard output as the text value of `slot`.
    pub fn capture(mut self, slot: impl Into<String>) -> Self {
        self.stdout = Some(slot.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Input slots referenced by the argument list.
    pub(crate) fn referenced_inputs(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for arg in &self.args {
            match arg {
                Arg::Input(slot) | Arg::Split(slot) => names.push(slot.as_str()),
                _ => {}
            }
        }
        for output in &self.outputs {
            names.extend(output.name.placeholders());
        }
        names
    }

    /// Output slots this command fills.
    pub(crate) fn produced(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .map(|o| o.slot.as_str())
            .chain(self.stdout.as_deref())
            .collect()
    }

    /// Substitutes `inputs` into the template for a run inside `dir`.
    pub(crate) fn prepare(&self, inputs: &Slots, dir: &Utf8Path) -> Result<Invocation, ToolError> {
        let input_lookup = |name: &str| inputs.lookup(name).cloned();

        let mut outputs = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let name = output.name.render(input_lookup)?;
            outputs.push((output.slot.clone(), dir.join(name)));
        }

        let lookup = |name: &str| {
            if name == DIR_VAR {
                return Some(Value::from(dir));
            }
            outputs
                .iter()
                .find(|(slot, _)| slot == name)
                .map(|(_, path)| Value::from(path.clone()))
                .or_else(|| inputs.lookup(name).cloned())
        };

        let mut args = Vec::new();
        for arg in &self.args {
            match arg {
                Arg::Lit(text) => args.push(text.clone()),
                Arg::Input(slot) => {
                    let value = inputs
                        .lookup(slot)
                        .ok_or_else(|| ToolError::MissingInput(slot.clone()))?;
                    args.extend(value.to_args());
                }
                Arg::Split(slot) => {
                    let value = inputs
                        .lookup(slot)
                        .ok_or_else(|| ToolError::MissingInput(slot.clone()))?;
                    args.extend(value.to_string().split_whitespace().map(str::to_string));
                }
                Arg::Output(slot) => {
                    let (_, path) = outputs
                        .iter()
                        .find(|(name, _)| name == slot)
                        .ok_or_else(|| ToolError::MissingInput(slot.clone()))?;
                    args.push(path.to_string());
                }
                Arg::Format(template) => args.push(template.render(lookup)?),
            }
        }

        let stdout = self
            .stdout
            .as_ref()
            .map(|slot| (slot.clone(), dir.join(format!("{slot}.stdout"))));

        Ok(Invocation {
            program: self.program.clone(),
            args,
            env: self.env.clone(),
            dir: dir.to_path_buf(),
            outputs,
            stdout,
        })
    }
}

/// One fully substituted external program call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) dir: Utf8PathBuf,
    pub(crate) outputs: Vec<(String, Utf8PathBuf)>,
    pub(crate) stdout: Option<(String, Utf8PathBuf)>,
}

impl Invocation {
    /// Whether the invocation leaves anything behind that a rerun could
    /// reuse.
    pub fn declares_outputs(&self) -> bool {
        !self.outputs.is_empty() || self.stdout.is_some()
    }

    /// True when every declared output, including captured output, exists.
    pub fn outputs_present(&self) -> bool {
        self.outputs
            .iter()
            .map(|(_, path)| path)
            .chain(self.stdout.as_ref().map(|(_, path)| path))
            .all(|path| path.exists())
    }

    /// Reads the declared outputs back as slot values.
    pub fn collect(&self) -> Result<Slots, ToolError> {
        let mut slots = Slots::new();

        for (slot, path) in &self.outputs {
            if !path.exists() {
                return Err(ToolError::MissingOutput {
                    program: self.program.clone(),
                    slot: slot.clone(),
                    path: path.clone(),
                });
            }
            slots.insert(slot.clone(), path.clone());
        }

        if let Some((slot, path)) = &self.stdout {
            let text = fs::read_to_string(path).map_err(|_| ToolError::MissingOutput {
                program: self.program.clone(),
                slot: slot.clone(),
                path: path.clone(),
            })?;
            slots.insert(slot.clone(), text.trim().to_string());
        }

        Ok(slots)
    }

    /// Runs the program to completion in its directory. While it runs, a
    /// cancelled run kills the child when `in_flight` says so.
    pub fn run(&self, cancel: &Cancel, in_flight: InFlight) -> Result<(), ToolError> {
        fs::create_dir_all(&self.dir)?;

        let partial = self
            .stdout
            .as_ref()
            .map(|(_, path)| path.with_extension("stdout.partial"));

        let stdout = match &partial {
            Some(path) => File::create(path)?,
            None => File::create(self.dir.join(STDOUT_LOG))?,
        };
        let stderr_path = self.dir.join(STDERR_LOG);
        let stderr = File::create(&stderr_path)?;

        tracing::debug!(program = %self.program, args = ?self.args, "launching");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if cancel.is_cancelled() && in_flight == InFlight::Terminate {
                child.kill()?;
                child.wait()?;
                return Err(ToolError::Cancelled);
            }

            thread::sleep(POLL);
        };

        if !status.success() {
            return Err(self.failure(status.to_string()));
        }

        if let (Some(partial), Some((_, path))) = (&partial, &self.stdout) {
            fs::rename(partial, path)?;
        }

        for (slot, path) in &self.outputs {
            if !path.exists() {
                return Err(ToolError::MissingOutput {
                    program: self.program.clone(),
                    slot: slot.clone(),
                    path: path.clone(),
                });
            }
        }

        Ok(())
    }

    /// Exit failure carrying the tail of the invocation's stderr log.
    pub(crate) fn failure(&self, status: String) -> ToolError {
        ToolError::Exit {
            program: self.program.clone(),
            status,
            stderr: tail(&self.dir.join(STDERR_LOG)),
        }
    }

    /// Shell line reproducing this invocation, used in batch job scripts.
    pub fn command_line(&self) -> String {
        let mut line = format!("cd {} &&", quote(self.dir.as_str()));

        for (key, value) in &self.env {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&quote(value));
        }

        line.push(' ');
        line.push_str(&quote(&self.program));
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg));
        }

        match &self.stdout {
            Some((_, path)) => {
                let partial = path.with_extension("stdout.partial");
                line.push_str(&format!(
                    " > {} 2> {} && mv {} {}",
                    quote(partial.as_str()),
                    STDERR_LOG,
                    quote(partial.as_str()),
                    quote(path.as_str())
                ));
            }
            None => line.push_str(&format!(" > {STDOUT_LOG} 2> {STDERR_LOG}")),
        }

        line
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }
}

/// Last few lines of a log file, formatted for an error message.
fn tail(path: &Utf8Path) -> String {
    const LINES: usize = 5;

    let Ok(text) = fs::read_to_string(path) else {
        return String::new();
    };

    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return String::new();
    }

    let start = lines.len().saturating_sub(LINES);
    format!(":\n{}", lines[start..].join("\n"))
}

/// Quotes a word for POSIX shells.
pub(crate) fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+%@".contains(c));

    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bet() -> CommandSpec {
        CommandSpec::new("bet")
            .input("in_file")
            .output("out_file")
            .arg("-f")
            .arg("0.4")
            .arg("-m")
            .produces("out_file", "{in_file:stem}_brain.nii.gz")
            .unwrap()
            .produces("mask_file", "{in_file:stem}_brain_mask.nii.gz")
            .unwrap()
    }

    #[test]
    fn prepare_substitutes_inputs_and_outputs() {
        let inputs = Slots::new().with("in_file", Utf8PathBuf::from("/data/mag_echo_1.nii.gz"));
        let invocation = bet().prepare(&inputs, Utf8Path::new("/work/bet")).unwrap();

        assert_eq!(
            invocation.args,
            vec![
                "/data/mag_echo_1.nii.gz",
                "/work/bet/mag_echo_1_brain.nii.gz",
                "-f",
                "0.4",
                "-m"
            ]
        );
        assert_eq!(
            invocation.outputs[1],
            (
                "mask_file".to_string(),
                Utf8PathBuf::from("/work/bet/mag_echo_1_brain_mask.nii.gz")
            )
        );
    }

    #[test]
    fn split_and_list_arguments() {
        let spec = CommandSpec::new("fslmaths")
            .input("in_file")
            .split("op_string")
            .input("operands");
        let inputs = Slots::new()
            .with("in_file", Utf8PathBuf::from("a.nii.gz"))
            .with("op_string", "-add 1 -div 2")
            .with(
                "operands",
                vec![Value::from("-add"), Value::from(Utf8PathBuf::from("b.nii.gz"))],
            );

        let invocation = spec.prepare(&inputs, Utf8Path::new("/w")).unwrap();
        assert_eq!(
            invocation.args,
            vec!["a.nii.gz", "-add", "1", "-div", "2", "-add", "b.nii.gz"]
        );
    }

    #[test]
    fn format_sees_dir() {
        let spec = CommandSpec::new("antsBrainExtraction.sh")
            .arg("-o")
            .format("{dir}/highres001_")
            .unwrap();
        let invocation = spec.prepare(&Slots::new(), Utf8Path::new("/w/ants")).unwrap();
        assert_eq!(invocation.args, vec!["-o", "/w/ants/highres001_"]);
    }

    #[test]
    fn missing_input_is_reported() {
        let err = bet().prepare(&Slots::new(), Utf8Path::new("/w")).unwrap_err();
        assert!(matches!(err, ToolError::Template(_) | ToolError::MissingInput(_)));
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("a.nii.gz"), "a.nii.gz");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[cfg(unix)]
    #[test]
    fn run_checks_exit_status_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let cancel = Cancel::new();

        let ok = CommandSpec::new("touch")
            .output("out_file")
            .produces("out_file", "done.txt")
            .unwrap()
            .prepare(&Slots::new(), &dir.join("ok"))
            .unwrap();
        assert!(!ok.outputs_present());
        ok.run(&cancel, InFlight::Finish).unwrap();
        assert!(ok.outputs_present());

        let failing = CommandSpec::new("false")
            .prepare(&Slots::new(), &dir.join("fail"))
            .unwrap();
        assert!(matches!(
            failing.run(&cancel, InFlight::Finish),
            Err(ToolError::Exit { .. })
        ));

        let lying = CommandSpec::new("true")
            .produces("out_file", "never.txt")
            .unwrap()
            .prepare(&Slots::new(), &dir.join("lie"))
            .unwrap();
        assert!(matches!(
            lying.run(&cancel, InFlight::Finish),
            Err(ToolError::MissingOutput { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn captured_stdout_becomes_text() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let invocation = CommandSpec::new("echo")
            .args(["-100", "300"])
            .capture("out_stat")
            .prepare(&Slots::new(), &dir)
            .unwrap();

        invocation.run(&Cancel::new(), InFlight::Finish).unwrap();
        let slots = invocation.collect().unwrap();
        assert_eq!(slots.text("out_stat").unwrap(), "-100 300");
    }
}
