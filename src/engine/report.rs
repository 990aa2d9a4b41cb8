use std::fmt::{self, Display, Formatter, Write};
use std::time::Duration;

use crate::axis::Bindings;
use crate::blueprint::OpenRequirement;
use crate::engine::Status;

/// Terminal state of one task instance.
#[derive(Debug, Clone)]
pub struct Entry {
    pub label: String,
    pub task: String,
    pub bindings: Bindings,
    pub status: Status,
    /// Wall time spent in a worker, absent when the instance never started.
    pub duration: Option<Duration>,
}

/// End-of-run summary returned by [`run`](crate::engine::run).
///
/// Lists every instance in topological order, so a failed branch is never
/// silently dropped: its root is `Failed` with the reason and everything
/// below it is `Skipped` naming that root.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub pipeline: String,
    pub entries: Vec<Entry>,
    /// Instance edges as indices into `entries`.
    pub edges: Vec<(usize, usize)>,
    /// External tool invocations actually launched or submitted.
    pub invocations: usize,
    pub open: Vec<OpenRequirement>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub completed: usize,
    pub cached: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl RunReport {
    pub fn get(&self, label: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.label == label)
    }

    pub fn status_of(&self, task: &str, bindings: &Bindings) -> Option<&Status> {
        self.entries
            .iter()
            .find(|e| e.task == task && &e.bindings == bindings)
            .map(|e| &e.status)
    }

    /// True when every instance completed.
    pub fn is_success(&self) -> bool {
        self.entries.iter().all(|e| e.status.is_completed())
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts::default();
        for entry in &self.entries {
            match entry.status {
                Status::Completed { cached } => {
                    counts.completed += 1;
                    if cached {
                        counts.cached += 1;
                    }
                }
                Status::Failed(_) => counts.failed += 1,
                Status::Skipped { .. } => counts.skipped += 1,
                _ => counts.cancelled += 1,
            }
        }
        counts
    }

    /// One line totals.
    pub fn summary(&self) -> String {
        let c = self.counts();
        format!(
            "{} instance(s): {} completed ({} cached), {} failed, {} skipped, {} cancelled; {} invocation(s)",
            self.entries.len(),
            c.completed,
            c.cached,
            c.failed,
            c.skipped,
            c.cancelled,
            self.invocations
        )
    }

    /// Per-instance table with coloured states, for terminals.
    pub fn render_styled(&self) -> String {
        let width = self.entries.iter().map(|e| e.label.len()).max().unwrap_or(0);
        let mut out = String::new();
        for entry in &self.entries {
            let _ = writeln!(out, "{:width$}  {}", entry.label, entry.status.styled());
        }
        for open in &self.open {
            let _ = writeln!(
                out,
                "{:width$}  {}",
                open.step,
                console::style(format!("open requirement: {}", open.description)).magenta()
            );
        }
        let _ = writeln!(out, "{}", self.summary());
        out
    }

    /// Renders the instance graph as a Mermaid diagram.
    ///
    /// * **Green to red**: ran, coloured by duration
    /// * **Blue**: served from existing outputs
    /// * **Grey**: skipped or cancelled
    /// * **Red outline**: failed
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let ran = self.entries.iter().filter_map(|e| match e.status {
            Status::Completed { cached: false } => e.duration.map(|d| d.as_secs_f64()),
            _ => None,
        });

        let (mut min, mut max) = ran.fold((f64::MAX, f64::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));
        if min > max {
            min = 0.0;
            max = 0.0;
        }
        if (max - min).abs() < f64::EPSILON {
            max = min + 1.0;
        }

        for (index, entry) in self.entries.iter().enumerate() {
            let name = entry.label.replace('"', "\\\"");

            let (extra, style) = match &entry.status {
                Status::Completed { cached: false } => {
                    let duration = entry.duration.unwrap_or_default();
                    let t = (duration.as_secs_f64() - min) / (max - min);
                    (format!("{duration:.2?}"), format!("fill:{}", gradient(t)))
                }
                Status::Completed { cached: true } => ("Cached".to_string(), "fill:#ADD8E6".to_string()),
                Status::Failed(_) => ("Failed".to_string(), "fill:#FFFFFF,stroke:#FF0000,stroke-width:3px".to_string()),
                Status::Skipped { .. } => ("Skipped".to_string(), "fill:#D3D3D3".to_string()),
                _ => ("Cancelled".to_string(), "fill:#EEEEEE,stroke-dasharray:4".to_string()),
            };

            let _ = writeln!(f, "    {index}[\"{name}\\n{extra}\"]");
            let _ = writeln!(f, "    style {index} {style}");
        }

        for (source, target) in &self.edges {
            let _ = writeln!(f, "    {source} --> {target}");
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let width = self.entries.iter().map(|e| e.label.len()).max().unwrap_or(0);
        for entry in &self.entries {
            writeln!(f, "{:width$}  {}", entry.label, entry.status)?;
        }
        for open in &self.open {
            writeln!(f, "{:width$}  open requirement: {}", open.step, open.description)?;
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: &str, status: Status, millis: Option<u64>) -> Entry {
        Entry {
            label: label.to_string(),
            task: label.to_string(),
            bindings: Bindings::default(),
            status,
            duration: millis.map(Duration::from_millis),
        }
    }

    fn report() -> RunReport {
        RunReport {
            pipeline: "test".to_string(),
            entries: vec![
                entry("a", Status::Completed { cached: false }, Some(10)),
                entry("b", Status::Completed { cached: true }, Some(0)),
                entry("c", Status::Failed("exit 1".to_string()), Some(5)),
                entry(
                    "d",
                    Status::Skipped {
                        upstream: "c".to_string(),
                    },
                    None,
                ),
                entry("e", Status::Cancelled, None),
            ],
            edges: vec![(0, 1), (2, 3)],
            invocations: 2,
            open: vec![OpenRequirement {
                step: "min_mask".to_string(),
                description: "specification unknown".to_string(),
            }],
        }
    }

    #[test]
    fn counts_and_summary() {
        let report = report();
        assert_eq!(
            report.counts(),
            Counts {
                completed: 2,
                cached: 1,
                failed: 1,
                skipped: 1,
                cancelled: 1,
            }
        );
        assert!(!report.is_success());
        assert_eq!(
            report.summary(),
            "5 instance(s): 2 completed (1 cached), 1 failed, 1 skipped, 1 cancelled; 2 invocation(s)"
        );
    }

    #[test]
    fn display_lists_every_instance() {
        let text = report().to_string();
        assert!(text.contains("d  skipped (upstream failure in c)"));
        assert!(text.contains("min_mask  open requirement: specification unknown"));
        assert_eq!(text.lines().count(), 7);
    }

    #[test]
    fn mermaid_colours_states() {
        let text = report().render_mermaid();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("style 0 fill:#00FF00"));
        assert!(text.contains("style 1 fill:#ADD8E6"));
        assert!(text.contains("style 2 fill:#FFFFFF,stroke:#FF0000"));
        assert!(text.contains("2 --> 3"));
    }

    #[test]
    fn gradient_endpoints() {
        assert_eq!(gradient(0.0), "#00FF00");
        assert_eq!(gradient(0.5), "#FFFF00");
        assert_eq!(gradient(1.0), "#FF0000");
    }
}
