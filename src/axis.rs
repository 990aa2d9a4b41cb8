//! Iteration axes and the axis values bound to a task instance.

use std::fmt::{self, Display};

/// A named identifier set over which a sub-graph is replicated, for example
/// subject or session identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Axis {
    name: String,
    values: Vec<String>,
}

impl Axis {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// Axis values bound to one task instance, in axis declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bindings(Vec<(String, String)>);

impl Bindings {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when both bindings agree on every axis they share.
    pub(crate) fn agrees_with(&self, other: &Bindings) -> bool {
        self.iter()
            .all(|(axis, value)| other.get(axis).is_none_or(|v| v == value))
    }

    /// Directory name scoping everything one instance writes, e.g.
    /// `_subject_id_sub-01_session_id_ses-01`.
    pub fn scope_dir(&self) -> String {
        if self.0.is_empty() {
            return "_global".to_string();
        }

        let mut out = String::new();
        for (axis, value) in &self.0 {
            out.push('_');
            out.push_str(&sanitize(axis));
            out.push('_');
            out.push_str(&sanitize(value));
        }
        out
    }
}

impl Display for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (axis, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{axis}={value}")?;
        }
        Ok(())
    }
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

/// Cartesian product of the axes, first axis outermost. With no axes there is
/// exactly one, empty, combination.
pub(crate) fn product(axes: &[&Axis]) -> Vec<Bindings> {
    let mut acc = vec![Bindings::default()];

    for axis in axes {
        let mut next = Vec::with_capacity(acc.len() * axis.values.len());
        for bindings in &acc {
            for value in &axis.values {
                let mut pairs = bindings.0.clone();
                pairs.push((axis.name.clone(), value.clone()));
                next.push(Bindings(pairs));
            }
        }
        acc = next;
    }

    acc
}
