//! Values flowing through task slots.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};

/// A value bound to a task slot: a literal, a resolved file, or a list of
/// either.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(f64),
    Path(Utf8PathBuf),
    List(Vec<Value>),
}

impl Value {
    pub fn as_path(&self) -> Option<&Utf8Path> {
        match self {
            Value::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Path(path) => Some(path.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Every path contained in this value, depth first.
    pub fn paths(&self) -> Vec<&Utf8Path> {
        match self {
            Value::Path(path) => vec![path.as_path()],
            Value::List(items) => items.iter().flat_map(Value::paths).collect(),
            _ => vec![],
        }
    }

    /// Splits the value into command line arguments, lists are flattened.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Value::List(items) => items.iter().flat_map(Value::to_args).collect(),
            other => vec![other.to_string()],
        }
    }

    /// Items of a list, or the value itself as the only item.
    pub(crate) fn items(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => f.write_str(text),
            Value::Number(n) => write!(f, "{n}"),
            Value::Path(path) => f.write_str(path.as_str()),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<Utf8PathBuf> for Value {
    fn from(value: Utf8PathBuf) -> Self {
        Value::Path(value)
    }
}

impl From<&Utf8Path> for Value {
    fn from(value: &Utf8Path) -> Self {
        Value::Path(value.to_path_buf())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

/// Named slot values passed into and returned from a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slots(BTreeMap<String, Value>);

impl Slots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> anyhow::Result<&Value> {
        self.0
            .get(name)
            .ok_or_else(|| anyhow!("slot '{name}' is not bound"))
    }

    pub fn path(&self, name: &str) -> anyhow::Result<&Utf8Path> {
        self.get(name)?
            .as_path()
            .ok_or_else(|| anyhow!("slot '{name}' does not hold a path"))
    }

    pub fn number(&self, name: &str) -> anyhow::Result<f64> {
        self.get(name)?
            .as_number()
            .ok_or_else(|| anyhow!("slot '{name}' does not hold a number"))
    }

    pub fn text(&self, name: &str) -> anyhow::Result<&str> {
        self.get(name)?
            .as_text()
            .ok_or_else(|| anyhow!("slot '{name}' does not hold text"))
    }

    pub fn list(&self, name: &str) -> anyhow::Result<&[Value]> {
        self.get(name)?
            .as_list()
            .ok_or_else(|| anyhow!("slot '{name}' does not hold a list"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Slots {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Slots(iter.into_iter().collect())
    }
}
