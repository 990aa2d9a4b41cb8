use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern, glob_with};

use crate::axis::Bindings;
use crate::error::{SelectError, TemplateError};
use crate::template::Template;
use crate::value::Value;

/// How many files a selector must resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one file, bound as a single path.
    One,
    /// A bounded number of files, bound as a sorted list of paths.
    Many { min: usize, max: Option<usize> },
}

impl Cardinality {
    fn accepts(&self, found: usize) -> bool {
        match *self {
            Cardinality::One => found == 1,
            Cardinality::Many { min, max } => found >= min && max.is_none_or(|max| found <= max),
        }
    }

    fn describe(&self) -> String {
        match *self {
            Cardinality::One => "exactly 1".to_string(),
            Cardinality::Many { min, max: None } => format!("at least {min}"),
            Cardinality::Many { min, max: Some(max) } if min == max => format!("exactly {min}"),
            Cardinality::Many { min, max: Some(max) } => format!("between {min} and {max}"),
        }
    }
}

/// A templated path pattern. Placeholders are bound to axis values and the
/// result is globbed relative to a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSelector {
    template: Template,
    cardinality: Cardinality,
}

impl FileSelector {
    /// Selector that must match exactly one file.
    pub fn one(pattern: impl Into<String>) -> Result<Self, TemplateError> {
        Ok(Self {
            template: Template::parse(pattern)?,
            cardinality: Cardinality::One,
        })
    }

    /// Selector that must match at least one file.
    pub fn many(pattern: impl Into<String>) -> Result<Self, TemplateError> {
        Ok(Self {
            template: Template::parse(pattern)?,
            cardinality: Cardinality::Many { min: 1, max: None },
        })
    }

    /// Narrows a list selector to between `min` and `max` matches.
    pub fn between(mut self, min: usize, max: Option<usize>) -> Self {
        self.cardinality = Cardinality::Many { min, max };
        self
    }

    pub fn pattern(&self) -> &str {
        self.template.as_str()
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// Binds the axis values, globs against `base` and checks the number of
    /// matches.
    pub fn resolve(&self, base: &Utf8Path, bindings: &Bindings) -> Result<Value, SelectError> {
        let relative = self
            .template
            .render(|name| bindings.get(name).map(Value::from))?;

        let pattern = if Utf8Path::new(&relative).is_absolute() {
            relative
        } else {
            format!("{}/{}", Pattern::escape(base.as_str()), relative)
        };

        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let mut paths = Vec::new();
        for path in glob_with(&pattern, options)? {
            paths.push(Utf8PathBuf::try_from(path?)?);
        }
        paths.sort();

        if !self.cardinality.accepts(paths.len()) {
            return Err(SelectError::Count {
                pattern,
                found: paths.len(),
                expected: self.cardinality.describe(),
            });
        }

        Ok(match self.cardinality {
            Cardinality::One => Value::Path(paths.remove(0)),
            Cardinality::Many { .. } => Value::List(paths.into_iter().map(Value::Path).collect()),
        })
    }
}
