//! Placeholder templates shared by file selectors, output names and command
//! arguments.
//!
//! A template is plain text with `{name}` placeholders. A placeholder may
//! carry a filter, `{name:stem}` yields the file name of a path value with
//! its (possibly double, like `.nii.gz`) extension removed, `{name:name}`
//! yields the bare file name.

use camino::Utf8Path;

use crate::error::TemplateError;
use crate::value::Value;

/// Extensions treated as a single unit when taking a stem.
const DOUBLE_EXTENSIONS: &[&str] = &[".nii.gz", ".tar.gz"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filter {
    Stem,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Lit(String),
    Var { name: String, filter: Option<Filter> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(raw: impl Into<String>) -> Result<Self, TemplateError> {
        let raw = raw.into();
        let mut parts = Vec::new();
        let mut rest = raw.as_str();

        while let Some(start) = rest.find('{') {
            if start > 0 {
                parts.push(Part::Lit(rest[..start].to_string()));
            }

            let after = &rest[start + 1..];
            let end = after
                .find('}')
                .ok_or_else(|| TemplateError::Unterminated(raw.clone()))?;

            let inner = after[..end].trim();
            if inner.is_empty() {
                return Err(TemplateError::Empty(raw.clone()));
            }

            let (name, filter) = match inner.split_once(':') {
                Some((name, "stem")) => (name, Some(Filter::Stem)),
                Some((name, "name")) => (name, Some(Filter::Name)),
                Some((_, other)) => {
                    return Err(TemplateError::Filter {
                        template: raw.clone(),
                        filter: other.to_string(),
                    });
                }
                None => (inner, None),
            };

            parts.push(Part::Var {
                name: name.to_string(),
                filter,
            });

            rest = &after[end + 1..];
        }

        if !rest.is_empty() {
            parts.push(Part::Lit(rest.to_string()));
        }

        Ok(Self { raw, parts })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of every placeholder, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::Var { name, .. } => Some(name.as_str()),
            Part::Lit(_) => None,
        })
    }

    /// Substitutes every placeholder using `lookup`.
    pub fn render<F>(&self, lookup: F) -> Result<String, TemplateError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        let mut out = String::with_capacity(self.raw.len());

        for part in &self.parts {
            match part {
                Part::Lit(text) => out.push_str(text),
                Part::Var { name, filter } => {
                    let value = lookup(name).ok_or_else(|| TemplateError::Unbound {
                        template: self.raw.clone(),
                        name: name.clone(),
                    })?;

                    let text = value.to_string();
                    match filter {
                        None => out.push_str(&text),
                        Some(Filter::Stem) => out.push_str(&stem(Utf8Path::new(&text))),
                        Some(Filter::Name) => {
                            out.push_str(Utf8Path::new(&text).file_name().unwrap_or(&text))
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}

/// File name without its extension, where `.nii.gz` counts as one extension.
pub fn stem(path: &Utf8Path) -> String {
    let name = path.file_name().unwrap_or(path.as_str());

    for ext in DOUBLE_EXTENSIONS {
        if let Some(stripped) = name.strip_suffix(ext) {
            return stripped.to_string();
        }
    }

    path.file_stem().unwrap_or(name).to_string()
}
