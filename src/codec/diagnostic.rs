//! Diagnostics produced by every compilation stage.
//!
//! Stages never abort on a problem in user content. They attach a [`Diagnostic`] to
//! the offending file, block or entity and keep going, so a single run reports every
//! independent problem. Codes follow `E<stage><category><nn>`:
//!
//! | Range  | Stage    |
//! |--------|----------|
//! | E01xx  | Scan     |
//! | E02xx  | Link     |
//! | E03xx  | Validate |
//! | E04xx  | Spec     |
//! | E09xx  | System   |
//!
//! Any [`Severity::Error`] diagnostic fails a build; the other severities never do.

use std::{collections::BTreeMap, fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::properties::SourceLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Hint => "hint",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Scan,
    Link,
    Validate,
    Spec,
    System,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Scan => "scan",
            Stage::Link => "link",
            Stage::Validate => "validate",
            Stage::Spec => "spec",
            Stage::System => "system",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    /// Block body could not be parsed
    E0101,
    /// Block placed where its kind is not allowed
    E0102,
    /// List of lists in an entity body
    E0103,
    /// File could not be read
    E0104,
    /// Malformed block signature
    E0105,
    /// Schema definition rejected by the schema engine
    E0221,
    /// Configuration block failed to execute
    E0222,
    /// Configuration produced a warning
    E0224,
    /// Schema name does not match its handle
    E0231,
    /// Schema declares a reserved field
    E0232,
    /// Duplicate logical id
    E0241,
    /// Duplicate handle in one scope
    E0242,
    /// Reference not found
    E0341,
    /// Circular dependency
    E0342,
    /// Evolution target not found
    E0343,
    /// Ambiguous reference
    E0344,
    /// Evolution fork
    E0345,
    /// Malformed reference query
    E0346,
    /// Schema or field type mismatch, or validator failure
    E0361,
    /// Reference target has the wrong schema
    E0362,
    /// `id` given in a body instead of the signature
    E0363,
    /// Instance of an unknown schema
    E0364,
    /// Rule runner failure
    E0421,
    /// Rule target not found
    E0423,
    /// Assertion failed
    E0424,
    /// Internal error
    E0981,
    /// Filesystem error
    E0982,
    /// Project configuration error
    E0983,
}

impl DiagnosticCode {
    pub fn stage(&self) -> Stage {
        use DiagnosticCode::*;
        match self {
            E0101 | E0102 | E0103 | E0104 | E0105 => Stage::Scan,
            E0221 | E0222 | E0224 | E0231 | E0232 | E0241 | E0242 => Stage::Link,
            E0341 | E0342 | E0343 | E0344 | E0345 | E0346 | E0361 | E0362 | E0363 | E0364 => {
                Stage::Validate
            }
            E0421 | E0423 | E0424 => Stage::Spec,
            E0981 | E0982 | E0983 => Stage::System,
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            DiagnosticCode::E0103 | DiagnosticCode::E0224 => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use DiagnosticCode::*;
        match self {
            E0101 => "E0101",
            E0102 => "E0102",
            E0103 => "E0103",
            E0104 => "E0104",
            E0105 => "E0105",
            E0221 => "E0221",
            E0222 => "E0222",
            E0224 => "E0224",
            E0231 => "E0231",
            E0232 => "E0232",
            E0241 => "E0241",
            E0242 => "E0242",
            E0341 => "E0341",
            E0342 => "E0342",
            E0343 => "E0343",
            E0344 => "E0344",
            E0345 => "E0345",
            E0346 => "E0346",
            E0361 => "E0361",
            E0362 => "E0362",
            E0363 => "E0363",
            E0364 => "E0364",
            E0421 => "E0421",
            E0423 => "E0423",
            E0424 => "E0424",
            E0981 => "E0981",
            E0982 => "E0982",
            E0983 => "E0983",
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A problem (or note) about user content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub severity: Severity,
    pub stage: Stage,
    pub location: Option<SourceLocation>,
    pub message: String,
    pub details: BTreeMap<String, String>,
}

impl Diagnostic {
    /// Diagnostic with the code's default stage and severity.
    pub fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Diagnostic {
            code,
            severity: code.default_severity(),
            stage: code.stage(),
            location: None,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn path(&self) -> Option<&Path> {
        self.location.as_ref().map(|l| l.path.as_path())
    }

    fn sort_key(&self) -> (Option<&SourceLocation>, DiagnosticCode, &str) {
        (self.location.as_ref(), self.code, self.message.as_str())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(location) = &self.location {
            write!(f, "{location}: ")?;
        }
        write!(f, "{}[{}]: {}", self.severity, self.code, self.message)
    }
}

/// An ordered collection of diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn by_code(&self, code: DiagnosticCode) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| d.code == code).collect()
    }

    pub fn by_stage(&self, stage: Stage) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| d.stage == stage).collect()
    }

    pub fn by_severity(&self, severity: Severity) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .collect()
    }

    pub fn for_path(&self, path: &Path) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.path() == Some(path))
            .collect()
    }

    /// Order by location, then code, then message. Diagnostics without a location
    /// come first.
    pub fn sort(&mut self) {
        self.diagnostics.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

impl Extend<Diagnostic> for DiagnosticReport {
    fn extend<T: IntoIterator<Item = Diagnostic>>(&mut self, iter: T) {
        self.diagnostics.extend(iter);
    }
}

impl FromIterator<Diagnostic> for DiagnosticReport {
    fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
        DiagnosticReport {
            diagnostics: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for DiagnosticReport {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.into_iter()
    }
}

impl<'a> IntoIterator for &'a DiagnosticReport {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.iter()
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for diagnostic in &self.diagnostics {
            writeln!(f, "{diagnostic}")?;
        }
        let errors = self.errors().count();
        write!(
            f,
            "{} error(s), {} other diagnostic(s)",
            errors,
            self.diagnostics.len() - errors
        )
    }
}
