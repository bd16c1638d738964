use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::codec::diagnostic::DiagnosticReport;

/// Where a change to the project came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventOrigin {
    /// Unsaved text pushed by an editor session.
    Editor,
    /// A change observed on disk by the file watcher.
    #[default]
    Watcher,
    /// A full batch compile.
    Batch,
}

/// What the language service reports to its subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileEvent {
    /// A file went through Scan and Link.
    FileStaged(PathBuf, EventOrigin),
    /// A file left the project.
    FileRemoved(PathBuf, EventOrigin),
    /// `weave.toml` changed and the whole project was recompiled.
    ProjectReloaded(DiagnosticReport),
    /// Result of a project-wide validation that was still current when it finished.
    Published {
        generation: u64,
        diagnostics: DiagnosticReport,
    },
    /// A scheduled validation that was superseded by a newer edit.
    Discarded { generation: u64 },
}

impl CompileEvent {
    /// Returns the EventOrigin of this event, or None for project-wide events
    pub fn origin(&self) -> Option<EventOrigin> {
        match self {
            CompileEvent::FileStaged(_, origin) => Some(*origin),
            CompileEvent::FileRemoved(_, origin) => Some(*origin),
            CompileEvent::ProjectReloaded(_) => Some(EventOrigin::Batch),
            CompileEvent::Published { .. } => None,
            CompileEvent::Discarded { .. } => None,
        }
    }

    pub fn diagnostics(&self) -> Option<&DiagnosticReport> {
        match self {
            CompileEvent::ProjectReloaded(diagnostics) => Some(diagnostics),
            CompileEvent::Published { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

impl Display for CompileEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CompileEvent::FileStaged(path, _) => write!(f, "FileStaged({})", path.display()),
            CompileEvent::FileRemoved(path, _) => write!(f, "FileRemoved({})", path.display()),
            CompileEvent::ProjectReloaded(_) => write!(f, "ProjectReloaded"),
            CompileEvent::Published { generation, .. } => write!(f, "Published({generation})"),
            CompileEvent::Discarded { generation } => write!(f, "Discarded({generation})"),
        }
    }
}
