//! Typed error hierarchy for the grading pipeline.
//!
//! `CheckerError` covers failures that callers need to tell apart: missing
//! catalogue entries (discipline, homework, lab), stored JSON that no longer
//! decodes, sandbox build/run problems and unreadable container output.
//! Everything else travels as `Other`.

use thiserror::Error;

/// Errors from the checker subsystem.
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("Discipline {id} not found")]
    DisciplineNotFound { id: i64 },

    #[error("No homework record for student {student_id} in discipline {discipline_id}")]
    HomeworkNotFound { student_id: i64, discipline_id: i64 },

    #[error("Lab {lab} is not part of the homework record")]
    LabNotFound { lab: u32 },

    #[error("Discipline {id} is misconfigured: {message}")]
    InvalidDiscipline { id: i64, message: String },

    #[error("Sandbox image build failed for {tag}: {message}")]
    SandboxBuild { tag: String, message: String },

    #[error("Sandbox container failed for {tag}: {message}")]
    SandboxRun { tag: String, message: String },

    #[error("Sandbox {stage} exceeded time limit ({seconds}s)")]
    SandboxTimeout { stage: &'static str, seconds: u64 },

    #[error("Malformed sandbox report: {0}")]
    ReportParse(String),

    #[error("Corrupt {what}")]
    CorruptRecord {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CheckerError {
    /// Whether the error belongs to the sandbox stage (build, run, timeout or
    /// unreadable output). Such failures abandon one submission only.
    pub fn is_sandbox_failure(&self) -> bool {
        matches!(
            self,
            Self::SandboxBuild { .. }
                | Self::SandboxRun { .. }
                | Self::SandboxTimeout { .. }
                | Self::ReportParse(_)
        )
    }
}
