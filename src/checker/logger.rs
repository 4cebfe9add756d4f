//! Per-task accumulation of harness events into a `SandboxReport`.
//!
//! The in-container harness prints one JSON line per observation and a final
//! `finish` line. [`parse_report`] replays those lines into a fresh
//! [`ReportLogger`], so each run starts from an empty accumulator.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::models::{LogInit, SandboxReport, TaskReport};
use crate::errors::CheckerError;

/// One line of harness output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarnessEvent {
    Task {
        task_id: u32,
        status: bool,
        #[serde(default)]
        description: Option<String>,
    },
    Finish {
        exit_status: i32,
    },
}

#[derive(Debug, Clone)]
struct TaskState {
    status: bool,
    description: BTreeSet<String>,
}

/// Accumulates task outcomes for one lab run.
///
/// The first observation of a task fixes its initial status. A successful
/// task is never downgraded by a later failure; a failing task keeps every
/// distinct reason it was given.
#[derive(Debug, Clone)]
pub struct ReportLogger {
    lab_id: u32,
    run_time: NaiveDateTime,
    tasks: BTreeMap<u32, TaskState>,
    exit_status: Option<i32>,
}

impl ReportLogger {
    pub fn new(init: &LogInit) -> Self {
        Self {
            lab_id: init.lab_id,
            run_time: init.run_time,
            tasks: BTreeMap::new(),
            exit_status: None,
        }
    }

    pub fn record_success(&mut self, task_id: u32) {
        self.tasks.entry(task_id).or_insert_with(|| TaskState {
            status: true,
            description: BTreeSet::new(),
        });
    }

    pub fn record_failure(&mut self, task_id: u32, reason: Option<String>) {
        let state = self.tasks.entry(task_id).or_insert_with(|| TaskState {
            status: false,
            description: BTreeSet::new(),
        });
        if state.status {
            return;
        }
        if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
            state.description.insert(reason);
        }
    }

    pub fn apply(&mut self, event: HarnessEvent) {
        match event {
            HarnessEvent::Task {
                task_id,
                status: true,
                ..
            } => self.record_success(task_id),
            HarnessEvent::Task {
                task_id,
                status: false,
                description,
            } => self.record_failure(task_id, description),
            HarnessEvent::Finish { exit_status } => self.exit_status = Some(exit_status),
        }
    }

    /// Exit status of the test session, once the harness reported its end.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn finish(self) -> SandboxReport {
        let time = self.run_time;
        SandboxReport {
            lab_id: self.lab_id,
            tasks: self
                .tasks
                .into_iter()
                .map(|(task_id, state)| TaskReport {
                    task_id,
                    time,
                    status: state.status,
                    description: state.description,
                })
                .collect(),
        }
    }
}

/// Turn raw container output into a report.
///
/// Output that is a complete `SandboxReport` document is taken as is.
/// Otherwise every line starting with `{` must be a harness event and the
/// stream must contain a `finish` event; anything else is noise from the
/// test framework and is skipped.
pub fn parse_report(raw: &str, init: &LogInit) -> Result<SandboxReport, CheckerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CheckerError::ReportParse("container produced no output".into()));
    }
    if let Ok(report) = serde_json::from_str::<SandboxReport>(trimmed) {
        return Ok(report);
    }

    let mut logger = ReportLogger::new(init);
    for (index, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let event: HarnessEvent = serde_json::from_str(line).map_err(|e| {
            CheckerError::ReportParse(format!("line {}: {} ({})", index + 1, e, line))
        })?;
        logger.apply(event);
    }

    let Some(exit_status) = logger.exit_status() else {
        return Err(CheckerError::ReportParse(
            "harness output ended without a finish event".into(),
        ));
    };
    tracing::debug!(lab = init.lab_id, exit_status, "harness finished");
    Ok(logger.finish())
}
