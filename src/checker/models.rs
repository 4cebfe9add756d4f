use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── Queues ────────────────────────────────────────────────────────────

/// The three persisted queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Submissions waiting to be graded.
    Inbound,
    /// Finished test results waiting for delivery.
    Outbound,
    /// Submissions (or parts of them) refused before or during execution.
    Rejected,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [Self::Inbound, Self::Outbound, Self::Rejected];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Rejected => "rejected",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Inbound => "queue_in",
            Self::Outbound => "queue_out",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid queue: {}", s)),
        }
    }
}

/// A row of any queue. `data` holds the JSON payload for that queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueRecord {
    pub id: i64,
    pub submitter_id: i64,
    pub channel_id: i64,
    pub data: String,
}

impl QueueRecord {
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.data)
            .with_context(|| format!("Failed to decode payload of queue record {}", self.id))
    }
}

/// Inbound payload: what a student uploaded for one lab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    #[serde(alias = "disciplineId")]
    pub discipline_id: i64,
    #[serde(alias = "labNumber")]
    pub lab_number: u32,
    #[serde(alias = "filesPath")]
    pub files_path: Vec<String>,
}

/// One task line of an Outbound result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: u32,
    pub file_name: String,
    #[serde(default)]
    pub description: BTreeSet<String>,
}

/// Outbound payload: the graded outcome of one submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub discipline_id: i64,
    pub lab_number: u32,
    #[serde(default)]
    pub successful_task: Vec<TaskResult>,
    #[serde(default)]
    pub failed_task: Vec<TaskResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectedType {
    /// The file name does not correspond to any available test.
    TemplateMismatch,
    /// The code uses forbidden constructs or misses required ones.
    PolicyViolation,
    /// The sandbox could not build, run or report on the files.
    SandboxFailure,
}

impl RejectedType {
    pub fn description(&self) -> &'static str {
        match self {
            Self::TemplateMismatch => "File name does not match any test template",
            Self::PolicyViolation => {
                "File uses forbidden keywords or misses the ones required for the task"
            }
            Self::SandboxFailure => "Testing could not be completed, please resubmit later",
        }
    }
}

/// Rejected payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedFiles {
    #[serde(rename = "type")]
    pub kind: RejectedType,
    pub description: String,
    pub files: Vec<String>,
}

impl RejectedFiles {
    pub fn new(kind: RejectedType, files: Vec<String>) -> Self {
        Self {
            kind,
            description: kind.description().to_string(),
            files,
        }
    }
}

// ── Disciplines ───────────────────────────────────────────────────────

/// One lab (homework) as configured for a discipline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Work {
    pub number: u32,
    pub amount_tasks: u32,
    pub deadline: NaiveDate,
}

/// Discipline as described in a disciplines config file, before it gets an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisciplineConfig {
    pub full_name: String,
    pub short_name: String,
    pub path_to_test: String,
    pub path_to_answer: String,
    #[serde(default = "default_language")]
    pub language: String,
    pub works: Vec<Work>,
}

fn default_language() -> String {
    "python".to_string()
}

impl DisciplineConfig {
    /// Total number of tasks across all works.
    pub fn max_tasks(&self) -> u32 {
        self.works.iter().map(|w| w.amount_tasks).sum()
    }

    pub fn max_home_works(&self) -> u32 {
        self.works.len() as u32
    }
}

/// Top-level shape of a disciplines config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisciplinesConfig {
    pub disciplines: Vec<DisciplineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Discipline {
    pub id: i64,
    pub full_name: String,
    pub short_name: String,
    pub path_to_test: String,
    pub path_to_answer: String,
    pub language: String,
    pub max_tasks: u32,
    pub max_home_works: u32,
    pub works: Vec<Work>,
}

// ── Homework state ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HomeTask {
    pub number: u32,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default, alias = "amount_tries")]
    pub tries: u32,
    #[serde(default)]
    pub last_try_time: Option<NaiveDateTime>,
}

/// Grading state of one lab for one student.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lab {
    pub number: u32,
    pub deadline: NaiveDate,
    pub tasks: Vec<HomeTask>,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub end_time: Option<NaiveDateTime>,
}

impl Lab {
    /// Fresh lab state with tasks numbered `1..=amount_tasks`.
    pub fn from_work(work: &Work) -> Self {
        Self {
            number: work.number,
            deadline: work.deadline,
            tasks: (1..=work.amount_tasks)
                .map(|number| HomeTask {
                    number,
                    is_done: false,
                    tries: 0,
                    last_try_time: None,
                })
                .collect(),
            is_done: false,
            tasks_completed: 0,
            end_time: None,
        }
    }
}

/// Cumulative homework record of a student in one discipline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HomeworkRecord {
    pub student_id: i64,
    pub discipline_id: i64,
    pub points: f64,
    pub labs: Vec<Lab>,
}

impl HomeworkRecord {
    pub fn new(student_id: i64, discipline: &Discipline) -> Self {
        Self {
            student_id,
            discipline_id: discipline.id,
            points: 0.0,
            labs: discipline.works.iter().map(Lab::from_work).collect(),
        }
    }

    pub fn lab(&self, number: u32) -> Option<&Lab> {
        self.labs.iter().find(|l| l.number == number)
    }
}

// ── Sandbox report ────────────────────────────────────────────────────

/// Correlation descriptor written next to the staged files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogInit {
    pub student_id: i64,
    pub lab_id: u32,
    pub run_time: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReport {
    pub task_id: u32,
    pub time: NaiveDateTime,
    pub status: bool,
    #[serde(default)]
    pub description: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxReport {
    pub lab_id: u32,
    #[serde(default)]
    pub tasks: Vec<TaskReport>,
}

/// Number that closes an answer or test file name: `lab2-3.py` → 3,
/// `test_lab2-3.py` → 3, `lab_7.py` → 7.
pub fn task_number(file_name: &str) -> Option<u32> {
    let stem = file_name.split('.').next()?;
    stem.rsplit(['-', '_']).next()?.parse().ok()
}
