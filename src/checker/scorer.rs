//! Folds a sandbox report into a student's homework record.

use chrono::NaiveDateTime;
use serde::Serialize;

use super::db::DbHandle;
use super::models::{HomeworkRecord, SandboxReport};
use crate::errors::CheckerError;

/// Late completions earn this share of the lab's points.
pub const LATE_PENALTY_FACTOR: f64 = 0.5;

/// What applying one report changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreOutcome {
    pub lab_number: u32,
    pub tasks_completed: u32,
    /// True only on the run that moved the lab to done.
    pub newly_completed: bool,
    pub late: bool,
    pub points_awarded: f64,
}

/// Apply `report` to the lab it names. Other labs are never touched and a
/// lab that is already done is never scored again.
pub fn apply_report(
    record: &mut HomeworkRecord,
    report: &SandboxReport,
    max_tasks: u32,
    now: NaiveDateTime,
) -> Result<ScoreOutcome, CheckerError> {
    if max_tasks == 0 {
        return Err(CheckerError::InvalidDiscipline {
            id: record.discipline_id,
            message: "max_tasks is zero".to_string(),
        });
    }
    let lab = record
        .labs
        .iter_mut()
        .find(|l| l.number == report.lab_id)
        .ok_or(CheckerError::LabNotFound { lab: report.lab_id })?;

    for task in lab.tasks.iter_mut() {
        for result in report.tasks.iter().filter(|r| r.task_id == task.number) {
            task.tries += 1;
            task.last_try_time = Some(result.time);
            if !task.is_done && result.status {
                task.is_done = true;
            }
        }
    }

    let done = lab.tasks.iter().filter(|t| t.is_done).count() as u32;
    // Tasks never leave the done state, so this only guards against
    // hand-edited records.
    lab.tasks_completed = lab.tasks_completed.max(done);

    let mut outcome = ScoreOutcome {
        lab_number: lab.number,
        tasks_completed: lab.tasks_completed,
        newly_completed: false,
        late: false,
        points_awarded: 0.0,
    };

    if lab.tasks_completed as usize == lab.tasks.len() && !lab.is_done {
        lab.is_done = true;
        lab.end_time = Some(now);
        outcome.newly_completed = true;
        outcome.late = now.date() > lab.deadline;

        let mut points = lab.tasks_completed as f64 * (100.0 / max_tasks as f64);
        if outcome.late {
            points *= LATE_PENALTY_FACTOR;
        }
        outcome.points_awarded = points;
        record.points += points;
    }

    Ok(outcome)
}

/// Score a report against the stored homework record of `student_id`.
/// The read-modify-write happens in a single database transaction.
pub async fn score_submission(
    db: &DbHandle,
    student_id: i64,
    discipline_id: i64,
    report: SandboxReport,
) -> anyhow::Result<ScoreOutcome> {
    db.call(move |db| {
        let discipline = db
            .get_discipline(discipline_id)?
            .ok_or(CheckerError::DisciplineNotFound { id: discipline_id })?;
        let now = chrono::Local::now().naive_local();
        db.update_homework(student_id, discipline_id, |record| {
            Ok(apply_report(record, &report, discipline.max_tasks, now)?)
        })
    })
    .await
}
