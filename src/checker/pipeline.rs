use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::db::DbHandle;
use super::models::{
    Discipline, QueueKind, QueueRecord, RejectedFiles, RejectedType, SandboxReport, Submission,
    TaskResult, TestResult, task_number,
};
use super::policy::{PolicyEngine, PolicyOutcome};
use super::sandbox::Sandbox;
use super::scorer::{ScoreOutcome, score_submission};
use super::stager::{StageOutcome, SubmissionStager};
use crate::errors::CheckerError;

/// Description attached to a submitted task the harness never reported on.
pub const NO_RESULT_DESCRIPTION: &str = "No test result was reported for this task";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub keep_staging: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(1000),
            keep_staging: false,
        }
    }
}

/// How a claimed Inbound record ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// The sandbox ran and the result was published. `score` is `None` when
    /// the student has no homework record to fold it into.
    Graded {
        result: TestResult,
        score: Option<ScoreOutcome>,
    },
    /// Every submitted file was rejected before execution.
    NothingToTest,
    /// The record could not be processed; see the logs.
    Abandoned,
}

/// Bounded pool of grading workers draining the Inbound queue.
pub struct Orchestrator {
    db: DbHandle,
    stager: SubmissionStager,
    sandbox: Sandbox,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        stager: SubmissionStager,
        sandbox: Sandbox,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            db,
            stager,
            sandbox,
            settings,
        }
    }

    /// Run the workers until `shutdown` turns true or a storage failure
    /// stops one of them. Records already claimed are always finished.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (halt_tx, halt_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        for worker in 0..self.settings.workers.max(1) {
            let this = Arc::clone(&self);
            let halt = halt_rx.clone();
            workers.spawn(async move { this.worker_loop(worker, halt).await });
        }
        tracing::info!(workers = workers.len(), "orchestrator started");

        let mut halted = false;
        let mut failure: Option<anyhow::Error> = None;
        loop {
            tokio::select! {
                changed = shutdown.changed(), if !halted => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("shutdown requested, draining workers");
                        halted = true;
                        halt_tx.send_replace(true);
                    }
                }
                joined = workers.join_next() => {
                    let Some(joined) = joined else { break };
                    let err = match joined {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => e,
                        Err(e) => anyhow::Error::new(e).context("Worker task panicked"),
                    };
                    tracing::error!(error = %format!("{:#}", err), "worker stopped");
                    if failure.is_none() {
                        failure = Some(err);
                    }
                    halted = true;
                    halt_tx.send_replace(true);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                tracing::info!("orchestrator stopped");
                Ok(())
            }
        }
    }

    async fn worker_loop(&self, worker: usize, mut halt: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *halt.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = halt.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
            }

            let Some(record) = self.claim().await? else {
                continue;
            };
            let record_id = record.id;
            let disposition = self
                .process_record(record)
                .await
                .with_context(|| format!("Worker {} failed on record {}", worker, record_id))?;
            tracing::info!(worker, record_id, outcome = disposition.label(), "record processed");
        }
    }

    /// Claim the oldest Inbound record, if any.
    pub async fn claim(&self) -> Result<Option<QueueRecord>> {
        self.db
            .call(|db| db.claim_oldest(QueueKind::Inbound))
            .await
    }

    /// Take one claimed Inbound record through staging, policy, sandbox and
    /// scoring. Problems confined to the record become a `Disposition`;
    /// only storage failures are returned as errors.
    pub async fn process_record(&self, record: QueueRecord) -> Result<Disposition> {
        let submission: Submission = match record.payload() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(record_id = record.id, error = %format!("{:#}", e), "undecodable submission");
                return Ok(Disposition::Abandoned);
            }
        };
        let submitted = file_names(&submission.files_path);

        let discipline_id = submission.discipline_id;
        let discipline = match self
            .db
            .call(move |db| db.get_discipline(discipline_id))
            .await
        {
            Ok(discipline) => discipline,
            Err(e) if is_record_error(&e) => {
                tracing::error!(
                    record_id = record.id,
                    discipline_id,
                    error = %format!("{:#}", e),
                    "unreadable discipline"
                );
                self.reject(&record, RejectedType::SandboxFailure, submitted)
                    .await?;
                return Ok(Disposition::Abandoned);
            }
            Err(e) => return Err(e),
        };
        let Some(discipline) = discipline else {
            tracing::warn!(record_id = record.id, discipline_id, "submission for unknown discipline");
            self.reject(&record, RejectedType::SandboxFailure, submitted)
                .await?;
            return Ok(Disposition::Abandoned);
        };

        let stage = match self.stage(&record, &discipline, &submission).await {
            Ok(stage) => stage,
            Err(e) => {
                tracing::error!(record_id = record.id, error = %format!("{:#}", e), "staging failed");
                self.reject(&record, RejectedType::SandboxFailure, submitted)
                    .await?;
                return Ok(Disposition::Abandoned);
            }
        };

        let result = self
            .screen_and_test(&record, &submission, &stage)
            .await;
        self.cleanup(&stage.staging_dir).await;
        result
    }

    async fn screen_and_test(
        &self,
        record: &QueueRecord,
        submission: &Submission,
        stage: &StageOutcome,
    ) -> Result<Disposition> {
        if stage.has_rejected() {
            self.reject(record, RejectedType::TemplateMismatch, stage.rejected.clone())
                .await?;
        }
        if !stage.has_file_for_test() {
            return Ok(Disposition::NothingToTest);
        }

        let policy = match run_policy(&stage.staging_dir).await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::error!(record_id = record.id, error = %format!("{:#}", e), "policy check failed");
                self.reject(record, RejectedType::SandboxFailure, stage.staged_answers.clone())
                    .await?;
                return Ok(Disposition::Abandoned);
            }
        };
        if policy.has_rejected_files() {
            self.reject(record, RejectedType::PolicyViolation, policy.rejected.clone())
                .await?;
        }
        if !policy.has_file_for_test() {
            return Ok(Disposition::NothingToTest);
        }

        let report = match self
            .sandbox
            .run(&stage.staging_dir, record.submitter_id, submission.lab_number)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(
                    record_id = record.id,
                    student_id = record.submitter_id,
                    lab = submission.lab_number,
                    sandbox_failure = e.is_sandbox_failure(),
                    error = %e,
                    "sandbox run failed"
                );
                self.reject(record, RejectedType::SandboxFailure, policy.remaining.clone())
                    .await?;
                return Ok(Disposition::Abandoned);
            }
        };

        let score = match score_submission(
            &self.db,
            record.submitter_id,
            submission.discipline_id,
            report.clone(),
        )
        .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) if is_record_error(&e) => {
                tracing::warn!(
                    record_id = record.id,
                    student_id = record.submitter_id,
                    error = %format!("{:#}", e),
                    "result not scored"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let result = build_result(submission, &policy, &report);
        let payload = result.clone();
        let (submitter, channel) = (record.submitter_id, record.channel_id);
        self.db
            .call(move |db| db.push_json(QueueKind::Outbound, submitter, channel, &payload))
            .await?;
        Ok(Disposition::Graded { result, score })
    }

    async fn stage(
        &self,
        record: &QueueRecord,
        discipline: &Discipline,
        submission: &Submission,
    ) -> Result<StageOutcome> {
        let stager = self.stager.clone();
        let (submitter, discipline, submission) =
            (record.submitter_id, discipline.clone(), submission.clone());
        let now = chrono::Local::now().naive_local();
        tokio::task::spawn_blocking(move || stager.stage(submitter, &discipline, &submission, now))
            .await
            .context("Staging task panicked")?
    }

    async fn reject(&self, record: &QueueRecord, kind: RejectedType, files: Vec<String>) -> Result<()> {
        let payload = RejectedFiles::new(kind, files);
        let (submitter, channel) = (record.submitter_id, record.channel_id);
        self.db
            .call(move |db| db.push_json(QueueKind::Rejected, submitter, channel, &payload))
            .await?;
        Ok(())
    }

    async fn cleanup(&self, staging_dir: &Path) {
        if self.settings.keep_staging {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(staging_dir).await {
            tracing::warn!(dir = %staging_dir.display(), error = %e, "failed to remove staging dir");
        }
    }
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Graded { .. } => "graded",
            Self::NothingToTest => "nothing_to_test",
            Self::Abandoned => "abandoned",
        }
    }
}

async fn run_policy(staging_dir: &Path) -> Result<PolicyOutcome> {
    let dir = staging_dir.to_path_buf();
    tokio::task::spawn_blocking(move || PolicyEngine::load(&dir)?.run())
        .await
        .context("Policy task panicked")?
}

/// Errors that concern one submission's catalogue data rather than storage.
fn is_record_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CheckerError>(),
        Some(
            CheckerError::HomeworkNotFound { .. }
                | CheckerError::LabNotFound { .. }
                | CheckerError::DisciplineNotFound { .. }
                | CheckerError::InvalidDiscipline { .. }
                | CheckerError::CorruptRecord { .. }
        )
    )
}

fn file_names(paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .map(|p| {
            Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| p.clone())
        })
        .collect()
}

/// Split a report into the Outbound payload. Tested files the report does
/// not mention are listed as failed.
fn build_result(submission: &Submission, policy: &PolicyOutcome, report: &SandboxReport) -> TestResult {
    let files: BTreeMap<u32, &String> = policy
        .remaining
        .iter()
        .filter_map(|name| task_number(name).map(|n| (n, name)))
        .collect();
    let file_name = |task_id: u32| {
        files
            .get(&task_id)
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("lab{}-{}.py", submission.lab_number, task_id))
    };

    let mut result = TestResult {
        discipline_id: submission.discipline_id,
        lab_number: submission.lab_number,
        successful_task: Vec::new(),
        failed_task: Vec::new(),
    };
    for task in &report.tasks {
        let entry = TaskResult {
            task_id: task.task_id,
            file_name: file_name(task.task_id),
            description: task.description.clone(),
        };
        if task.status {
            result.successful_task.push(entry);
        } else {
            result.failed_task.push(entry);
        }
    }
    for (task_id, name) in &files {
        if !report.tasks.iter().any(|t| t.task_id == *task_id) {
            result.failed_task.push(TaskResult {
                task_id: *task_id,
                file_name: name.to_string(),
                description: [NO_RESULT_DESCRIPTION.to_string()].into(),
            });
        }
    }
    result
}
