//! Builds the per-submission staging directory.
//!
//! A staging directory holds exactly what one sandbox run needs: the answer
//! files that have a matching test, those tests, the lab's `settings.json`
//! and a `log_init.json` correlation descriptor. Source answer files are only
//! ever read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Timelike};
use walkdir::WalkDir;

use super::models::{Discipline, LogInit, Submission};

pub const TEST_PREFIX: &str = "test_";
pub const SETTINGS_FILE: &str = "settings.json";
pub const LOG_INIT_FILE: &str = "log_init.json";

/// Result of staging one submission.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub staging_dir: PathBuf,
    /// Answer file names copied into the staging directory.
    pub staged_answers: Vec<String>,
    /// Submitted file names without a matching test.
    pub rejected: Vec<String>,
}

impl StageOutcome {
    pub fn has_rejected(&self) -> bool {
        !self.rejected.is_empty()
    }

    /// False when every submitted file was rejected.
    pub fn has_file_for_test(&self) -> bool {
        !self.staged_answers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionStager {
    temp_root: PathBuf,
}

impl SubmissionStager {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
        }
    }

    /// Stage `submission` for `submitter_id`. `now` becomes the run time of
    /// the log descriptor, truncated to whole seconds.
    pub fn stage(
        &self,
        submitter_id: i64,
        discipline: &Discipline,
        submission: &Submission,
        now: NaiveDateTime,
    ) -> Result<StageOutcome> {
        let test_dir = Path::new(&discipline.path_to_test).join(submission.lab_number.to_string());
        let tests = list_tests(&test_dir)?;

        let mut answers: BTreeMap<String, &str> = BTreeMap::new();
        for path in &submission.files_path {
            let name = Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("Submitted path has no file name: {}", path))?;
            answers.insert(name.to_string(), path.as_str());
        }

        let rejected: Vec<String> = answers
            .keys()
            .filter(|name| !tests.contains_key(*name))
            .cloned()
            .collect();

        let staging_dir = self
            .temp_root
            .join(&discipline.short_name)
            .join(submission.lab_number.to_string())
            .join(format!("{}_{}", submitter_id, uuid::Uuid::new_v4()));
        if let Some(parent) = staging_dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::create_dir(&staging_dir)
            .with_context(|| format!("Failed to create staging dir {}", staging_dir.display()))?;

        let log_init = LogInit {
            student_id: submitter_id,
            lab_id: submission.lab_number,
            run_time: now.with_nanosecond(0).unwrap_or(now),
        };
        match fill_staging(&staging_dir, &test_dir, &tests, &answers, &log_init) {
            Ok(staged_answers) => Ok(StageOutcome {
                staging_dir,
                staged_answers,
                rejected,
            }),
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging_dir) {
                    tracing::warn!(dir = %staging_dir.display(), error = %cleanup, "failed to remove partial staging dir");
                }
                Err(e)
            }
        }
    }
}

/// Copy answers, their tests, the policy file and the log descriptor into
/// a freshly created staging directory. Returns the staged answer names.
fn fill_staging(
    staging_dir: &Path,
    test_dir: &Path,
    tests: &BTreeMap<String, PathBuf>,
    answers: &BTreeMap<String, &str>,
    log_init: &LogInit,
) -> Result<Vec<String>> {
    let mut staged_answers = Vec::new();
    for (name, source) in answers {
        let Some(test) = tests.get(name) else {
            continue;
        };
        fs::copy(source, staging_dir.join(name))
            .with_context(|| format!("Failed to stage answer {}", source))?;
        fs::copy(test, staging_dir.join(format!("{}{}", TEST_PREFIX, name)))
            .with_context(|| format!("Failed to stage test {}", test.display()))?;
        staged_answers.push(name.clone());
    }

    let settings = test_dir.join(SETTINGS_FILE);
    fs::copy(&settings, staging_dir.join(SETTINGS_FILE))
        .with_context(|| format!("Failed to stage policy file {}", settings.display()))?;

    let json = serde_json::to_string_pretty(log_init).context("Failed to serialize log init")?;
    fs::write(staging_dir.join(LOG_INIT_FILE), json).context("Failed to write log_init.json")?;

    Ok(staged_answers)
}

/// Map expected answer names to their test files in `test_dir`.
fn list_tests(test_dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let entries = fs::read_dir(test_dir)
        .with_context(|| format!("Failed to list tests in {}", test_dir.display()))?;
    let mut tests = BTreeMap::new();
    for entry in entries {
        let entry = entry.context("Failed to read test dir entry")?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(answer) = name.strip_prefix(TEST_PREFIX) {
            tests.insert(answer.to_string(), entry.path());
        }
    }
    Ok(tests)
}

/// Remove staging directories left behind under `temp_root` by a previous
/// process. Layout is `<discipline>/<lab>/<submitter>_<uuid>`; only
/// directories at that depth whose name carries a uuid suffix are removed.
pub fn sweep_staging(temp_root: &Path) -> Result<usize> {
    if !temp_root.exists() {
        return Ok(0);
    }
    let stale: Vec<PathBuf> = WalkDir::new(temp_root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && is_staging_name(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect();
    for dir in &stale {
        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove stale staging dir {}", dir.display()))?;
    }
    Ok(stale.len())
}

fn is_staging_name(name: &str) -> bool {
    match name.split_once('_') {
        Some((submitter, id)) => {
            submitter.parse::<i64>().is_ok() && uuid::Uuid::parse_str(id).is_ok()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        discipline: Discipline,
    }

    fn fixture(test_names: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let tests = root.join("tests").join("1");
        fs::create_dir_all(&tests).unwrap();
        for name in test_names {
            fs::write(tests.join(name), "def test_ok(logger):\n    pass\n").unwrap();
        }
        fs::write(tests.join(SETTINGS_FILE), r#"{"global": {}, "local": []}"#).unwrap();
        fs::create_dir_all(root.join("answers")).unwrap();
        let discipline = Discipline {
            id: 1,
            full_name: "Programming".into(),
            short_name: "PT".into(),
            path_to_test: root.join("tests").to_string_lossy().to_string(),
            path_to_answer: root.join("answers").to_string_lossy().to_string(),
            language: "python".into(),
            max_tasks: 2,
            max_home_works: 1,
            works: vec![],
        };
        Fixture {
            _dir: dir,
            root,
            discipline,
        }
    }

    fn answer(f: &Fixture, name: &str) -> String {
        let path = f.root.join("answers").join(name);
        fs::write(&path, "print('hi')\n").unwrap();
        path.to_string_lossy().to_string()
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_milli_opt(10, 30, 15, 789)
            .unwrap()
    }

    #[test]
    fn unmatched_files_are_rejected_and_matched_ones_staged() {
        let f = fixture(&["test_lab1-1.py", "test_lab1-2.py"]);
        let submission = Submission {
            discipline_id: 1,
            lab_number: 1,
            files_path: vec![
                answer(&f, "lab1-1.py"),
                answer(&f, "lab1-2.py"),
                answer(&f, "ghost.py"),
            ],
        };
        let stager = SubmissionStager::new(f.root.join("temp"));
        let outcome = stager.stage(42, &f.discipline, &submission, now()).unwrap();

        assert_eq!(outcome.rejected, vec!["ghost.py".to_string()]);
        assert_eq!(outcome.staged_answers, vec!["lab1-1.py".to_string(), "lab1-2.py".to_string()]);
        assert!(outcome.has_rejected());
        assert!(outcome.has_file_for_test());

        let dir = &outcome.staging_dir;
        assert!(dir.join("lab1-1.py").exists());
        assert!(dir.join("test_lab1-2.py").exists());
        assert!(dir.join(SETTINGS_FILE).exists());
        assert!(!dir.join("ghost.py").exists());
        assert!(dir.starts_with(f.root.join("temp").join("PT").join("1")));
        // sources stay where they were
        assert!(f.root.join("answers").join("ghost.py").exists());
    }

    #[test]
    fn log_init_is_truncated_to_seconds() {
        let f = fixture(&["test_lab1-1.py"]);
        let submission = Submission {
            discipline_id: 1,
            lab_number: 1,
            files_path: vec![answer(&f, "lab1-1.py")],
        };
        let stager = SubmissionStager::new(f.root.join("temp"));
        let outcome = stager.stage(7, &f.discipline, &submission, now()).unwrap();
        let raw = fs::read_to_string(outcome.staging_dir.join(LOG_INIT_FILE)).unwrap();
        let init: LogInit = serde_json::from_str(&raw).unwrap();
        assert_eq!(init.student_id, 7);
        assert_eq!(init.lab_id, 1);
        assert_eq!(init.run_time.nanosecond(), 0);
        assert_eq!(init.run_time.second(), 15);
    }

    #[test]
    fn everything_rejected_leaves_nothing_to_test() {
        let f = fixture(&["test_lab1-1.py"]);
        let submission = Submission {
            discipline_id: 1,
            lab_number: 1,
            files_path: vec![answer(&f, "lab9-9.py")],
        };
        let stager = SubmissionStager::new(f.root.join("temp"));
        let outcome = stager.stage(7, &f.discipline, &submission, now()).unwrap();
        assert!(!outcome.has_file_for_test());
        assert_eq!(outcome.rejected, vec!["lab9-9.py".to_string()]);
    }

    #[test]
    fn every_run_gets_its_own_directory() {
        let f = fixture(&["test_lab1-1.py"]);
        let submission = Submission {
            discipline_id: 1,
            lab_number: 1,
            files_path: vec![answer(&f, "lab1-1.py")],
        };
        let stager = SubmissionStager::new(f.root.join("temp"));
        let a = stager.stage(7, &f.discipline, &submission, now()).unwrap();
        let b = stager.stage(7, &f.discipline, &submission, now()).unwrap();
        assert_ne!(a.staging_dir, b.staging_dir);
    }

    #[test]
    fn missing_test_dir_is_an_error() {
        let f = fixture(&[]);
        let submission = Submission {
            discipline_id: 1,
            lab_number: 4,
            files_path: vec![answer(&f, "lab4-1.py")],
        };
        let stager = SubmissionStager::new(f.root.join("temp"));
        assert!(stager.stage(7, &f.discipline, &submission, now()).is_err());
    }

    #[test]
    fn failed_staging_leaves_no_directory_behind() {
        let f = fixture(&["test_lab1-1.py", "test_lab1-2.py"]);
        fs::remove_file(f.root.join("tests").join("1").join(SETTINGS_FILE)).unwrap();
        let vanished = f.root.join("answers").join("lab1-2.py");
        let submission = Submission {
            discipline_id: 1,
            lab_number: 1,
            files_path: vec![
                answer(&f, "lab1-1.py"),
                vanished.to_string_lossy().to_string(),
            ],
        };
        let stager = SubmissionStager::new(f.root.join("temp"));

        let err = stager.stage(7, &f.discipline, &submission, now()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to stage"));

        let lab_dir = f.root.join("temp").join("PT").join("1");
        let leftovers: Vec<_> = fs::read_dir(&lab_dir).unwrap().collect();
        assert!(leftovers.is_empty(), "partial staging dir kept: {:?}", leftovers);
    }

    #[test]
    fn sweep_removes_only_staging_dirs() {
        let f = fixture(&["test_lab1-1.py"]);
        let submission = Submission {
            discipline_id: 1,
            lab_number: 1,
            files_path: vec![answer(&f, "lab1-1.py")],
        };
        let temp = f.root.join("temp");
        let stager = SubmissionStager::new(&temp);
        let outcome = stager.stage(7, &f.discipline, &submission, now()).unwrap();
        let keep = temp.join("PT").join("1").join("notes");
        fs::create_dir_all(&keep).unwrap();

        assert_eq!(sweep_staging(&temp).unwrap(), 1);
        assert!(!outcome.staging_dir.exists());
        assert!(keep.exists());
        assert_eq!(sweep_staging(&f.root.join("missing")).unwrap(), 0);
    }
}
