//! One-shot container execution of a staged submission.
//!
//! Every run builds its own image from the staging directory, starts a
//! single container from it, collects the harness output and removes both
//! the container and the image afterwards.

use std::fs;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use tokio::time::timeout;

use super::embedded::write_harness;
use super::logger::parse_report;
use super::models::{LogInit, SandboxReport};
use super::policy::PolicySettings;
use super::runtime::{ContainerRuntime, RunLimits};
use super::stager::{LOG_INIT_FILE, SETTINGS_FILE};
use crate::errors::CheckerError;

pub const EVENTS_FILE: &str = "report_events.jsonl";

// Package requirement as pip understands it, without shell metacharacters.
static DEPENDENCY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-\[\],<>=!~]*$").unwrap());

/// Configuration for sandbox containers.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub base_image: String,
    pub test_framework: String,
    pub memory: String,
    pub cpus: f64,
    pub pids_limit: u32,
    pub network: String,
    /// Seconds allowed for `docker build`.
    pub build_timeout: u64,
    /// Seconds allowed for the test run.
    pub run_timeout: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_image: "python:3.11-slim".to_string(),
            test_framework: "pytest".to_string(),
            memory: "256m".to_string(),
            cpus: 1.0,
            pids_limit: 128,
            network: "none".to_string(),
            build_timeout: 600,
            run_timeout: 120,
        }
    }
}

/// Raw `[sandbox]` table of `labcheck.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct SandboxSection {
    base_image: Option<String>,
    test_framework: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    pids_limit: Option<u32>,
    network: Option<String>,
    build_timeout: Option<u64>,
    run_timeout: Option<u64>,
}

impl SandboxConfig {
    /// Override defaults with whatever the section sets.
    pub fn apply(&mut self, section: SandboxSection) {
        if let Some(image) = section.base_image {
            self.base_image = image;
        }
        if let Some(framework) = section.test_framework {
            self.test_framework = framework;
        }
        if let Some(memory) = section.memory {
            self.memory = memory;
        }
        if let Some(cpus) = section.cpus {
            self.cpus = cpus;
        }
        if let Some(pids) = section.pids_limit {
            self.pids_limit = pids;
        }
        if let Some(network) = section.network {
            self.network = network;
        }
        if let Some(secs) = section.build_timeout {
            self.build_timeout = secs;
        }
        if let Some(secs) = section.run_timeout {
            self.run_timeout = secs;
        }
    }

    pub fn limits(&self) -> RunLimits {
        RunLimits {
            memory: self.memory.clone(),
            cpus: self.cpus,
            pids_limit: self.pids_limit,
            network: self.network.clone(),
        }
    }

    /// Build descriptor for a staging directory. Tests run when the
    /// container starts, so a failing test never fails the build.
    pub fn dockerfile(&self, dependencies: &[String]) -> String {
        let mut packages = vec![self.test_framework.as_str()];
        packages.extend(dependencies.iter().map(String::as_str));
        format!(
            "FROM {image}\n\
             ENV PIP_ROOT_USER_ACTION=ignore\n\
             ENV PYTHONDONTWRITEBYTECODE=1\n\
             ENV PYTHONUNBUFFERED=1\n\
             WORKDIR /opt/\n\
             COPY . /opt\n\
             RUN pip install --no-cache-dir {packages}\n\
             CMD [\"sh\", \"-c\", \"python -m pytest -q -p no:cacheprovider >/dev/null 2>&1; cat {events}\"]\n",
            image = self.base_image,
            packages = packages.join(" "),
            events = EVENTS_FILE,
        )
    }
}

pub struct Sandbox {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self { runtime, config }
    }

    /// Test the files left in `staging_dir` and return the harvested report.
    pub async fn run(
        &self,
        staging_dir: &Path,
        student_id: i64,
        lab_number: u32,
    ) -> Result<SandboxReport, CheckerError> {
        let init = self.prepare(staging_dir)?;
        let tag = format!(
            "labcheck-{}-{}-{}",
            student_id,
            lab_number,
            uuid::Uuid::new_v4().simple()
        );

        tracing::info!(%tag, "building sandbox image");
        let build = timeout(
            Duration::from_secs(self.config.build_timeout),
            self.runtime.build_image(staging_dir, &tag),
        )
        .await;
        match build {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.remove_image(&tag).await;
                return Err(CheckerError::SandboxBuild {
                    tag,
                    message: format!("{:#}", e),
                });
            }
            Err(_) => {
                self.remove_image(&tag).await;
                return Err(CheckerError::SandboxTimeout {
                    stage: "build",
                    seconds: self.config.build_timeout,
                });
            }
        }

        let output = self.execute(&tag).await;
        if let Err(e) = self.runtime.remove_container(&tag).await {
            tracing::warn!(%tag, error = %format!("{:#}", e), "failed to remove sandbox container");
        }
        self.remove_image(&tag).await;

        let report = parse_report(&output?, &init)?;
        if report.lab_id != lab_number {
            return Err(CheckerError::ReportParse(format!(
                "report is for lab {}, expected lab {}",
                report.lab_id, lab_number
            )));
        }
        Ok(report)
    }

    /// Write the harness and build descriptor next to the staged files.
    fn prepare(&self, staging_dir: &Path) -> Result<LogInit, CheckerError> {
        let settings = PolicySettings::load(&staging_dir.join(SETTINGS_FILE))?;
        let dependencies = settings.dependencies();
        if let Some(bad) = dependencies.iter().find(|d| !DEPENDENCY_REGEX.is_match(d)) {
            return Err(CheckerError::SandboxBuild {
                tag: staging_dir.display().to_string(),
                message: format!("refusing dependency specification {:?}", bad),
            });
        }

        write_harness(staging_dir)?;
        fs::write(
            staging_dir.join("Dockerfile"),
            self.config.dockerfile(dependencies),
        )
        .context("Failed to write Dockerfile")?;

        let raw = fs::read_to_string(staging_dir.join(LOG_INIT_FILE))
            .context("Failed to read log_init.json")?;
        let init = serde_json::from_str(&raw).context("Failed to parse log_init.json")?;
        Ok(init)
    }

    /// Start the container, wait for it within the run timeout and collect
    /// its standard output.
    async fn execute(&self, tag: &str) -> Result<String, CheckerError> {
        let run_error = |e: anyhow::Error| CheckerError::SandboxRun {
            tag: tag.to_string(),
            message: format!("{:#}", e),
        };

        self.runtime
            .start_container(tag, tag, &self.config.limits())
            .await
            .map_err(run_error)?;

        let waited = timeout(
            Duration::from_secs(self.config.run_timeout),
            self.runtime.wait_container(tag),
        )
        .await;
        let exit_code = match waited {
            Ok(code) => code.map_err(run_error)?,
            Err(_) => {
                if let Err(e) = self.runtime.kill_container(tag).await {
                    tracing::warn!(%tag, error = %format!("{:#}", e), "failed to kill sandbox container");
                }
                return Err(CheckerError::SandboxTimeout {
                    stage: "run",
                    seconds: self.config.run_timeout,
                });
            }
        };
        tracing::debug!(%tag, exit_code, "sandbox container finished");

        self.runtime.container_logs(tag).await.map_err(run_error)
    }

    async fn remove_image(&self, tag: &str) {
        if let Err(e) = self.runtime.remove_image(tag).await {
            tracing::warn!(%tag, error = %format!("{:#}", e), "failed to remove sandbox image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    /// Records calls and replays canned behaviour.
    #[derive(Default)]
    struct FakeRuntime {
        calls: Mutex<Vec<String>>,
        fail_build: bool,
        hang: bool,
        logs: String,
    }

    impl FakeRuntime {
        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn build_image(&self, context_dir: &Path, _tag: &str) -> Result<()> {
            self.push("build".into());
            assert!(context_dir.join("Dockerfile").exists());
            assert!(context_dir.join("conftest.py").exists());
            if self.fail_build {
                bail!("pip install exploded");
            }
            Ok(())
        }

        async fn start_container(&self, _tag: &str, _name: &str, limits: &RunLimits) -> Result<()> {
            self.push(format!("start network={}", limits.network));
            Ok(())
        }

        async fn wait_container(&self, _name: &str) -> Result<i64> {
            self.push("wait".into());
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(0)
        }

        async fn container_logs(&self, _name: &str) -> Result<String> {
            self.push("logs".into());
            Ok(self.logs.clone())
        }

        async fn kill_container(&self, _name: &str) -> Result<()> {
            self.push("kill".into());
            Ok(())
        }

        async fn remove_container(&self, _name: &str) -> Result<()> {
            self.push("rm".into());
            Ok(())
        }

        async fn remove_image(&self, _tag: &str) -> Result<()> {
            self.push("rmi".into());
            Ok(())
        }
    }

    fn staging(settings: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), settings).unwrap();
        let init = LogInit {
            student_id: 9,
            lab_id: 2,
            run_time: NaiveDate::from_ymd_opt(2024, 4, 2)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        };
        fs::write(dir.path().join(LOG_INIT_FILE), serde_json::to_string(&init).unwrap()).unwrap();
        fs::write(dir.path().join("lab2-1.py"), "x = 1\n").unwrap();
        dir
    }

    const LOGS: &str = "{\"event\": \"task\", \"task_id\": 1, \"status\": true}\n\
                        {\"event\": \"finish\", \"exit_status\": 0}\n";

    #[test]
    fn dockerfile_installs_framework_and_dependencies() {
        let config = SandboxConfig::default();
        let dockerfile = config.dockerfile(&["numpy==1.26".to_string()]);
        assert!(dockerfile.starts_with("FROM python:3.11-slim\n"));
        assert!(dockerfile.contains("RUN pip install --no-cache-dir pytest numpy==1.26\n"));
        assert!(dockerfile.contains("CMD [\"sh\""));
        assert!(dockerfile.contains("cat report_events.jsonl"));
        // tests must not run at build time
        assert!(!dockerfile.contains("RUN python -m pytest"));
    }

    #[test]
    fn section_overrides_defaults() {
        let section: SandboxSection =
            toml::from_str("memory = \"1g\"\nrun_timeout = 30\nnetwork = \"bridge\"").unwrap();
        let mut config = SandboxConfig::default();
        config.apply(section);
        assert_eq!(config.memory, "1g");
        assert_eq!(config.run_timeout, 30);
        assert_eq!(config.network, "bridge");
        assert_eq!(config.base_image, "python:3.11-slim");
    }

    #[tokio::test]
    async fn successful_run_parses_report_and_cleans_up() {
        let dir = staging(r#"{"dependencies": null}"#);
        let runtime = Arc::new(FakeRuntime {
            logs: LOGS.to_string(),
            ..Default::default()
        });
        let sandbox = Sandbox::new(runtime.clone(), SandboxConfig::default());
        let report = sandbox.run(dir.path(), 9, 2).await.unwrap();
        assert_eq!(report.lab_id, 2);
        assert!(report.tasks[0].status);
        assert_eq!(
            runtime.calls(),
            vec!["build", "start network=none", "wait", "logs", "rm", "rmi"]
        );
    }

    #[tokio::test]
    async fn build_failure_is_classified_and_image_removed() {
        let dir = staging("{}");
        let runtime = Arc::new(FakeRuntime {
            fail_build: true,
            ..Default::default()
        });
        let sandbox = Sandbox::new(runtime.clone(), SandboxConfig::default());
        let err = sandbox.run(dir.path(), 9, 2).await.unwrap_err();
        assert!(matches!(err, CheckerError::SandboxBuild { .. }));
        assert!(err.to_string().contains("pip install exploded"));
        assert_eq!(runtime.calls(), vec!["build", "rmi"]);
    }

    #[tokio::test]
    async fn hung_container_is_killed_after_run_timeout() {
        let dir = staging("{}");
        let runtime = Arc::new(FakeRuntime {
            hang: true,
            ..Default::default()
        });
        let config = SandboxConfig {
            run_timeout: 1,
            ..Default::default()
        };
        let sandbox = Sandbox::new(runtime.clone(), config);
        let err = sandbox.run(dir.path(), 9, 2).await.unwrap_err();
        assert!(matches!(
            err,
            CheckerError::SandboxTimeout {
                stage: "run",
                seconds: 1
            }
        ));
        assert_eq!(
            runtime.calls(),
            vec!["build", "start network=none", "wait", "kill", "rm", "rmi"]
        );
    }

    #[tokio::test]
    async fn garbage_output_is_a_parse_failure() {
        let dir = staging("{}");
        let runtime = Arc::new(FakeRuntime {
            logs: "Traceback (most recent call last):\n".to_string(),
            ..Default::default()
        });
        let sandbox = Sandbox::new(runtime, SandboxConfig::default());
        let err = sandbox.run(dir.path(), 9, 2).await.unwrap_err();
        assert!(matches!(err, CheckerError::ReportParse(_)));
        assert!(err.is_sandbox_failure());
    }

    #[tokio::test]
    async fn shell_metacharacters_in_dependencies_are_refused() {
        let dir = staging(r#"{"dependencies": ["numpy; rm -rf /"]}"#);
        let runtime = Arc::new(FakeRuntime::default());
        let sandbox = Sandbox::new(runtime.clone(), SandboxConfig::default());
        let err = sandbox.run(dir.path(), 9, 2).await.unwrap_err();
        assert!(matches!(err, CheckerError::SandboxBuild { .. }));
        assert!(runtime.calls().is_empty());
    }
}
