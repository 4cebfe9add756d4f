use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, KillContainerOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder,
    StartContainerOptions, WaitContainerOptionsBuilder,
};
use futures_util::stream::StreamExt;
use std::path::Path;

/// Resource limits applied to a sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLimits {
    pub memory: String,
    pub cpus: f64,
    pub pids_limit: u32,
    pub network: String,
}

/// Abstraction over the container engine for testability.
/// Real implementation: `DockerRuntime`. Tests use an in-process fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build `context_dir` (which holds a Dockerfile) into an image tagged `tag`.
    async fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()>;

    /// Start one detached container named `name` from image `tag`.
    async fn start_container(&self, tag: &str, name: &str, limits: &RunLimits) -> Result<()>;

    /// Block until the container stops; returns its exit code.
    async fn wait_container(&self, name: &str) -> Result<i64>;

    /// Everything the container wrote to standard output.
    async fn container_logs(&self, name: &str) -> Result<String>;

    async fn kill_container(&self, name: &str) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn remove_image(&self, tag: &str) -> Result<()>;
}

/// Talks to the Docker Engine API over the local socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()> {
        let dir = context_dir.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || tar_context(&dir))
            .await
            .context("Build context task panicked")??;

        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .forcerm(true)
            .build();
        let mut stream = self
            .docker
            .build_image(options, None, Some(bollard::body_full(archive.into())));
        while let Some(step) = stream.next().await {
            let info = step.with_context(|| format!("Image build failed for {}", tag))?;
            if let Some(line) = info.stream.as_deref().map(str::trim)
                && !line.is_empty()
            {
                tracing::trace!(%tag, "{}", line);
            }
        }
        Ok(())
    }

    async fn start_container(&self, tag: &str, name: &str, limits: &RunLimits) -> Result<()> {
        let host_config = HostConfig {
            memory: Some(memory_bytes(&limits.memory)?),
            nano_cpus: Some((limits.cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(i64::from(limits.pids_limit)),
            network_mode: Some(limits.network.clone()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(tag.to_string()),
            network_disabled: Some(limits.network == "none"),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default().name(name).build();
        self.docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", name))?;
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", name))?;
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        let options = WaitContainerOptionsBuilder::default()
            .condition("not-running")
            .build();
        let mut stream = self.docker.wait_container(name, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e).with_context(|| format!("Failed to wait for {}", name)),
            None => bail!("Wait stream for {} ended without a status", name),
        }
    }

    async fn container_logs(&self, name: &str) -> Result<String> {
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(false)
            .build();
        let mut stream = self.docker.logs(name, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to read logs of {}", name))?;
            output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(output)
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.docker
            .kill_container(name, None::<KillContainerOptions>)
            .await
            .with_context(|| format!("Failed to kill container {}", name))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(name, Some(options))
            .await
            .with_context(|| format!("Failed to remove container {}", name))
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let options = RemoveImageOptionsBuilder::default().force(true).build();
        self.docker
            .remove_image(tag, Some(options), None)
            .await
            .with_context(|| format!("Failed to remove image {}", tag))?;
        Ok(())
    }
}

/// Pack a build context directory into an uncompressed tar archive.
fn tar_context(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("Failed to archive build context {}", dir.display()))?;
    builder
        .into_inner()
        .context("Failed to finish build context archive")
}

/// Parse a Docker-style memory size (`512k`, `256m`, `1g`, plain bytes).
pub fn memory_bytes(spec: &str) -> Result<i64> {
    let spec = spec.trim().to_ascii_lowercase();
    let spec = spec.strip_suffix('b').unwrap_or(&spec);
    let (digits, unit) = match spec.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&spec[..i], c),
        _ => (spec, 'b'),
    };
    let multiplier: i64 = match unit {
        'b' => 1,
        'k' => 1 << 10,
        'm' => 1 << 20,
        'g' => 1 << 30,
        _ => bail!("Unknown memory unit in {:?}", spec),
    };
    let value: i64 = digits
        .parse()
        .with_context(|| format!("Invalid memory size {:?}", spec))?;
    value
        .checked_mul(multiplier)
        .with_context(|| format!("Memory size {:?} is too large", spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::fs;

    #[test]
    fn memory_sizes_follow_docker_units() {
        assert_eq!(memory_bytes("256m").unwrap(), 256 * 1024 * 1024);
        assert_eq!(memory_bytes("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(memory_bytes("512kb").unwrap(), 512 * 1024);
        assert_eq!(memory_bytes("4096").unwrap(), 4096);
    }

    #[test]
    fn bad_memory_sizes_are_rejected() {
        assert!(memory_bytes("lots").is_err());
        assert!(memory_bytes("12x").is_err());
        assert!(memory_bytes("").is_err());
    }

    #[test]
    fn build_context_archive_holds_every_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        fs::write(dir.path().join("lab1-1.py"), "print(1)\n").unwrap();
        fs::create_dir(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("data").join("input.txt"), "42\n").unwrap();

        let archive = tar_context(dir.path()).unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let names: BTreeSet<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains("./Dockerfile") || names.contains("Dockerfile"));
        assert!(names.iter().any(|n| n.ends_with("lab1-1.py")));
        assert!(names.iter().any(|n| n.ends_with("data/input.txt")));
    }
}
