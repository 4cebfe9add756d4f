use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rust_embed::RustEmbed;

/// Test harness files copied into every sandbox build context.
#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/harness/"]
pub struct Harness;

/// Write every harness file into `dir`. Returns how many were written.
pub fn write_harness(dir: &Path) -> Result<usize> {
    let mut written = 0;
    for name in Harness::iter() {
        let file = Harness::get(&name)
            .with_context(|| format!("Embedded harness file vanished: {}", name))?;
        let target = dir.join(name.as_ref());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&target, file.data.as_ref())
            .with_context(|| format!("Failed to write {}", target.display()))?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_contains_conftest() {
        let conftest = Harness::get("conftest.py").expect("conftest.py embedded");
        let text = String::from_utf8_lossy(&conftest.data);
        assert!(text.contains("def logger("));
        assert!(text.contains("add_successful_task"));
        assert!(text.contains("add_fail_task"));
        assert!(text.contains("report_events.jsonl"));
    }

    #[test]
    fn recorder_lives_on_the_session_config() {
        let conftest = Harness::get("conftest.py").expect("conftest.py embedded");
        let text = String::from_utf8_lossy(&conftest.data);
        assert!(text.contains("config._task_recorder = TaskRecorder()"));
        assert!(text.contains("pluginmanager.register("));
        // no module-level recorder instance
        assert!(
            !text
                .lines()
                .any(|line| !line.starts_with(char::is_whitespace) && line.contains("= TaskRecorder()"))
        );
    }

    #[test]
    fn write_harness_materializes_files() {
        let dir = tempfile::tempdir().unwrap();
        let count = write_harness(dir.path()).unwrap();
        assert!(count >= 1);
        assert!(dir.path().join("conftest.py").exists());
    }
}
