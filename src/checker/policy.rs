//! Static keyword and import screening of staged answer files.
//!
//! Policies live in the lab's `settings.json`. The global section applies to
//! every answer file; local entries apply to the files whose task number
//! matches the entry's `lab_number`. A rejected file is deleted from the
//! staging directory together with its test and never looked at again.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use glob::glob;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::models::task_number;
use super::stager::{SETTINGS_FILE, TEST_PREFIX};

// Any import statement, anywhere in the file, at any indentation.
static ANY_IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:import\s+[\w.]|from\s+[\w.]+\s+import\b)").unwrap()
});

// Top-level `import a, b.c as d`.
static IMPORT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^import\s+([^#]+)").unwrap());

// Top-level `from a.b import c`.
static FROM_IMPORT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^from\s+([\w.]+)\s+import\b").unwrap());

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalPolicy {
    /// Patterns that must not occur.
    #[serde(default)]
    pub prohibition: Option<Vec<String>>,
    /// Patterns that must occur.
    #[serde(default)]
    pub restriction: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalPolicy {
    #[serde(alias = "labNumber")]
    pub lab_number: u32,
    #[serde(default)]
    pub prohibition: Option<Vec<String>>,
    #[serde(default)]
    pub restriction: Option<Vec<String>>,
    /// Allowed module patterns. `None` forbids importing anything.
    #[serde(default, alias = "resolveImport")]
    pub resolve_import: Option<Vec<String>>,
}

/// Contents of a lab's `settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicySettings {
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, alias = "global_level")]
    pub global: GlobalPolicy,
    #[serde(default, alias = "local_level")]
    pub local: Vec<LocalPolicy>,
}

impl PolicySettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse policy file {}", path.display()))
    }

    pub fn dependencies(&self) -> &[String] {
        self.dependencies.as_deref().unwrap_or_default()
    }

    /// Local entries that concern at least one of `numbers`.
    pub fn local_view(&self, numbers: &BTreeSet<u32>) -> Vec<LocalPolicy> {
        self.local
            .iter()
            .filter(|entry| numbers.contains(&entry.lab_number))
            .cloned()
            .collect()
    }
}

/// Files rejected and kept by one policy run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyOutcome {
    pub rejected: Vec<String>,
    pub remaining: Vec<String>,
}

impl PolicyOutcome {
    pub fn has_rejected_files(&self) -> bool {
        !self.rejected.is_empty()
    }

    pub fn has_file_for_test(&self) -> bool {
        !self.remaining.is_empty()
    }
}

pub struct PolicyEngine {
    staging_dir: PathBuf,
    settings: PolicySettings,
}

impl PolicyEngine {
    /// Read the policy file of a staging directory.
    pub fn load(staging_dir: &Path) -> Result<Self> {
        let settings = PolicySettings::load(&staging_dir.join(SETTINGS_FILE))?;
        Ok(Self::new(staging_dir, settings))
    }

    pub fn new(staging_dir: &Path, settings: PolicySettings) -> Self {
        Self {
            staging_dir: staging_dir.to_path_buf(),
            settings,
        }
    }

    /// Screen every staged `lab*.py` file, global pass first.
    pub fn run(&self) -> Result<PolicyOutcome> {
        let mut rejected = Vec::new();

        let global = &self.settings.global;
        let mut survivors = Vec::new();
        for name in self.answer_files()? {
            let content = self.read(&name)?;
            if violates_keywords(
                &content,
                global.prohibition.as_deref(),
                global.restriction.as_deref(),
            )? {
                tracing::debug!(file = %name, "rejected by global policy");
                self.discard(&name)?;
                rejected.push(name);
            } else {
                survivors.push(name);
            }
        }

        let numbers: BTreeSet<u32> = survivors.iter().filter_map(|n| task_number(n)).collect();
        let local = self.settings.local_view(&numbers);

        let mut remaining = Vec::new();
        for name in survivors {
            let content = self.read(&name)?;
            let mut violation = false;
            for entry in local.iter().filter(|e| Some(e.lab_number) == task_number(&name)) {
                if violates_local(&content, entry)? {
                    violation = true;
                    break;
                }
            }
            if violation {
                tracing::debug!(file = %name, "rejected by local policy");
                self.discard(&name)?;
                rejected.push(name);
            } else {
                remaining.push(name);
            }
        }

        Ok(PolicyOutcome {
            rejected,
            remaining,
        })
    }

    fn answer_files(&self) -> Result<Vec<String>> {
        let dir = self.staging_dir.to_string_lossy();
        let pattern = format!("{}/lab*.py", glob::Pattern::escape(&dir));
        let mut names: Vec<String> = glob(&pattern)
            .context("Failed to read glob pattern")?
            .filter_map(|entry| entry.ok())
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<String> {
        let path = self.staging_dir.join(name);
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Delete an answer file and its paired test from the staging directory.
    fn discard(&self, name: &str) -> Result<()> {
        let answer = self.staging_dir.join(name);
        fs::remove_file(&answer)
            .with_context(|| format!("Failed to remove {}", answer.display()))?;
        let test = self.staging_dir.join(format!("{}{}", TEST_PREFIX, name));
        match fs::remove_file(&test) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", test.display())),
        }
    }
}

/// Compile a policy keyword. Keywords are regular expressions; one that
/// does not compile is matched literally.
fn keyword_regex(keyword: &str) -> Result<Regex> {
    match Regex::new(keyword) {
        Ok(re) => Ok(re),
        Err(_) => Regex::new(&regex::escape(keyword))
            .with_context(|| format!("Invalid policy keyword: {}", keyword)),
    }
}

fn violates_keywords(
    content: &str,
    prohibition: Option<&[String]>,
    restriction: Option<&[String]>,
) -> Result<bool> {
    for keyword in prohibition.unwrap_or_default() {
        if keyword_regex(keyword)?.is_match(content) {
            return Ok(true);
        }
    }
    for keyword in restriction.unwrap_or_default() {
        if !keyword_regex(keyword)?.is_match(content) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn violates_local(content: &str, entry: &LocalPolicy) -> Result<bool> {
    if violates_keywords(
        content,
        entry.prohibition.as_deref(),
        entry.restriction.as_deref(),
    )? {
        return Ok(true);
    }
    match &entry.resolve_import {
        None => Ok(ANY_IMPORT_REGEX.is_match(content)),
        Some(allowed) => {
            let patterns = allowed
                .iter()
                .map(|p| {
                    let anchored = format!(r"^(?:{})(?:\.|$)", p);
                    Regex::new(&anchored)
                        .or_else(|_| Regex::new(&format!(r"^{}(?:\.|$)", regex::escape(p))))
                        .with_context(|| format!("Invalid import pattern: {}", p))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(imported_modules(content)
                .iter()
                .any(|module| !patterns.iter().any(|re| re.is_match(module))))
        }
    }
}

/// Modules named by top-level import statements, in file order.
fn imported_modules(content: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for line in content.lines() {
        if let Some(caps) = FROM_IMPORT_REGEX.captures(line) {
            modules.push(caps[1].to_string());
        } else if let Some(caps) = IMPORT_REGEX.captures(line) {
            for part in caps[1].split(',') {
                // `import a.b as c` names module `a.b`
                if let Some(module) = part.split_whitespace().next() {
                    modules.push(module.trim_end_matches(';').to_string());
                }
            }
        }
    }
    modules
}
