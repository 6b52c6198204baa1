//! Configuration management for Stepdeck.
//!
//! Projects are read from `stepdeck.toml`, or from the JSON layout written by `export`
//! (`{ "projects": [ { "id", "name", "workingDir", "commands" | "command" } ] }`). The
//! format is chosen by file extension.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::process::{ProjectKey, ProjectSpec};
use crate::sequence::{ShellDialect, Step};

/// Top-level configuration structure corresponding to `stepdeck.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Shell program used to run compiled scripts.
    pub shell: Option<String>,
    /// Script syntax; the host's native shell when unset.
    pub dialect: Option<ShellDialect>,
    /// Maximum number of lines to keep in memory per project.
    pub max_lines: Option<usize>,
    /// How long to keep reading output after a shell exits, in milliseconds.
    pub drain_timeout_ms: Option<u64>,
    /// Template for per-project transcript paths.
    pub log_file: Option<String>,
    #[serde(rename = "project", alias = "projects", default)]
    pub projects: Vec<ProjectConfig>,
}

/// Configuration for a single project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub id: ProjectKey,
    /// Display name; the id when unset.
    pub name: Option<String>,
    #[serde(alias = "workingDir")]
    pub working_dir: Option<String>,
    /// Ordered steps.
    pub commands: Option<Vec<Step>>,
    /// Single-command form, equivalent to one unnamed step.
    pub command: Option<String>,
}

impl ProjectConfig {
    /// The project's steps, with the single-command form taken as a one-step sequence.
    pub fn steps(&self) -> Vec<Step> {
        match (&self.commands, &self.command) {
            (Some(commands), _) => commands.clone(),
            (None, Some(command)) => vec![Step::new(command.clone())],
            (None, None) => Vec::new(),
        }
    }

    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.id.to_string(),
        }
    }
}

impl Config {
    /// Validates projects and resolves relative working directories against `base_dir`.
    pub fn project_specs(&self, base_dir: Option<&Path>) -> Result<Vec<ProjectSpec>> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.projects.len());
        for (index, project) in self.projects.iter().enumerate() {
            if project.id.as_str().trim().is_empty() {
                bail!("project {} is missing an id", index + 1);
            }
            if !seen.insert(project.id.clone()) {
                bail!("duplicate project id '{}'", project.id);
            }
            let steps = project.steps();
            if steps.is_empty() {
                bail!("project '{}' has no command or commands", project.id);
            }
            if let Some(step) = steps.iter().position(|s| s.command.trim().is_empty()) {
                bail!(
                    "project '{}': command {} is empty",
                    project.id,
                    step + 1
                );
            }
            specs.push(ProjectSpec {
                key: project.id.clone(),
                name: project.display_name(),
                working_dir: resolve_dir(project.working_dir.as_deref(), base_dir),
                steps,
            });
        }
        Ok(specs)
    }
}

fn resolve_dir(dir: Option<&str>, base_dir: Option<&Path>) -> Option<PathBuf> {
    let dir = dir.map(str::trim).filter(|d| !d.is_empty())?;
    let path = PathBuf::from(dir);
    match base_dir {
        Some(base) if path.is_relative() => Some(base.join(path)),
        _ => Some(path),
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config: Config = if is_json {
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?
    } else {
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?
    };
    Ok(config)
}

#[derive(Serialize)]
struct ExportedConfig<'a> {
    projects: Vec<ExportedProject<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportedProject<'a> {
    id: &'a ProjectKey,
    name: &'a str,
    working_dir: String,
    commands: &'a [Step],
}

/// Renders projects in the JSON layout accepted by `load_config`.
pub fn export_json(specs: &[ProjectSpec]) -> Result<String> {
    let exported = ExportedConfig {
        projects: specs
            .iter()
            .map(|spec| ExportedProject {
                id: &spec.key,
                name: &spec.name,
                working_dir: spec
                    .working_dir
                    .as_ref()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_default(),
                commands: &spec.steps,
            })
            .collect(),
    };
    serde_json::to_string_pretty(&exported).context("failed to serialize config")
}

/// Writes projects to `path` as JSON.
pub fn export_config(specs: &[ProjectSpec], path: &Path) -> Result<()> {
    let json = export_json(specs)?;
    std::fs::write(path, json + "\n")
        .with_context(|| format!("failed to write {}", path.display()))
}
