//! Compiling step lists into a single conditional shell script.
//!
//! Each step after the first is guarded by the shell's own "previous command succeeded"
//! test, so one failing step stops the rest and its status becomes the script's status.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One shell invocation within a project's sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: String,
}

impl Step {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: None,
            command: command.into(),
        }
    }

    #[cfg(test)]
    pub fn named(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            command: command.into(),
        }
    }

    /// Display label, falling back to the step's position.
    pub fn label(&self, index: usize) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("step {}", index + 1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("no steps to run")]
    Empty,
    #[error("step {} has an empty command", .index + 1)]
    BlankCommand { index: usize },
}

/// Which shell syntax the compiled script targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShellDialect {
    /// `sh`-compatible shells, run as `<shell> -c <script>`.
    Posix,
    /// Windows PowerShell, run as `powershell.exe -Command <script>`.
    #[value(name = "powershell")]
    PowerShell,
}

impl ShellDialect {
    /// The native dialect of the current platform.
    pub fn host() -> Self {
        if cfg!(windows) {
            ShellDialect::PowerShell
        } else {
            ShellDialect::Posix
        }
    }

    pub fn default_shell(self) -> &'static str {
        match self {
            ShellDialect::Posix => "/bin/sh",
            ShellDialect::PowerShell => "powershell.exe",
        }
    }
}

/// A compiled script ready to hand to a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    dialect: ShellDialect,
    body: String,
}

impl Script {
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Program and arguments that run this script under `shell` (or the dialect default).
    pub fn invocation(&self, shell: Option<&str>) -> (String, Vec<String>) {
        let program = shell.unwrap_or(self.dialect.default_shell()).to_string();
        let args = match self.dialect {
            ShellDialect::Posix => vec!["-c".to_string(), self.body.clone()],
            ShellDialect::PowerShell => vec![
                "-NoProfile".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-Command".to_string(),
                self.body.clone(),
            ],
        };
        (program, args)
    }
}

const POWERSHELL_PRELUDE: &str = "[Console]::OutputEncoding = [System.Text.Encoding]::UTF8";

/// Compiles `steps` into one script in which step *i* runs only if step *i - 1* succeeded.
pub fn compile(steps: &[Step], dialect: ShellDialect) -> Result<Script, SequenceError> {
    if steps.is_empty() {
        return Err(SequenceError::Empty);
    }
    if let Some(index) = steps.iter().position(|step| step.command.trim().is_empty()) {
        return Err(SequenceError::BlankCommand { index });
    }
    let body = match dialect {
        ShellDialect::Posix => compile_posix(steps),
        ShellDialect::PowerShell => compile_powershell(steps),
    };
    Ok(Script { dialect, body })
}

// Brace groups keep multi-statement steps together, and `&&` preserves the failing status.
fn compile_posix(steps: &[Step]) -> String {
    let groups: Vec<String> = steps
        .iter()
        .map(|step| format!("{{\n{}\n}}", step.command.trim_end()))
        .collect();
    groups.join(" && ")
}

fn compile_powershell(steps: &[Step]) -> String {
    let mut body = format!("{}; {}", POWERSHELL_PRELUDE, steps[0].command.trim());
    for step in &steps[1..] {
        body.push_str(&format!("; if ($?) {{ {} }}", step.command.trim()));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(commands: &[&str]) -> Vec<Step> {
        commands.iter().map(|c| Step::new(*c)).collect()
    }

    #[test]
    fn rejects_empty_sequence() {
        assert_eq!(compile(&[], ShellDialect::Posix), Err(SequenceError::Empty));
    }

    #[test]
    fn rejects_blank_command() {
        let err = compile(&steps(&["echo a", "  "]), ShellDialect::Posix).unwrap_err();
        assert_eq!(err, SequenceError::BlankCommand { index: 1 });
        assert_eq!(err.to_string(), "step 2 has an empty command");
    }

    #[test]
    fn single_step_has_no_guard() {
        let script = compile(&steps(&["echo A"]), ShellDialect::Posix).unwrap();
        assert_eq!(script.body(), "{\necho A\n}");
        assert!(!script.body().contains("&&"));
    }

    #[test]
    fn posix_has_n_bodies_and_n_minus_one_guards_in_order() {
        let commands = ["npm ci", "npm run build", "npm start"];
        let script = compile(&steps(&commands), ShellDialect::Posix).unwrap();
        let body = script.body();
        assert_eq!(body.matches("} && {").count(), commands.len() - 1);
        let positions: Vec<usize> = commands.iter().map(|c| body.find(c).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn posix_groups_multi_statement_steps() {
        let script = compile(&steps(&["cd web; ls", "make"]), ShellDialect::Posix).unwrap();
        assert_eq!(script.body(), "{\ncd web; ls\n} && {\nmake\n}");
    }

    #[test]
    fn powershell_uses_last_status_guard() {
        let script = compile(&steps(&["exit 1", "echo never", "echo later"]), ShellDialect::PowerShell)
            .unwrap();
        assert_eq!(
            script.body(),
            "[Console]::OutputEncoding = [System.Text.Encoding]::UTF8; exit 1; if ($?) { echo never }; if ($?) { echo later }"
        );
        assert_eq!(script.body().matches("if ($?)").count(), 2);
    }

    #[test]
    fn compile_is_deterministic() {
        let input = steps(&["a", "b"]);
        assert_eq!(
            compile(&input, ShellDialect::Posix).unwrap(),
            compile(&input, ShellDialect::Posix).unwrap()
        );
    }

    #[test]
    fn invocation_uses_dialect_defaults() {
        let script = compile(&steps(&["true"]), ShellDialect::Posix).unwrap();
        let (program, args) = script.invocation(None);
        assert_eq!(program, "/bin/sh");
        assert_eq!(args[0], "-c");
        let (program, _) = script.invocation(Some("/bin/bash"));
        assert_eq!(program, "/bin/bash");

        let script = compile(&steps(&["dir"]), ShellDialect::PowerShell).unwrap();
        let (program, args) = script.invocation(None);
        assert_eq!(program, "powershell.exe");
        assert_eq!(args.last().map(String::as_str), Some(script.body()));
    }

    #[test]
    fn step_labels_fall_back_to_position() {
        assert_eq!(Step::named("build", "make").label(0), "build");
        assert_eq!(Step::named(" ", "make").label(2), "step 3");
        assert_eq!(Step::new("make").label(0), "step 1");
    }
}
