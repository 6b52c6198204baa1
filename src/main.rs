//! Stepdeck: run multi-step project commands and watch their styled output.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, and drives either the TUI or a headless run from a single
//! event loop that owns the supervisor and all project state.

mod ansi;
mod app;
mod config;
mod decode;
mod events;
mod output;
mod process;
mod runner;
mod sequence;
mod tui;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use crossterm::style::{ContentStyle, StyledContent};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::ansi::StyledRun;
use crate::app::{error_notice, exit_notice, start_banner, App, AppAction};
use crate::config::Config;
use crate::events::Event;
use crate::output::{render_template, StreamKind, Transcript};
use crate::process::{ProjectKey, ProjectSpec};
use crate::runner::{RunId, StartError, Supervisor, SupervisorOptions};
use crate::sequence::{ShellDialect, Step};

const DEFAULT_CONFIG: &str = "stepdeck.toml";
const DEFAULT_MAX_LINES: usize = 5_000;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 500;
const LOG_ENV: &str = "STEPDECK_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "stepdeck",
    version,
    about = "Run multi-step project commands and watch their styled output",
    styles = help_styles(),
    color = clap::ColorChoice::Auto
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the configuration file (TOML, or JSON by extension).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any stepdeck.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Shell program used to run step scripts.
    #[arg(long, global = true)]
    shell: Option<String>,
    /// Script syntax for the shell.
    #[arg(long, value_enum, global = true)]
    dialect: Option<ShellDialect>,
    /// Max output lines kept per project.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// How long to keep reading output after a shell exits (ms).
    #[arg(long, global = true)]
    drain_timeout_ms: Option<u64>,
    /// Transcript path template (e.g. "logs/{name}-{time}.html").
    #[arg(long, global = true)]
    log_file: Option<String>,
    /// Where diagnostics go while the TUI is open.
    #[arg(long, global = true)]
    trace_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run projects without the TUI and exit with the first failing code.
    Run {
        /// Project ids to run; all configured projects when empty.
        ids: Vec<String>,
        /// Ad-hoc step; repeat for a sequence.
        #[arg(long = "step")]
        steps: Vec<String>,
        /// Working directory for the ad-hoc project.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Display name for the ad-hoc project.
        #[arg(long)]
        name: Option<String>,
        /// Print output without styles.
        #[arg(long)]
        no_color: bool,
        /// Final ad-hoc step: `-- <cmd> [args...]`.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List configured projects and their steps.
    List,
    /// Print the compiled script for a project.
    Script {
        id: String,
    },
    /// Write the configured projects as JSON.
    Export {
        path: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct RunSettings {
    shell: Option<String>,
    dialect: ShellDialect,
    max_lines: usize,
    drain_timeout: Duration,
    log_file: Option<String>,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config) -> Self {
        Self {
            shell: cli.shell.clone().or_else(|| config.shell.clone()),
            dialect: cli
                .dialect
                .or(config.dialect)
                .unwrap_or_else(ShellDialect::host),
            max_lines: cli
                .max_lines
                .or(config.max_lines)
                .unwrap_or(DEFAULT_MAX_LINES)
                .max(1),
            drain_timeout: Duration::from_millis(
                cli.drain_timeout_ms
                    .or(config.drain_timeout_ms)
                    .unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
            ),
            log_file: cli.log_file.clone().or_else(|| config.log_file.clone()),
        }
    }

    fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            shell: self.shell.clone(),
            dialect: self.dialect,
            drain_timeout: self.drain_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (specs, settings) = load_projects(&cli)?;

    match &cli.command {
        None => {
            if specs.is_empty() {
                bail!("no projects defined (add [[project]] entries to {})", DEFAULT_CONFIG);
            }
            init_tracing(TraceTarget::File(trace_path(&cli)))?;
            run_tui(specs, &settings).await
        }
        Some(Commands::Run {
            ids,
            steps,
            cwd,
            name,
            no_color,
            command,
        }) => {
            init_tracing(TraceTarget::Stderr)?;
            let adhoc = adhoc_project(steps, command, cwd.as_deref(), name.as_deref());
            let selected = select_projects(specs, ids, adhoc)?;
            let code = run_headless(selected, &settings, !no_color).await?;
            std::process::exit(code);
        }
        Some(Commands::List) => {
            list_projects(&specs);
            Ok(())
        }
        Some(Commands::Script { id }) => {
            let spec = find_project(&specs, id)?;
            let script = sequence::compile(&spec.steps, settings.dialect)
                .with_context(|| format!("project '{}'", spec.key))?;
            println!("{}", script.body());
            Ok(())
        }
        Some(Commands::Export { path }) => {
            config::export_config(&specs, path)?;
            println!("Exported {} projects to {}", specs.len(), path.display());
            Ok(())
        }
    }
}

fn load_projects(cli: &Cli) -> Result<(Vec<ProjectSpec>, RunSettings)> {
    let config_path = if cli.no_config {
        None
    } else {
        cli.config
            .clone()
            .or_else(default_config_path)
    };
    let (config, specs) = match config_path {
        Some(path) => {
            let config = config::load_config(&path)?;
            let base = path.parent().filter(|p| !p.as_os_str().is_empty());
            let specs = config
                .project_specs(base)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            (config, specs)
        }
        None => (Config::default(), Vec::new()),
    };
    let settings = RunSettings::from_cli(cli, &config);
    Ok((specs, settings))
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_CONFIG);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn find_project<'a>(specs: &'a [ProjectSpec], id: &str) -> Result<&'a ProjectSpec> {
    match specs.iter().find(|spec| spec.key.as_str() == id) {
        Some(spec) => Ok(spec),
        None => {
            let known: Vec<&str> = specs.iter().map(|spec| spec.key.as_str()).collect();
            bail!("unknown project '{}' (known: {})", id, known.join(", "))
        }
    }
}

fn adhoc_project(
    steps: &[String],
    command: &[String],
    cwd: Option<&Path>,
    name: Option<&str>,
) -> Option<ProjectSpec> {
    let mut steps: Vec<Step> = steps.iter().map(|step| Step::new(step.clone())).collect();
    if !command.is_empty() {
        steps.push(Step::new(shell_words::join(command)));
    }
    if steps.is_empty() {
        return None;
    }
    let name = name.unwrap_or("run").to_string();
    Some(ProjectSpec {
        key: ProjectKey::new(name.clone()),
        name,
        working_dir: cwd.map(Path::to_path_buf),
        steps,
    })
}

fn select_projects(
    specs: Vec<ProjectSpec>,
    ids: &[String],
    adhoc: Option<ProjectSpec>,
) -> Result<Vec<ProjectSpec>> {
    let mut selected = if ids.is_empty() {
        if adhoc.is_some() {
            Vec::new()
        } else {
            specs.clone()
        }
    } else {
        ids.iter()
            .map(|id| find_project(&specs, id).cloned())
            .collect::<Result<Vec<_>>>()?
    };
    if let Some(adhoc) = adhoc {
        if selected.iter().any(|spec| spec.key == adhoc.key) {
            bail!("ad-hoc project name '{}' clashes with a configured id", adhoc.key);
        }
        selected.push(adhoc);
    }
    if selected.is_empty() {
        bail!("nothing to run (configure projects or pass --step / -- <cmd>)");
    }
    Ok(selected)
}

fn list_projects(specs: &[ProjectSpec]) {
    if specs.is_empty() {
        println!("No projects configured.");
        return;
    }
    for spec in specs {
        let dir = spec
            .working_dir
            .as_ref()
            .map(|dir| format!(" ({})", dir.display()))
            .unwrap_or_default();
        println!("{} - {}{}", spec.key, spec.name, dir);
        for (index, step) in spec.steps.iter().enumerate() {
            println!("  {}. [{}] {}", index + 1, step.label(index), step.command);
        }
    }
}

enum TraceTarget {
    File(PathBuf),
    Stderr,
}

fn trace_path(cli: &Cli) -> PathBuf {
    cli.trace_file
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("stepdeck.log"))
}

fn init_tracing(target: TraceTarget) -> Result<()> {
    match target {
        TraceTarget::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open trace file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter("info"))
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        TraceTarget::Stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter("warn"))
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

async fn run_tui(specs: Vec<ProjectSpec>, settings: &RunSettings) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let mut supervisor = Supervisor::new(event_tx.clone(), settings.supervisor_options());
    let mut app = App::new(specs, settings.max_lines);
    let mut transcripts = Transcripts::new(settings.log_file.clone());

    let mut terminal = tui::init_terminal()?;
    spawn_input_listener(event_tx.clone());
    spawn_signal_listener(event_tx.clone());
    info!(projects = app.projects.len(), "tui started");

    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut dirty = true;
    let mut result = Ok(());
    loop {
        if dirty {
            if let Err(err) = tui::draw(&mut app, &mut terminal) {
                result = Err(err.into());
                break;
            }
            dirty = false;
        }
        tokio::select! {
            Some(event) = event_rx.recv() => {
                // Output is picked up by the next tick.
                let redraw = !matches!(event, Event::Output { .. });
                match event {
                    Event::Output { key, run, stream, runs } => {
                        if app.on_output(&key, run, stream, &runs) {
                            transcripts.write_runs(&key, &runs);
                        }
                    }
                    Event::Exited { key, run, code } => {
                        supervisor.on_exited(&key, run);
                        if app.on_exited(&key, run, code) {
                            transcripts.write_notice(&key, &exit_notice(code));
                            if let Some(index) = app.index_of(&key) {
                                let name = app.projects[index].spec.name.clone();
                                app.set_status_message(format!("{} {}", name, exit_notice(code)));
                            }
                        }
                    }
                    Event::ProcessError { key, message } => {
                        app.on_failed(&key, &message);
                        transcripts.write_notice(&key, &error_notice(&message));
                    }
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        handle_app_action(action, &mut app, &mut supervisor, &mut transcripts);
                    }
                    Event::Mouse(mouse) => {
                        app.handle_mouse(mouse);
                    }
                    Event::Resize => {}
                    Event::Shutdown => {
                        info!("shutdown requested");
                        app.should_quit = true;
                    }
                }
                dirty |= redraw;
            }
            _ = ticker.tick() => {
                // Elapsed times and status messages age even without events.
                dirty = true;
            }
        }
        if app.should_quit {
            break;
        }
    }

    let running = supervisor.running_keys();
    supervisor.stop_all();
    info!(?running, "stopped running projects");
    transcripts.finish();
    tui::restore_terminal(terminal)?;
    result
}

fn handle_app_action(
    action: AppAction,
    app: &mut App,
    supervisor: &mut Supervisor,
    transcripts: &mut Transcripts,
) {
    match action {
        AppAction::Start(index) => {
            let Some(spec) = app.projects.get(index).map(|p| p.spec.clone()) else {
                return;
            };
            let verb = if supervisor.is_running(&spec.key) {
                "Restarted"
            } else {
                "Started"
            };
            app.on_starting(index);
            transcripts.begin(&spec);
            match supervisor.start(spec.key.clone(), &spec.steps, spec.working_dir.as_deref()) {
                Ok(handle) => {
                    app.on_started(index, &handle);
                    app.set_status_message(format!(
                        "{} {} in {}",
                        verb,
                        spec.name,
                        handle.working_dir.display()
                    ));
                }
                // Reported through a ProcessError event.
                Err(StartError::Spawn { .. }) => {}
                Err(err) => {
                    app.on_failed(&spec.key, &err.to_string());
                    transcripts.write_notice(&spec.key, &error_notice(&err.to_string()));
                }
            }
        }
        AppAction::Stop(index) => {
            let Some(spec) = app.projects.get(index).map(|p| p.spec.clone()) else {
                return;
            };
            if supervisor.stop(&spec.key) {
                app.on_stopping(index);
                app.set_status_message(format!("Stopping {}", spec.name));
            } else {
                app.set_status_message(format!("{} is not running", spec.name));
            }
        }
        AppAction::Quit | AppAction::None => {}
    }
}

/// Runs `specs` to completion without the TUI and returns the process exit code.
async fn run_headless(specs: Vec<ProjectSpec>, settings: &RunSettings, color: bool) -> Result<i32> {
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let mut supervisor = Supervisor::new(event_tx.clone(), settings.supervisor_options());
    let mut transcripts = Transcripts::new(settings.log_file.clone());
    let mut printer = LinePrinter::new(&specs, color);
    spawn_signal_listener(event_tx.clone());

    // `None` while a spawn failure is still on its way through the channel.
    let mut waiting: HashMap<ProjectKey, Option<RunId>> = HashMap::new();
    let mut exit_code = 0;
    let mut record = |code: i32| {
        if exit_code == 0 && code != 0 {
            exit_code = code;
        }
    };

    for spec in &specs {
        for line in start_banner(&spec.steps) {
            printer.notice(&spec.key, &line);
        }
        transcripts.begin(spec);
        match supervisor.start(spec.key.clone(), &spec.steps, spec.working_dir.as_deref()) {
            Ok(handle) => {
                waiting.insert(handle.key, Some(handle.run));
            }
            Err(StartError::Spawn { .. }) => {
                waiting.insert(spec.key.clone(), None);
            }
            Err(err) => {
                let notice = error_notice(&err.to_string());
                printer.notice(&spec.key, &notice);
                transcripts.write_notice(&spec.key, &notice);
                record(1);
            }
        }
    }

    while !waiting.is_empty() {
        let Some(event) = event_rx.recv().await else {
            break;
        };
        match event {
            Event::Output { key, run, stream, runs } => {
                if waiting.get(&key) == Some(&Some(run)) {
                    printer.push(&key, stream, &runs);
                    transcripts.write_runs(&key, &runs);
                }
            }
            Event::Exited { key, run, code } => {
                supervisor.on_exited(&key, run);
                if waiting.get(&key) == Some(&Some(run)) {
                    waiting.remove(&key);
                    printer.flush(&key);
                    let notice = exit_notice(code);
                    printer.notice(&key, &notice);
                    transcripts.write_notice(&key, &notice);
                    record(code.unwrap_or(1));
                }
            }
            Event::ProcessError { key, message } => {
                if waiting.get(&key) == Some(&None) {
                    waiting.remove(&key);
                }
                let notice = error_notice(&message);
                printer.notice(&key, &notice);
                transcripts.write_notice(&key, &notice);
                record(1);
            }
            Event::Shutdown => {
                let stopped = supervisor.stop_all();
                warn!(stopped, "interrupted, stopping projects");
                record(130);
            }
            Event::Key(_) | Event::Mouse(_) | Event::Resize => {}
        }
    }

    supervisor.stop_all();
    transcripts.finish();
    Ok(exit_code)
}

/// Prints complete lines from each project's streams behind a colored `[name]` prefix.
struct LinePrinter {
    prefixes: HashMap<ProjectKey, StyledContent<String>>,
    pending: HashMap<(ProjectKey, StreamKind), Vec<StyledRun>>,
    color: bool,
}

const PREFIX_COLORS: [crossterm::style::Color; 6] = [
    crossterm::style::Color::Cyan,
    crossterm::style::Color::Green,
    crossterm::style::Color::Yellow,
    crossterm::style::Color::Magenta,
    crossterm::style::Color::Blue,
    crossterm::style::Color::Red,
];

impl LinePrinter {
    fn new(specs: &[ProjectSpec], color: bool) -> Self {
        let width = specs.iter().map(|s| s.name.chars().count()).max().unwrap_or(0);
        let prefixes = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let text = format!("[{:<width$}] ", spec.name, width = width);
                let style = ContentStyle {
                    foreground_color: Some(PREFIX_COLORS[index % PREFIX_COLORS.len()]),
                    ..ContentStyle::default()
                };
                (spec.key.clone(), StyledContent::new(style, text))
            })
            .collect();
        Self {
            prefixes,
            pending: HashMap::new(),
            color,
        }
    }

    fn push(&mut self, key: &ProjectKey, stream: StreamKind, runs: &[StyledRun]) {
        for line in split_lines(self.pending.entry((key.clone(), stream)).or_default(), runs) {
            self.print_line(key, stream, &line);
        }
    }

    fn flush(&mut self, key: &ProjectKey) {
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            if let Some(line) = self.pending.remove(&(key.clone(), stream)) {
                if !line.is_empty() {
                    self.print_line(key, stream, &line);
                }
            }
        }
    }

    fn notice(&mut self, key: &ProjectKey, text: &str) {
        let run = crate::app::notice_run(text.to_string(), None);
        self.print_line(key, StreamKind::Stdout, &[run]);
    }

    fn print_line(&self, key: &ProjectKey, stream: StreamKind, runs: &[StyledRun]) {
        let line = self.render_line(key, runs);
        let result = match stream {
            StreamKind::Stdout => writeln!(std::io::stdout().lock(), "{}", line),
            StreamKind::Stderr => writeln!(std::io::stderr().lock(), "{}", line),
        };
        if let Err(err) = result {
            warn!(error = %err, "failed to print output");
        }
    }

    /// The prefixed line as printed, with escape codes only when color is on.
    fn render_line(&self, key: &ProjectKey, runs: &[StyledRun]) -> String {
        let mut line = String::new();
        if let Some(prefix) = self.prefixes.get(key) {
            if self.color {
                line.push_str(&prefix.to_string());
            } else {
                line.push_str(prefix.content());
            }
        }
        for run in runs {
            match (&run.style, self.color) {
                (Some(style), true) => {
                    line.push_str(&StyledContent::new(style.to_content_style(), run.text.as_str()).to_string())
                }
                _ => line.push_str(&run.text),
            }
        }
        line
    }
}

/// Appends `runs` to `pending` and returns every line completed by a `\n`.
fn split_lines(pending: &mut Vec<StyledRun>, runs: &[StyledRun]) -> Vec<Vec<StyledRun>> {
    let mut lines = Vec::new();
    for run in runs {
        let text = run.text.replace('\r', "");
        let mut segments = text.split('\n').peekable();
        while let Some(segment) = segments.next() {
            if !segment.is_empty() {
                pending.push(StyledRun {
                    text: segment.to_string(),
                    style: run.style,
                });
            }
            if segments.peek().is_some() {
                lines.push(std::mem::take(pending));
            }
        }
    }
    lines
}

/// Per-project transcript files, opened on first start.
struct Transcripts {
    template: Option<String>,
    files: HashMap<ProjectKey, Transcript>,
}

impl Transcripts {
    fn new(template: Option<String>) -> Self {
        Self {
            template,
            files: HashMap::new(),
        }
    }

    fn begin(&mut self, spec: &ProjectSpec) {
        let Some(template) = self.template.as_deref() else {
            return;
        };
        if !self.files.contains_key(&spec.key) {
            let path = render_template(template, &spec.name, spec.key.as_str(), &log_timestamp());
            match Transcript::create(Path::new(&path)) {
                Ok(transcript) => {
                    info!(project = %spec.key, path = %transcript.path().display(), "writing transcript");
                    self.files.insert(spec.key.clone(), transcript);
                }
                Err(err) => {
                    warn!(project = %spec.key, error = %format!("{:#}", err), "transcript disabled");
                    return;
                }
            }
        }
        for line in start_banner(&spec.steps) {
            self.write_notice(&spec.key, &line);
        }
    }

    fn write_runs(&mut self, key: &ProjectKey, runs: &[StyledRun]) {
        if let Some(transcript) = self.files.get_mut(key) {
            if let Err(err) = transcript.write_runs(runs) {
                warn!(project = %key, error = %format!("{:#}", err), "transcript write failed");
                self.files.remove(key);
            }
        }
    }

    fn write_notice(&mut self, key: &ProjectKey, text: &str) {
        if let Some(transcript) = self.files.get_mut(key) {
            if let Err(err) = transcript.write_notice(text) {
                warn!(project = %key, error = %format!("{:#}", err), "transcript write failed");
                self.files.remove(key);
            }
        }
    }

    fn finish(&mut self) {
        for (key, transcript) in self.files.drain() {
            if let Err(err) = transcript.finish() {
                warn!(project = %key, error = %format!("{:#}", err), "transcript close failed");
            }
        }
    }
}

fn log_timestamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs().to_string()
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let sent = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => tx.blocking_send(Event::Key(key)),
                Ok(crossterm::event::Event::Mouse(mouse)) => tx.blocking_send(Event::Mouse(mouse)),
                Ok(crossterm::event::Event::Resize(..)) => tx.blocking_send(Event::Resize),
                _ => Ok(()),
            };
            if sent.is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                if tx.send(Event::Shutdown).await.is_err() {
                    break;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(Event::Shutdown).await.is_err() {
                    break;
                }
            }
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ansi::{Color, StyleState};

    fn spec(key: &str) -> ProjectSpec {
        ProjectSpec {
            key: ProjectKey::new(key),
            name: key.to_string(),
            working_dir: None,
            steps: vec![Step::new("true")],
        }
    }

    #[test]
    fn run_subcommand_collects_adhoc_steps() {
        let cli = Cli::try_parse_from([
            "stepdeck", "run", "--step", "npm ci", "--cwd", "web", "--", "npm", "run", "dev server",
        ])
        .unwrap();
        let Some(Commands::Run { ids, steps, cwd, command, .. }) = cli.command else {
            panic!("expected run");
        };
        assert!(ids.is_empty());
        let adhoc = adhoc_project(&steps, &command, cwd.as_deref(), None).unwrap();
        assert_eq!(adhoc.key.as_str(), "run");
        assert_eq!(adhoc.working_dir, Some(PathBuf::from("web")));
        assert_eq!(
            adhoc.steps,
            vec![Step::new("npm ci"), Step::new("npm run 'dev server'")]
        );
    }

    #[test]
    fn global_flags_override_config() {
        let cli = Cli::try_parse_from(["stepdeck", "list", "--max-lines", "10", "--dialect", "powershell"])
            .unwrap();
        let config = Config {
            shell: Some("/bin/bash".to_string()),
            max_lines: Some(99),
            drain_timeout_ms: Some(20),
            ..Config::default()
        };
        let settings = RunSettings::from_cli(&cli, &config);
        assert_eq!(settings.max_lines, 10);
        assert_eq!(settings.dialect, ShellDialect::PowerShell);
        assert_eq!(settings.shell.as_deref(), Some("/bin/bash"));
        assert_eq!(settings.drain_timeout, Duration::from_millis(20));
    }

    #[test]
    fn select_projects_by_id() {
        let specs = vec![spec("api"), spec("web")];
        let picked = select_projects(specs.clone(), &["web".to_string()], None).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].key.as_str(), "web");

        let all = select_projects(specs.clone(), &[], None).unwrap();
        assert_eq!(all.len(), 2);

        let err = select_projects(specs.clone(), &["nope".to_string()], None).unwrap_err();
        assert!(err.to_string().contains("unknown project 'nope'"));

        let only_adhoc = select_projects(specs.clone(), &[], Some(spec("tmp"))).unwrap();
        assert_eq!(only_adhoc.len(), 1);

        let clash = select_projects(specs, &["api".to_string()], Some(spec("api")));
        assert!(clash.is_err());
    }

    #[test]
    fn split_lines_keeps_styles_and_partials() {
        let red = StyleState {
            foreground: Some(Color::Red),
            ..StyleState::default()
        };
        let mut pending = Vec::new();
        let lines = split_lines(
            &mut pending,
            &[StyledRun::plain("a\r\nb"), StyledRun::styled("c\nd", red)],
        );
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], vec![StyledRun::plain("a")]);
        assert_eq!(lines[1], vec![StyledRun::plain("b"), StyledRun::styled("c", red)]);
        assert_eq!(pending, vec![StyledRun::styled("d", red)]);
    }

    #[test]
    fn printed_lines_carry_an_aligned_prefix() {
        let specs = vec![spec("api"), spec("frontend")];
        let bold = StyleState {
            bold: true,
            ..StyleState::default()
        };
        let runs = [StyledRun::plain("ready on "), StyledRun::styled(":8080", bold)];

        let plain = LinePrinter::new(&specs, false);
        assert_eq!(
            plain.render_line(&ProjectKey::new("api"), &runs),
            "[api     ] ready on :8080"
        );
        assert_eq!(
            plain.render_line(&ProjectKey::new("other"), &runs),
            "ready on :8080"
        );

        let colored = LinePrinter::new(&specs, true);
        let line = colored.render_line(&ProjectKey::new("frontend"), &runs);
        assert!(line.contains("[frontend] "));
        assert!(line.contains("\u{1b}[1m"));
        assert!(line.contains(":8080"));
    }

    #[test]
    fn explicit_config_resolves_relative_dirs() {
        let dir = std::env::temp_dir().join(format!("stepdeck-main-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("projects.toml");
        std::fs::write(
            &path,
            "max_lines = 42\n[[project]]\nid = \"api\"\nworking_dir = \"svc\"\ncommand = \"make\"\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from(["stepdeck", "list", "--config", path.to_str().unwrap()]).unwrap();
        let (specs, settings) = load_projects(&cli).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(settings.max_lines, 42);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].working_dir, Some(dir.join("svc")));

        let cli = Cli::try_parse_from(["stepdeck", "list", "--no-config"]).unwrap();
        let (specs, settings) = load_projects(&cli).unwrap();
        assert!(specs.is_empty());
        assert_eq!(settings.max_lines, DEFAULT_MAX_LINES);
    }
}
