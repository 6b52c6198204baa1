//! Application state and UI logic.
//!
//! `App` holds the state of every configured project and translates key and mouse input into
//! `AppAction`s. Supervisor events are applied through the `on_*` handlers, which check the
//! run id so output or exits from a replaced run never touch its successor.

use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};

use crate::ansi::{Color, StyleState, StyledRun};
use crate::output::StreamKind;
use crate::process::{ProjectKey, ProjectSpec, ProjectState, ProjectStatus};
use crate::runner::{RunHandle, RunId};
use crate::sequence::Step;

/// The main application state container.
#[derive(Debug)]
pub struct App {
    pub projects: Vec<ProjectState>,
    /// Index of the currently selected project.
    pub selected: usize,
    pub should_quit: bool,
    /// Height of the output area (for scrolling calculations).
    pub log_view_height: usize,
    /// Width of the project list (for mouse clicks).
    pub project_list_width: u16,
    pub show_help: bool,
    status_message: Option<StatusMessage>,
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    None,
    Quit,
    /// Start (or restart) a project.
    Start(usize),
    Stop(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Duration,
    level: StatusLevel,
}

impl App {
    /// Creates the UI state with every project idle and the first one selected.
    pub fn new(specs: Vec<ProjectSpec>, max_lines: usize) -> Self {
        Self {
            projects: specs
                .into_iter()
                .map(|spec| ProjectState::new(spec, max_lines))
                .collect(),
            selected: 0,
            should_quit: false,
            log_view_height: 0,
            project_list_width: 0,
            show_help: false,
            status_message: None,
        }
    }

    pub fn selected_project(&self) -> Option<&ProjectState> {
        self.projects.get(self.selected)
    }

    pub fn selected_project_mut(&mut self) -> Option<&mut ProjectState> {
        self.projects.get_mut(self.selected)
    }

    pub fn index_of(&self, key: &ProjectKey) -> Option<usize> {
        self.projects.iter().position(|p| &p.spec.key == key)
    }

    /// Clears the project's output and writes the step listing ahead of a start.
    pub fn on_starting(&mut self, index: usize) {
        let Some(project) = self.projects.get_mut(index) else {
            return;
        };
        project.output.clear();
        project.scroll = 0;
        project.follow = true;
        for line in start_banner(&project.spec.steps) {
            project.output.push_notice(notice_run(line, None));
        }
    }

    /// Records a successful spawn.
    pub fn on_started(&mut self, index: usize, handle: &RunHandle) {
        if let Some(project) = self.projects.get_mut(index) {
            project.status = ProjectStatus::Running;
            project.run = Some(handle.run);
            project.pid = handle.pid;
            project.started_at = Some(Instant::now());
        }
    }

    pub fn on_stopping(&mut self, index: usize) {
        if let Some(project) = self.projects.get_mut(index) {
            if project.is_active() {
                project.status = ProjectStatus::Stopping;
            }
        }
    }

    /// Appends runs for `key` if they belong to its current run.
    pub fn on_output(&mut self, key: &ProjectKey, run: RunId, stream: StreamKind, runs: &[StyledRun]) -> bool {
        let Some(index) = self.index_of(key) else {
            return false;
        };
        let project = &mut self.projects[index];
        if project.run != Some(run) {
            return false;
        }
        let dropped = project.output.push_runs(stream, runs);
        self.keep_scroll_anchored(index, dropped);
        true
    }

    /// Records the exit of `run`; ignored when `key` has since moved on to another run.
    pub fn on_exited(&mut self, key: &ProjectKey, run: RunId, code: Option<i32>) -> bool {
        let Some(index) = self.index_of(key) else {
            return false;
        };
        let project = &mut self.projects[index];
        if project.run != Some(run) {
            return false;
        }
        project.status = ProjectStatus::Exited { code };
        project.run = None;
        project.pid = None;
        let dropped = project.output.push_notice(notice_run(exit_notice(code), exit_color(code)));
        self.keep_scroll_anchored(index, dropped);
        true
    }

    /// Records a failure to start `key`.
    pub fn on_failed(&mut self, key: &ProjectKey, error: &str) {
        let Some(index) = self.index_of(key) else {
            return;
        };
        let project = &mut self.projects[index];
        project.status = ProjectStatus::Failed {
            error: error.to_string(),
        };
        project.run = None;
        project.pid = None;
        let dropped = project.output.push_notice(notice_run(error_notice(error), Some(Color::Red)));
        let name = project.spec.name.clone();
        self.keep_scroll_anchored(index, dropped);
        self.set_status_warning(format!("{}: {}", name, error));
    }

    // A frozen view keeps showing the same lines when the buffer drops its oldest ones.
    fn keep_scroll_anchored(&mut self, index: usize, dropped: usize) {
        let view = self.log_view_height.max(1);
        let project = &mut self.projects[index];
        let max_scroll = project.output.len().saturating_sub(view);
        if project.follow {
            project.scroll = max_scroll;
        } else {
            project.scroll = project.scroll.saturating_sub(dropped).min(max_scroll);
        }
    }

    /// Maps clicks in the project list and wheel scrolling.
    pub fn handle_mouse(&mut self, mouse: MouseEvent) -> AppAction {
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) if mouse.column < self.project_list_width => {
                // Border row, then two rows per project.
                let row = usize::from(mouse.row.saturating_sub(1)) / 2;
                if row < self.projects.len() {
                    self.select(row);
                }
            }
            MouseEventKind::ScrollDown => self.scroll_down(3),
            MouseEventKind::ScrollUp => self.scroll_up(3),
            _ => {}
        }
        AppAction::None
    }

    /// Handles a key press and returns the action the event loop must carry out.
    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if self.show_help {
            self.show_help = false;
            return match key.code {
                KeyCode::Char('q') => self.quit(),
                _ => AppAction::None,
            };
        }
        match key.code {
            KeyCode::Char('q') => self.quit(),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => self.quit(),
            KeyCode::Up | KeyCode::Char('k') => {
                if self.selected > 0 {
                    self.select(self.selected - 1);
                }
                AppAction::None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < self.projects.len() {
                    self.select(self.selected + 1);
                }
                AppAction::None
            }
            KeyCode::Tab => {
                if !self.projects.is_empty() {
                    self.select((self.selected + 1) % self.projects.len());
                }
                AppAction::None
            }
            KeyCode::Char('s') | KeyCode::Enter => self.selected_action(AppAction::Start),
            KeyCode::Char('x') => self.selected_action(AppAction::Stop),
            KeyCode::Char('c') => {
                if let Some(project) = self.selected_project_mut() {
                    project.output.clear();
                    project.scroll = 0;
                    project.follow = true;
                }
                AppAction::None
            }
            KeyCode::Char('f') => {
                self.toggle_follow();
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = true;
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.scroll_to_top();
                AppAction::None
            }
            KeyCode::End => {
                if let Some(project) = self.selected_project_mut() {
                    project.follow = true;
                }
                self.ensure_follow();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn quit(&mut self) -> AppAction {
        self.should_quit = true;
        AppAction::Quit
    }

    fn selected_action(&self, action: fn(usize) -> AppAction) -> AppAction {
        if self.selected < self.projects.len() {
            action(self.selected)
        } else {
            AppAction::None
        }
    }

    fn select(&mut self, index: usize) {
        self.selected = index;
        if self.selected_project().is_some_and(|p| p.follow) {
            self.ensure_follow();
        }
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let view = self.log_view_height.max(1);
        if let Some(project) = self.selected_project_mut() {
            let max_scroll = project.output.len().saturating_sub(view);
            let current = if project.follow {
                max_scroll
            } else {
                project.scroll
            };
            project.scroll = current.saturating_sub(amount).min(max_scroll);
            project.follow = false;
        }
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let view = self.log_view_height.max(1);
        if let Some(project) = self.selected_project_mut() {
            let max_scroll = project.output.len().saturating_sub(view);
            let current = if project.follow {
                max_scroll
            } else {
                project.scroll
            };
            let next = (current + amount).min(max_scroll);
            project.scroll = next;
            project.follow = next == max_scroll;
        }
    }

    pub fn scroll_to_top(&mut self) {
        if let Some(project) = self.selected_project_mut() {
            project.scroll = 0;
            project.follow = false;
        }
    }

    pub fn ensure_follow(&mut self) {
        let view = self.log_view_height.max(1);
        if let Some(project) = self.selected_project_mut() {
            project.scroll = project.output.len().saturating_sub(view);
        }
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let view = height.max(1);
        if let Some(project) = self.selected_project_mut() {
            let max_scroll = project.output.len().saturating_sub(view);
            if project.follow {
                project.scroll = max_scroll;
            } else {
                project.scroll = project.scroll.min(max_scroll);
            }
        }
    }

    fn toggle_follow(&mut self) {
        if let Some(project) = self.selected_project_mut() {
            project.follow = !project.follow;
            if project.follow {
                self.ensure_follow();
            }
        }
    }

    pub fn status_line(&self) -> String {
        let Some(project) = self.selected_project() else {
            return "No projects".to_string();
        };
        let pid = project
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        let elapsed = match (&project.status, project.started_at) {
            (ProjectStatus::Running | ProjectStatus::Stopping, Some(at)) => format_duration(at.elapsed()),
            _ => "-".into(),
        };
        format!(
            "{} | {} | pid: {} | steps: {} | lines: {} | elapsed: {} | follow: {}",
            project.spec.name,
            status_label(&project.status),
            pid,
            project.spec.steps.len(),
            project.output.len(),
            elapsed,
            if project.follow { "on" } else { "off" },
        )
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        (message.at.elapsed() < message.ttl).then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status(message, StatusLevel::Info, Duration::from_secs(3));
    }

    pub fn set_status_warning(&mut self, message: impl Into<String>) {
        self.set_status(message, StatusLevel::Warning, Duration::from_secs(5));
    }

    fn set_status(&mut self, message: impl Into<String>, level: StatusLevel, ttl: Duration) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}

pub fn status_label(status: &ProjectStatus) -> String {
    match status {
        ProjectStatus::Idle => "idle".to_string(),
        ProjectStatus::Running => "running".to_string(),
        ProjectStatus::Stopping => "stopping".to_string(),
        ProjectStatus::Exited { code: Some(code) } => format!("exited ({})", code),
        ProjectStatus::Exited { code: None } => "killed".to_string(),
        ProjectStatus::Failed { .. } => "failed".to_string(),
    }
}

/// Lines announcing the steps about to run.
pub fn start_banner(steps: &[Step]) -> Vec<String> {
    let mut lines = Vec::with_capacity(steps.len() + 2);
    lines.push(match steps.len() {
        1 => "Running 1 step:".to_string(),
        n => format!("Running {} steps:", n),
    });
    for (index, step) in steps.iter().enumerate() {
        lines.push(format!("{}. [{}] {}", index + 1, step.label(index), step.command));
    }
    lines.push("=".repeat(50));
    lines
}

pub fn exit_notice(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("[process exited with code {}]", code),
        None => "[process killed]".to_string(),
    }
}

pub fn error_notice(error: &str) -> String {
    format!("[error: {}]", error)
}

fn exit_color(code: Option<i32>) -> Option<Color> {
    match code {
        Some(0) => Some(Color::Green),
        _ => Some(Color::Red),
    }
}

/// A dim notice run, optionally colored.
pub fn notice_run(text: String, color: Option<Color>) -> StyledRun {
    StyledRun::styled(
        text,
        StyleState {
            dim: color.is_none(),
            foreground: color,
            ..StyleState::default()
        },
    )
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let minutes = secs / 60;
    let seconds = secs % 60;
    format!("{:02}:{:02}", minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputLine;

    fn make_spec(key: &str) -> ProjectSpec {
        ProjectSpec {
            key: ProjectKey::new(key),
            name: key.to_uppercase(),
            working_dir: None,
            steps: vec![Step::named("build", "make"), Step::new("./run")],
        }
    }

    fn make_app() -> App {
        let mut app = App::new(vec![make_spec("a"), make_spec("b")], 100);
        app.set_log_view_height(5);
        app
    }

    fn handle(key: &str, run: RunId) -> RunHandle {
        RunHandle {
            key: ProjectKey::new(key),
            run,
            pid: Some(42),
            working_dir: std::env::temp_dir(),
        }
    }

    fn press(app: &mut App, code: KeyCode) -> AppAction {
        app.handle_key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn texts(app: &App, index: usize) -> Vec<String> {
        app.projects[index].output.iter().map(OutputLine::plain_text).collect()
    }

    fn run_ids() -> (RunId, RunId) {
        (RunId::new(1), RunId::new(2))
    }

    #[test]
    fn start_banner_lists_steps() {
        let lines = start_banner(&make_spec("a").steps);
        assert_eq!(lines[0], "Running 2 steps:");
        assert_eq!(lines[1], "1. [build] make");
        assert_eq!(lines[2], "2. [step 2] ./run");
        assert_eq!(lines[3], "=".repeat(50));
    }

    #[test]
    fn keys_map_to_actions() {
        let mut app = make_app();
        assert_eq!(press(&mut app, KeyCode::Char('s')), AppAction::Start(0));
        assert_eq!(press(&mut app, KeyCode::Down), AppAction::None);
        assert_eq!(app.selected, 1);
        assert_eq!(press(&mut app, KeyCode::Enter), AppAction::Start(1));
        assert_eq!(press(&mut app, KeyCode::Char('x')), AppAction::Stop(1));
        assert_eq!(press(&mut app, KeyCode::Tab), AppAction::None);
        assert_eq!(app.selected, 0);
        assert_eq!(press(&mut app, KeyCode::Char('q')), AppAction::Quit);
        assert!(app.should_quit);
    }

    #[test]
    fn help_swallows_the_next_key() {
        let mut app = make_app();
        press(&mut app, KeyCode::Char('?'));
        assert!(app.show_help);
        assert_eq!(press(&mut app, KeyCode::Char('s')), AppAction::None);
        assert!(!app.show_help);
    }

    #[test]
    fn output_from_other_runs_is_ignored() {
        let mut app = make_app();
        let (old, new) = run_ids();
        let key = ProjectKey::new("a");
        app.on_starting(0);
        app.on_started(0, &handle("a", new));
        assert!(!app.on_output(&key, old, StreamKind::Stdout, &[StyledRun::plain("stale\n")]));
        assert!(app.on_output(&key, new, StreamKind::Stdout, &[StyledRun::plain("fresh\n")]));
        assert!(!app.on_exited(&key, old, Some(1)));
        assert_eq!(app.projects[0].status, ProjectStatus::Running);

        assert!(app.on_exited(&key, new, Some(0)));
        assert_eq!(app.projects[0].status, ProjectStatus::Exited { code: Some(0) });
        let lines = texts(&app, 0);
        assert!(!lines.iter().any(|l| l == "stale"));
        assert_eq!(lines[lines.len() - 2], "fresh");
        assert_eq!(lines[lines.len() - 1], "[process exited with code 0]");
    }

    #[test]
    fn stopping_then_killed() {
        let mut app = make_app();
        let (run, _) = run_ids();
        app.on_started(0, &handle("a", run));
        app.on_stopping(0);
        assert_eq!(app.projects[0].status, ProjectStatus::Stopping);
        app.on_exited(&ProjectKey::new("a"), run, None);
        assert_eq!(status_label(&app.projects[0].status), "killed");
        assert_eq!(texts(&app, 0).last().unwrap(), "[process killed]");
    }

    #[test]
    fn failure_is_shown_in_output_and_status() {
        let mut app = make_app();
        app.on_failed(&ProjectKey::new("b"), "failed to spawn /bin/sh: No such file");
        assert!(matches!(app.projects[1].status, ProjectStatus::Failed { .. }));
        assert_eq!(
            texts(&app, 1),
            vec!["[error: failed to spawn /bin/sh: No such file]"]
        );
        let (message, level) = app.status_message().unwrap();
        assert!(message.starts_with("B: "));
        assert_eq!(level, StatusLevel::Warning);
    }

    #[test]
    fn scrolling_leaves_and_regains_follow() {
        let mut app = make_app();
        let (run, _) = run_ids();
        let key = ProjectKey::new("a");
        app.on_started(0, &handle("a", run));
        let body: String = (0..20).map(|i| format!("line {}\n", i)).collect();
        app.on_output(&key, run, StreamKind::Stdout, &[StyledRun::plain(body)]);
        assert_eq!(app.projects[0].scroll, 15);

        press(&mut app, KeyCode::PageUp);
        assert!(!app.projects[0].follow);
        assert_eq!(app.projects[0].scroll, 10);

        app.on_output(&key, run, StreamKind::Stdout, &[StyledRun::plain("more\n")]);
        assert_eq!(app.projects[0].scroll, 10);

        press(&mut app, KeyCode::End);
        assert!(app.projects[0].follow);
        assert_eq!(app.projects[0].scroll, 16);

        press(&mut app, KeyCode::Home);
        assert_eq!(app.projects[0].scroll, 0);
        press(&mut app, KeyCode::Char('f'));
        assert!(app.projects[0].follow);
        assert_eq!(app.projects[0].scroll, 16);
    }

    #[test]
    fn clear_empties_the_selected_output() {
        let mut app = make_app();
        app.on_starting(0);
        assert!(!app.projects[0].output.is_empty());
        press(&mut app, KeyCode::Char('c'));
        assert!(app.projects[0].output.is_empty());
    }
}
