//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the project list, the styled output of the selected project and the footer.

use std::io::{self, Stdout};

use crossterm::event::{DisableMouseCapture, EnableMouseCapture};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph};
use ratatui::Terminal;

use crate::app::{status_label, App, StatusLevel};
use crate::output::{OutputLine, StreamKind};
use crate::process::{ProjectState, ProjectStatus};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    Ok(())
}

const HELP_HINT: &str =
    "Up/Down select | s start | x stop | c clear | PgUp/PgDn scroll | f follow | q quit | ? help";

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    let title = window_title(app);
    execute!(terminal.backend_mut(), SetTitle(title))?;
    terminal.draw(|frame| {
        let area = frame.size();
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(4)])
            .split(area);
        let main = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(28), Constraint::Percentage(72)])
            .split(vertical[0]);

        app.project_list_width = main[0].width;
        let border_style = Style::default().fg(Color::DarkGray);

        let items: Vec<ListItem> = app
            .projects
            .iter()
            .enumerate()
            .map(|(index, project)| project_item(project, index == app.selected))
            .collect();
        let list = List::new(items)
            .block(
                Block::default()
                    .title("Projects")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded)
                    .border_style(border_style),
            )
            .highlight_style(Style::default().add_modifier(Modifier::BOLD));
        let mut state = ListState::default();
        if !app.projects.is_empty() {
            state.select(Some(app.selected.min(app.projects.len() - 1)));
        }
        frame.render_stateful_widget(list, main[0], &mut state);

        let output_block = Block::default()
            .title(output_title(app))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style);
        let output_area = output_block.inner(main[1]);
        let height = output_area.height as usize;
        app.set_log_view_height(height);

        let lines = app
            .selected_project()
            .map(|project| visible_lines(project, height, output_area.width as usize))
            .unwrap_or_default();
        let empty = app.selected_project().map_or(true, |p| p.output.is_empty());
        frame.render_widget(Paragraph::new(Text::from(lines)).block(output_block), main[1]);
        if empty {
            let placeholder = Paragraph::new("No output yet")
                .style(Style::default().fg(Color::DarkGray));
            frame.render_widget(placeholder, output_area);
        }

        let (hint, hint_style) = match app.status_message() {
            Some((message, StatusLevel::Warning)) => (message.to_string(), Style::default().fg(Color::Yellow)),
            Some((message, StatusLevel::Info)) => (message.to_string(), Style::default().fg(Color::Cyan)),
            None => (HELP_HINT.to_string(), Style::default().fg(Color::DarkGray)),
        };
        let footer = Paragraph::new(Text::from(vec![
            Line::from(Span::raw(app.status_line())),
            Line::from(Span::styled(hint, hint_style)),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(footer, vertical[1]);

        if app.show_help {
            let popup_area = centered_rect(60, 60, area);
            let help_text = [
                "Navigation:",
                "  Up/Down    Select project",
                "  Tab        Cycle selection",
                "  PageUp/Dn  Scroll output",
                "  Home/End   Scroll to top/bottom",
                "",
                "Actions:",
                "  s / Enter  Start (restarts if running)",
                "  x          Stop (kills the whole tree)",
                "  c          Clear output",
                "  f          Toggle auto-follow",
                "",
                "General:",
                "  ?          Toggle this help",
                "  q          Quit (stops everything)",
            ]
            .join("\n");
            let help_block = Paragraph::new(help_text)
                .block(
                    Block::default()
                        .title("Help")
                        .borders(Borders::ALL)
                        .border_type(BorderType::Rounded),
                )
                .style(Style::default().bg(Color::DarkGray).fg(Color::White));
            frame.render_widget(Clear, popup_area);
            frame.render_widget(help_block, popup_area);
        }
    })?;
    Ok(())
}

fn project_item(project: &ProjectState, selected: bool) -> ListItem<'static> {
    let (indent, name_style) = if selected {
        ("▶ ", Style::default().add_modifier(Modifier::BOLD))
    } else {
        ("  ", Style::default().fg(Color::Gray))
    };
    let status = status_style(&project.status);
    let mut lines = vec![Line::from(vec![
        Span::styled(indent, Style::default().fg(Color::Cyan)),
        Span::styled(format!("[{}] ", status_char(&project.status)), status),
        Span::styled(project.spec.name.clone(), name_style),
    ])];
    let steps = match project.spec.steps.len() {
        1 => "1 step".to_string(),
        n => format!("{} steps", n),
    };
    lines.push(Line::from(Span::styled(
        format!("    {} · {}", steps, status_label(&project.status)),
        Style::default().fg(Color::DarkGray),
    )));
    ListItem::new(Text::from(lines))
}

/// The slice of `project`'s output that fits a `height` x `width` pane at its scroll position.
fn visible_lines(project: &ProjectState, height: usize, width: usize) -> Vec<Line<'static>> {
    if height == 0 {
        return Vec::new();
    }
    let total = project.output.len();
    let max_scroll = total.saturating_sub(height);
    let start = if project.follow {
        max_scroll
    } else {
        project.scroll.min(max_scroll)
    };
    project
        .output
        .iter()
        .skip(start)
        .take(height)
        .map(|line| render_line(line, width))
        .collect()
}

fn render_line(line: &OutputLine, width: usize) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::with_capacity(line.runs.len() + 1);
    if line.stream == Some(StreamKind::Stderr) {
        spans.push(Span::styled("▍", Style::default().fg(Color::Red)));
    }
    spans.extend(line.runs.iter().map(|run| run.to_span()));
    Line::from(truncate_spans(expand_tabs(spans), width.saturating_sub(1)))
}

fn expand_tabs(spans: Vec<Span<'static>>) -> Vec<Span<'static>> {
    spans
        .into_iter()
        .map(|span| {
            if span.content.contains('\t') {
                Span::styled(span.content.replace('\t', "    "), span.style)
            } else {
                span
            }
        })
        .collect()
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn window_title(app: &App) -> String {
    match app.selected_project() {
        Some(project) => format!("stepdeck · {}", project.spec.name),
        None => "stepdeck".to_string(),
    }
}

fn output_title(app: &App) -> String {
    let Some(project) = app.selected_project() else {
        return "Output".to_string();
    };
    let dir = project
        .spec
        .working_dir
        .as_ref()
        .map(|dir| format!(" in {}", dir.display()))
        .unwrap_or_default();
    format!("Output - {}{} ({})", project.spec.name, dir, status_label(&project.status))
}

fn status_char(status: &ProjectStatus) -> char {
    match status {
        ProjectStatus::Idle => '·',
        ProjectStatus::Running => '▲',
        ProjectStatus::Stopping => '↻',
        ProjectStatus::Exited { .. } | ProjectStatus::Failed { .. } => '■',
    }
}

fn status_style(status: &ProjectStatus) -> Style {
    match status {
        ProjectStatus::Idle => Style::default().fg(Color::DarkGray),
        ProjectStatus::Stopping => Style::default().fg(Color::Yellow),
        ProjectStatus::Running => Style::default().fg(Color::Green),
        ProjectStatus::Exited { code: Some(0) } => Style::default().fg(Color::Gray),
        ProjectStatus::Exited { .. } | ProjectStatus::Failed { .. } => {
            Style::default().fg(Color::Red)
        }
    }
}

fn truncate_spans(spans: Vec<Span<'static>>, max: usize) -> Vec<Span<'static>> {
    if max == 0 {
        return Vec::new();
    }
    let total_len: usize = spans.iter().map(|span| span.content.chars().count()).sum();
    if total_len <= max {
        return spans;
    }

    let mut remaining = max.saturating_sub(1);
    let mut out = Vec::new();
    for span in spans {
        if remaining == 0 {
            break;
        }
        let content = span.content.as_ref();
        let count = content.chars().count();
        if count <= remaining {
            out.push(span);
            remaining -= count;
        } else {
            let truncated = content.chars().take(remaining).collect::<String>();
            out.push(Span::styled(truncated, span.style));
            remaining = 0;
        }
    }

    if let Some(last) = out.last_mut() {
        let mut content = last.content.to_string();
        content.push('~');
        last.content = content.into();
    } else {
        out.push(Span::raw("~"));
    }
    out
}
