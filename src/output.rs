//! Buffering and transcripts of styled process output.
//!
//! `OutputBuffer` turns the append-only run stream of a project into display lines, keeping a
//! separate partial line per stream so interleaved stdout and stderr writes do not splice into
//! each other. `Transcript` mirrors the same runs into a file.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ansi::{escape_html, render_html, StyledRun};

/// Indicates the source stream of a chunk of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    fn index(self) -> usize {
        match self {
            StreamKind::Stdout => 0,
            StreamKind::Stderr => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One display line made of styled runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputLine {
    pub runs: Vec<StyledRun>,
    pub stream: Option<StreamKind>,
}

impl OutputLine {
    fn empty(stream: StreamKind) -> Self {
        Self {
            runs: Vec::new(),
            stream: Some(stream),
        }
    }

    fn push_run(&mut self, text: &str, run: &StyledRun) {
        if text.is_empty() {
            return;
        }
        match self.runs.last_mut() {
            Some(last) if last.style == run.style => last.text.push_str(text),
            _ => self.runs.push(StyledRun {
                text: text.to_string(),
                style: run.style,
            }),
        }
    }

    #[cfg(test)]
    pub fn plain_text(&self) -> String {
        self.runs.iter().map(|run| run.text.as_str()).collect()
    }
}

/// A fixed-capacity buffer of output lines for one project.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    max_lines: usize,
    lines: VecDeque<OutputLine>,
    partial: [Option<OutputLine>; 2],
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `max_lines` lines.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            partial: [None, None],
        }
    }

    /// Appends runs from `stream`, completing a line at every `\n`.
    ///
    /// Returns how many old lines were dropped to stay within capacity.
    pub fn push_runs(&mut self, stream: StreamKind, runs: &[StyledRun]) -> usize {
        let mut dropped = 0;
        for run in runs {
            let text = run.text.replace('\r', "");
            let mut segments = text.split('\n').peekable();
            while let Some(segment) = segments.next() {
                let slot = &mut self.partial[stream.index()];
                if !segment.is_empty() {
                    slot.get_or_insert_with(|| OutputLine::empty(stream))
                        .push_run(segment, run);
                }
                if segments.peek().is_some() {
                    let done = slot.take().unwrap_or_else(|| OutputLine::empty(stream));
                    dropped += self.push_line(done);
                }
            }
        }
        dropped
    }

    /// Appends a standalone line, closing any partial lines first.
    pub fn push_notice(&mut self, run: StyledRun) -> usize {
        let mut dropped = 0;
        for slot in 0..self.partial.len() {
            if let Some(line) = self.partial[slot].take() {
                dropped += self.push_line(line);
            }
        }
        dropped
            + self.push_line(OutputLine {
                runs: vec![run],
                stream: None,
            })
    }

    fn push_line(&mut self, line: OutputLine) -> usize {
        self.lines.push_back(line);
        let mut dropped = 0;
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Number of displayable lines, including unterminated ones.
    pub fn len(&self) -> usize {
        self.lines.len() + self.partial.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter().chain(self.partial.iter().flatten())
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial = [None, None];
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TranscriptFormat {
    Text,
    Html,
}

/// A per-project copy of output written to disk.
pub struct Transcript {
    path: PathBuf,
    format: TranscriptFormat,
    writer: BufWriter<File>,
}

impl Transcript {
    /// Creates the file (and parent directories); `.html` paths get escaped markup.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create transcript {}", path.display()))?;
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm") => {
                TranscriptFormat::Html
            }
            _ => TranscriptFormat::Text,
        };
        let mut transcript = Self {
            path: path.to_path_buf(),
            format,
            writer: BufWriter::new(file),
        };
        if format == TranscriptFormat::Html {
            transcript.write_raw("<pre class=\"stepdeck-output\">\n")?;
        }
        Ok(transcript)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends output runs, as escaped markup for HTML transcripts.
    pub fn write_runs(&mut self, runs: &[StyledRun]) -> Result<()> {
        let rendered = match self.format {
            TranscriptFormat::Html => render_html(runs),
            TranscriptFormat::Text => runs.iter().map(|run| run.text.as_str()).collect(),
        };
        self.write_raw(&rendered)
    }

    /// Appends a status line such as an exit notice on its own line.
    pub fn write_notice(&mut self, text: &str) -> Result<()> {
        let rendered = match self.format {
            TranscriptFormat::Html => format!("\n<em>{}</em>\n", escape_html(text)),
            TranscriptFormat::Text => format!("\n{}\n", text),
        };
        self.write_raw(&rendered)
    }

    /// Closes the markup of an HTML transcript.
    pub fn finish(mut self) -> Result<()> {
        if self.format == TranscriptFormat::Html {
            self.write_raw("</pre>\n")?;
        }
        Ok(())
    }

    fn write_raw(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(text.as_bytes())
            .and_then(|_| self.writer.flush())
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

/// Expands `{name}`, `{id}` and `{time}` in a transcript path template.
pub fn render_template(template: &str, name: &str, id: &str, time: &str) -> String {
    template
        .replace("{name}", &sanitize_name(name))
        .replace("{id}", &sanitize_name(id))
        .replace("{time}", time)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
