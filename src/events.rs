//! Event definitions for the application event loop.
//!
//! Process supervision, terminal input and OS signals all funnel into one `Event` channel
//! so a single loop owns every state transition.

use crossterm::event::{KeyEvent, MouseEvent};

use crate::ansi::StyledRun;
use crate::output::StreamKind;
use crate::process::ProjectKey;
use crate::runner::RunId;

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// Styled output decoded from one of a run's streams.
    Output {
        key: ProjectKey,
        run: RunId,
        stream: StreamKind,
        runs: Vec<StyledRun>,
    },
    /// A run's process exited; `None` means it was killed by a signal.
    Exited {
        key: ProjectKey,
        run: RunId,
        code: Option<i32>,
    },
    /// The shell for a project could not be spawned.
    ProcessError { key: ProjectKey, message: String },
    /// A keyboard event received from the user.
    Key(KeyEvent),
    Mouse(MouseEvent),
    /// The terminal window was resized.
    Resize,
    /// Ctrl-C or SIGTERM was received.
    Shutdown,
}
