//! Process execution and supervision.
//!
//! `Supervisor` owns the registry of running projects: at most one process per key, started
//! from a compiled step script and killed together with everything it spawned. Each run gets
//! one pump task per output stream that decodes and styles its chunks in arrival order, and a
//! waiter task that reports the exit once the pumps have flushed.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ansi::{AnsiStream, StyledRun};
use crate::decode::StreamDecoder;
use crate::events::Event;
use crate::output::StreamKind;
use crate::process::ProjectKey;
use crate::sequence::{self, SequenceError, ShellDialect, Step};

const READ_CHUNK: usize = 8 * 1024;

/// Identifies one spawn of a project; a key gets a new run every time it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(u64);

#[cfg(test)]
impl RunId {
    pub(crate) fn new(id: u64) -> Self {
        RunId(id)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid step sequence: {0}")]
    InvalidSequence(#[from] SequenceError),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// What a successful `start` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub key: ProjectKey,
    pub run: RunId,
    pub pid: Option<u32>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Shell program; the dialect's default when unset.
    pub shell: Option<String>,
    pub dialect: ShellDialect,
    /// How long to keep reading output after the shell exits.
    pub drain_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            shell: None,
            dialect: ShellDialect::host(),
            drain_timeout: Duration::from_millis(500),
        }
    }
}

struct RunningProcess {
    run: RunId,
    pid: Option<u32>,
    // Held so the child's stdin stays open for as long as it is registered.
    _stdin: Option<ChildStdin>,
}

/// Owns every running project process.
pub struct Supervisor {
    processes: HashMap<ProjectKey, RunningProcess>,
    event_tx: mpsc::Sender<Event>,
    options: SupervisorOptions,
    next_run: u64,
}

impl Supervisor {
    /// Creates a new `Supervisor` that reports on `event_tx`.
    pub fn new(event_tx: mpsc::Sender<Event>, options: SupervisorOptions) -> Self {
        Self {
            processes: HashMap::new(),
            event_tx,
            options,
            next_run: 0,
        }
    }

    /// Compiles `steps` and starts them under `key`.
    ///
    /// A process already registered under `key` is killed first. Output, exit and spawn
    /// failures are reported on the event channel.
    pub fn start(
        &mut self,
        key: ProjectKey,
        steps: &[Step],
        working_dir: Option<&Path>,
    ) -> Result<RunHandle, StartError> {
        let script = sequence::compile(steps, self.options.dialect)?;
        let working_dir = resolve_working_dir(working_dir);

        if let Some(previous) = self.processes.remove(&key) {
            info!(project = %key, run = %previous.run, "replacing running process");
            terminate(&key, &previous);
        }

        let (program, args) = script.invocation(self.options.shell.as_deref());
        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        }

        // Own process group, so the whole tree can be signalled at once.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let message = format!("failed to spawn {}: {}", program, source);
                warn!(project = %key, dir = %working_dir.display(), "{}", message);
                self.report_error(key, message);
                return Err(StartError::Spawn { program, source });
            }
        };

        self.next_run += 1;
        let run = RunId(self.next_run);
        let pid = child.id();
        info!(project = %key, run = %run, pid = ?pid, dir = %working_dir.display(), steps = steps.len(), "started");

        let (drain_tx, drain_rx) = watch::channel(false);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let pump = Pump::new(&key, run, StreamKind::Stdout, &self.event_tx, &drain_rx);
            pumps.push(tokio::spawn(pump.run(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            let pump = Pump::new(&key, run, StreamKind::Stderr, &self.event_tx, &drain_rx);
            pumps.push(tokio::spawn(pump.run(stderr)));
        }
        let stdin = child.stdin.take();
        tokio::spawn(wait_for_exit(
            key.clone(),
            run,
            child,
            Drain {
                pumps,
                stop: drain_tx,
                timeout: self.options.drain_timeout,
            },
            self.event_tx.clone(),
        ));

        self.processes.insert(
            key.clone(),
            RunningProcess {
                run,
                pid,
                _stdin: stdin,
            },
        );
        Ok(RunHandle {
            key,
            run,
            pid,
            working_dir,
        })
    }

    /// Kills the process tree registered under `key`.
    ///
    /// Returns `false` if nothing was registered. Does not wait for the process to die; its
    /// `Exited` event arrives later.
    pub fn stop(&mut self, key: &ProjectKey) -> bool {
        let Some(process) = self.processes.remove(key) else {
            return false;
        };
        info!(project = %key, run = %process.run, "stopping");
        terminate(key, &process);
        true
    }

    /// Stops every registered process; used on shutdown.
    pub fn stop_all(&mut self) -> usize {
        let keys: Vec<ProjectKey> = self.processes.keys().cloned().collect();
        keys.iter().filter(|key| self.stop(key)).count()
    }

    /// Whether `key` has a registered process.
    pub fn is_running(&self, key: &ProjectKey) -> bool {
        self.processes.contains_key(key)
    }

    /// The run currently registered under `key`.
    pub fn current_run(&self, key: &ProjectKey) -> Option<RunId> {
        self.processes.get(key).map(|process| process.run)
    }

    /// Keys with a registered process, sorted.
    pub fn running_keys(&self) -> Vec<ProjectKey> {
        let mut keys: Vec<ProjectKey> = self.processes.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Records the exit of `run`.
    ///
    /// Deregisters `key` only when `run` is still the registered run, so a late exit from a
    /// replaced or stopped process never removes its successor. Returns whether it did.
    pub fn on_exited(&mut self, key: &ProjectKey, run: RunId) -> bool {
        if self.current_run(key) != Some(run) {
            return false;
        }
        self.processes.remove(key);
        true
    }

    fn report_error(&self, key: ProjectKey, message: String) {
        // Sent from a task: the caller is usually the loop draining this channel.
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Event::ProcessError { key, message }).await;
        });
    }
}

fn resolve_working_dir(working_dir: Option<&Path>) -> PathBuf {
    match working_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

fn terminate(key: &ProjectKey, process: &RunningProcess) {
    let Some(pid) = process.pid else {
        return;
    };
    if let Err(err) = kill_process_tree(pid) {
        warn!(project = %key, run = %process.run, pid, error = %err, "failed to kill process tree");
    }
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let (group, direct) = unsafe { (libc::kill(-pid, libc::SIGKILL), libc::kill(pid, libc::SIGKILL)) };
    if group == 0 || direct == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) -> std::io::Result<()> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process tree termination is not supported on this platform",
    ))
}

// Decodes and styles one stream in arrival order.
struct Pump {
    key: ProjectKey,
    run: RunId,
    stream: StreamKind,
    tx: mpsc::Sender<Event>,
    stop: watch::Receiver<bool>,
}

impl Pump {
    fn new(
        key: &ProjectKey,
        run: RunId,
        stream: StreamKind,
        tx: &mpsc::Sender<Event>,
        stop: &watch::Receiver<bool>,
    ) -> Self {
        Self {
            key: key.clone(),
            run,
            stream,
            tx: tx.clone(),
            stop: stop.clone(),
        }
    }

    /// Reads until EOF or until the drain window closes, then flushes residual state.
    async fn run<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let Pump {
            key,
            run,
            stream,
            tx,
            mut stop,
        } = self;
        let mut decoder = StreamDecoder::default();
        let mut styles = AnsiStream::default();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = tokio::select! {
                biased;
                _ = stop.wait_for(|closed| *closed) => {
                    debug!(project = %key, run = %run, stream = stream.as_str(), "output still open after exit, abandoning it");
                    break;
                }
                read = reader.read(&mut chunk) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.push(&chunk[..n]);
                    let runs = styles.push(&text);
                    send_output(&tx, &key, run, stream, runs).await;
                }
                Err(err) => {
                    debug!(project = %key, run = %run, stream = stream.as_str(), error = %err, "read failed");
                    break;
                }
            }
        }
        if decoder.pending() > 0 {
            debug!(project = %key, run = %run, stream = stream.as_str(), bytes = decoder.pending(), "stream ended mid-character");
        }
        if !styles.style().is_default() {
            debug!(project = %key, run = %run, stream = stream.as_str(), "stream ended with styles still set");
        }
        let tail = decoder.finish();
        let mut runs = styles.push(&tail);
        runs.extend(styles.finish());
        send_output(&tx, &key, run, stream, runs).await;
    }
}

async fn send_output(
    tx: &mpsc::Sender<Event>,
    key: &ProjectKey,
    run: RunId,
    stream: StreamKind,
    runs: Vec<StyledRun>,
) {
    if runs.is_empty() {
        return;
    }
    let _ = tx
        .send(Event::Output {
            key: key.clone(),
            run,
            stream,
            runs,
        })
        .await;
}

// Pumps of one run and the signal that ends their drain window.
struct Drain {
    pumps: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
    timeout: Duration,
}

async fn wait_for_exit(
    key: ProjectKey,
    run: RunId,
    mut child: Child,
    drain: Drain,
    tx: mpsc::Sender<Event>,
) {
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(project = %key, run = %run, error = %err, "failed to wait for process");
            None
        }
    };

    // A background grandchild may still hold the pipes open after the shell is gone.
    let deadline = tokio::time::Instant::now() + drain.timeout;
    let mut pumps = drain.pumps.into_iter();
    let mut late = Vec::new();
    for mut pump in pumps.by_ref() {
        if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
            late.push(pump);
            break;
        }
    }
    if !late.is_empty() {
        let _ = drain.stop.send(true);
        late.extend(pumps);
        for pump in late {
            if let Err(err) = pump.await {
                warn!(project = %key, run = %run, error = %err, "output task failed");
            }
        }
    }

    info!(project = %key, run = %run, code = ?code, "exited");
    let _ = tx.send(Event::Exited { key, run, code }).await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn supervisor() -> (Supervisor, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(256);
        let options = SupervisorOptions {
            shell: Some("/bin/sh".to_string()),
            dialect: ShellDialect::Posix,
            drain_timeout: Duration::from_millis(500),
        };
        (Supervisor::new(tx, options), rx)
    }

    fn steps(commands: &[&str]) -> Vec<Step> {
        commands.iter().map(|c| Step::new(*c)).collect()
    }

    struct Collected {
        stdout: String,
        stderr: String,
        runs: Vec<StyledRun>,
        code: Option<i32>,
    }

    // Gathers events for `run` until it exits, feeding the exit back to the supervisor.
    async fn collect_run(
        supervisor: &mut Supervisor,
        rx: &mut mpsc::Receiver<Event>,
        run: RunId,
    ) -> Collected {
        let mut collected = Collected {
            stdout: String::new(),
            stderr: String::new(),
            runs: Vec::new(),
            code: None,
        };
        loop {
            let event = tokio::time::timeout(TIMEOUT, rx.recv())
                .await
                .expect("timed out waiting for events")
                .expect("channel closed");
            match event {
                Event::Output { run: r, stream, runs, .. } if r == run => {
                    let text: String = runs.iter().map(|run| run.text.as_str()).collect();
                    match stream {
                        StreamKind::Stdout => collected.stdout.push_str(&text),
                        StreamKind::Stderr => collected.stderr.push_str(&text),
                    }
                    collected.runs.extend(runs);
                }
                Event::Exited { key, run: r, code } if r == run => {
                    supervisor.on_exited(&key, r);
                    collected.code = code;
                    return collected;
                }
                _ => {}
            }
        }
    }

    fn group_alive(pid: u32) -> bool {
        unsafe { libc::kill(-(pid as libc::pid_t), 0) == 0 }
    }

    #[tokio::test]
    async fn runs_steps_and_reports_exit() {
        let (mut supervisor, mut rx) = supervisor();
        let key = ProjectKey::new("p1");
        let handle = supervisor
            .start(key.clone(), &steps(&["echo A", "echo B"]), None)
            .unwrap();
        assert!(supervisor.is_running(&key));
        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert_eq!(collected.stdout, "A\nB\n");
        assert_eq!(collected.code, Some(0));
        assert!(!supervisor.is_running(&key));
    }

    #[tokio::test]
    async fn failing_step_short_circuits_the_rest() {
        let (mut supervisor, mut rx) = supervisor();
        let key = ProjectKey::new("p1");
        let handle = supervisor
            .start(key.clone(), &steps(&["exit 1", "echo never"]), None)
            .unwrap();
        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert!(!collected.stdout.contains("never"));
        assert_eq!(collected.code, Some(1));

        let handle = supervisor
            .start(key.clone(), &steps(&["false", "echo never"]), None)
            .unwrap();
        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert!(!collected.stdout.contains("never"));
        assert_eq!(collected.code, Some(1));
    }

    #[tokio::test]
    async fn stderr_is_reported_separately() {
        let (mut supervisor, mut rx) = supervisor();
        let handle = supervisor
            .start(ProjectKey::new("p"), &steps(&["echo out; echo oops 1>&2"]), None)
            .unwrap();
        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert_eq!(collected.stdout, "out\n");
        assert_eq!(collected.stderr, "oops\n");
    }

    #[tokio::test]
    async fn output_is_styled() {
        let (mut supervisor, mut rx) = supervisor();
        let handle = supervisor
            .start(
                ProjectKey::new("p"),
                &steps(&[r"printf '\033[1;31mHi\033[0m there'"]),
                None,
            )
            .unwrap();
        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert_eq!(collected.runs.len(), 2);
        assert_eq!(collected.runs[0].text, "Hi");
        let style = collected.runs[0].style.expect("styled run");
        assert!(style.bold);
        assert_eq!(style.foreground, Some(crate::ansi::Color::Red));
        assert_eq!(collected.runs[1], StyledRun::plain(" there"));
    }

    #[tokio::test]
    async fn working_directory_is_used() {
        let (mut supervisor, mut rx) = supervisor();
        let dir = std::env::temp_dir().canonicalize().unwrap();
        let handle = supervisor
            .start(ProjectKey::new("p"), &steps(&["pwd -P"]), Some(&dir))
            .unwrap();
        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert_eq!(collected.stdout.trim_end(), dir.to_string_lossy());
    }

    #[tokio::test]
    async fn stop_kills_the_whole_tree() {
        let (mut supervisor, mut rx) = supervisor();
        let key = ProjectKey::new("p1");
        let handle = supervisor
            .start(key.clone(), &steps(&["echo A; sleep 30 & sleep 30"]), None)
            .unwrap();
        let pid = handle.pid.expect("pid");
        assert!(supervisor.stop(&key));
        assert!(!supervisor.is_running(&key));
        assert!(!supervisor.stop(&key));

        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert_eq!(collected.code, None);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while group_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!group_alive(pid), "process group still alive");

        // No second exit for the same run.
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(extra, Ok(Some(Event::Exited { .. }))));
    }

    #[tokio::test]
    async fn starting_a_running_key_replaces_the_old_process() {
        let (mut supervisor, mut rx) = supervisor();
        let key = ProjectKey::new("p");
        let first = supervisor.start(key.clone(), &steps(&["sleep 30"]), None).unwrap();
        let second = supervisor.start(key.clone(), &steps(&["sleep 30"]), None).unwrap();
        assert_ne!(first.run, second.run);
        assert_eq!(supervisor.running_keys(), vec![key.clone()]);
        assert_eq!(supervisor.current_run(&key), Some(second.run));

        let old = collect_run(&mut supervisor, &mut rx, first.run).await;
        assert_eq!(old.code, None);
        // The stale exit must not deregister the replacement.
        assert!(supervisor.is_running(&key));
        assert_eq!(supervisor.current_run(&key), Some(second.run));

        assert_eq!(supervisor.stop_all(), 1);
        assert!(!supervisor.is_running(&key));
        collect_run(&mut supervisor, &mut rx, second.run).await;
    }

    #[tokio::test]
    async fn empty_sequence_is_rejected_before_spawn() {
        let (mut supervisor, mut rx) = supervisor();
        let err = supervisor.start(ProjectKey::new("p"), &[], None).unwrap_err();
        assert!(matches!(err, StartError::InvalidSequence(SequenceError::Empty)));
        assert!(supervisor.running_keys().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_once() {
        let (mut supervisor, mut rx) = supervisor();
        let key = ProjectKey::new("p");
        let missing = Path::new("/definitely/not/a/real/dir");
        let err = supervisor
            .start(key.clone(), &steps(&["echo hi"]), Some(missing))
            .unwrap_err();
        assert!(matches!(err, StartError::Spawn { .. }));
        assert!(!supervisor.is_running(&key));

        let event = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        match event {
            Event::ProcessError { key: k, message } => {
                assert_eq!(k, key);
                assert!(message.contains("failed to spawn"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn multibyte_output_survives_chunking() {
        let (mut supervisor, mut rx) = supervisor();
        let handle = supervisor
            .start(
                ProjectKey::new("p"),
                &steps(&[r"printf 'caf\303'; sleep 0.1; printf '\251\n'"]),
                None,
            )
            .unwrap();
        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert_eq!(collected.stdout, "café\n");
    }

    #[tokio::test]
    async fn residue_is_flushed_when_the_drain_window_closes() {
        let (tx, mut rx) = mpsc::channel(256);
        let options = SupervisorOptions {
            shell: Some("/bin/sh".to_string()),
            dialect: ShellDialect::Posix,
            drain_timeout: Duration::from_millis(300),
        };
        let mut supervisor = Supervisor::new(tx, options);
        let started = tokio::time::Instant::now();
        let handle = supervisor
            .start(
                ProjectKey::new("p"),
                &steps(&[r"printf 'caf\303'; sleep 3 &"]),
                None,
            )
            .unwrap();
        let collected = collect_run(&mut supervisor, &mut rx, handle.run).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(collected.code, Some(0));
        assert_eq!(collected.stdout, "caf\u{fffd}");
    }
}
