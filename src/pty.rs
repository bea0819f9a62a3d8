//! PTY-backed command execution.
//!
//! Each [`Process`] owns one child command spawned inside a pseudo-terminal,
//! a VT-100 parser holding the rendered screen and scrollback, and the reader
//! and writer threads that connect the two. Consumers observe the terminal
//! through [`Process::output`], a stream of [`Frame`] snapshots driven by a
//! lossy generation counter, so slow consumers never stall the reader.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anstyle::{AnsiColor, Color, Reset, Style};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error};
use parking_lot::Mutex;
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize,
};
use thiserror::Error;
use tokio::sync::watch;

use crate::command::Command;

/// Scrollback rows kept per process unless the command overrides it.
const DEFAULT_SCROLLBACK: usize = 3500;
/// Read chunk size for the PTY master.
const READ_CHUNK: usize = 1024;
/// Writer queue depth; a full queue blocks the caller until drained.
const WRITE_QUEUE_DEPTH: usize = 1000;
/// Grace period between SIGTERM and the forceful kill.
const KILL_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for the child to disappear after the forceful kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Errors that can occur while setting up a PTY process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Unable to open PTY: {0}")]
    Pty(String),
    #[error("Unable to spawn command: {0}")]
    Spawn(String),
    #[error("Terminal size {cols}x{rows} has a zero dimension")]
    InvalidSize { cols: u16, rows: u16 },
}

/// Lifecycle of a PTY process. Transitions are one-way: once a terminal
/// state is reached it never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The PTY is being set up.
    Starting,
    /// The child is running.
    Running,
    /// The child exited on its own with this code.
    Exited(u32),
    /// The child was terminated through [`Process::kill`] or by dropping
    /// the handle.
    Killed,
    /// The PTY failed irrecoverably.
    Crashed(String),
}

impl ProcessStatus {
    fn is_final(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Exited(_) | ProcessStatus::Killed | ProcessStatus::Crashed(_)
        )
    }
}

/// PTY dimensions in character cells.
#[derive(Debug, Clone, Copy)]
pub struct TerminalSize {
    cols: u16,
    rows: u16,
}

impl TerminalSize {
    #[must_use]
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        Self {
            cols: size.cols,
            rows: size.rows,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A snapshot of the rendered terminal at one generation.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The visible rows, top to bottom, with their style escape sequences.
    pub rows: Vec<String>,
    /// Cursor position as (row, column).
    pub cursor: (u16, u16),
    /// Whether the cursor is hidden.
    pub cursor_hidden: bool,
    /// Current viewport offset into history; 0 tracks the live screen.
    pub scrollback_position: usize,
    /// Total rows of history above the visible screen.
    pub scrollback_size: usize,
    /// The generation this frame was rendered at.
    pub generation: u64,
    /// Process status at the moment of emission.
    pub status: ProcessStatus,
}

/// A command running (or finished) inside a pseudo-terminal.
///
/// Dropping the handle terminates the child, joins the I/O threads, and
/// closes the PTY.
pub struct Process {
    interactive: bool,
    scrollback_size: usize,
    pid: Option<u32>,
    size: Mutex<TerminalSize>,
    parser: Arc<Mutex<vt100::Parser>>,
    status: Arc<Mutex<ProcessStatus>>,
    generation: Arc<AtomicU64>,
    gen_tx: Arc<watch::Sender<u64>>,
    exit_rx: watch::Receiver<bool>,
    kill_requested: Arc<AtomicBool>,
    write_tx: Mutex<Option<Sender<Vec<u8>>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Process {
    /// Spawn `command` under `sh -c` inside a PTY of the given size.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::InvalidSize`] for a zero dimension,
    /// [`ProcessError::Pty`] if the PTY cannot be allocated, or
    /// [`ProcessError::Spawn`] if the shell cannot be started.
    pub fn spawn(command: &Command, size: TerminalSize) -> Result<Self, ProcessError> {
        if size.cols == 0 || size.rows == 0 {
            return Err(ProcessError::InvalidSize {
                cols: size.cols,
                rows: size.rows,
            });
        }
        debug!("Spawning PTY for command '{}'", command.name);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        let child = pair
            .slave
            .spawn_command(build_command(command))
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;
        drop(pair.slave); // the reader sees EOF once the child exits

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::Pty(format!("Failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::Pty(format!("Failed to take PTY writer: {e}")))?;

        let scrollback_size = command.scrollback.unwrap_or(DEFAULT_SCROLLBACK);
        let parser = Arc::new(Mutex::new(vt100::Parser::new(
            size.rows,
            size.cols,
            scrollback_size,
        )));
        let status = Arc::new(Mutex::new(ProcessStatus::Starting));
        let generation = Arc::new(AtomicU64::new(0));
        let (gen_tx, _gen_rx) = watch::channel(0u64);
        let gen_tx = Arc::new(gen_tx);
        let (exit_tx, exit_rx) = watch::channel(false);
        let (write_tx, write_rx) = crossbeam_channel::bounded(WRITE_QUEUE_DEPTH);
        let kill_requested = Arc::new(AtomicBool::new(false));

        parser.lock().process(&format_start_message(&command.cmd));
        publish(&generation, &gen_tx);

        let reader_handle = spawn_reader(ReaderContext {
            reader,
            child,
            parser: Arc::clone(&parser),
            status: Arc::clone(&status),
            generation: Arc::clone(&generation),
            gen_tx: Arc::clone(&gen_tx),
            exit_tx,
            kill_requested: Arc::clone(&kill_requested),
        });
        let writer_handle = spawn_writer(writer, write_rx);

        advance_status(&status, ProcessStatus::Running);

        Ok(Self {
            interactive: command.interactive,
            scrollback_size,
            pid,
            size: Mutex::new(size),
            parser,
            status,
            generation,
            gen_tx,
            exit_rx,
            kill_requested,
            write_tx: Mutex::new(Some(write_tx)),
            master: Mutex::new(Some(pair.master)),
            killer: Mutex::new(killer),
            handles: Mutex::new(vec![reader_handle, writer_handle]),
        })
    }

    /// Snapshot of the state machine.
    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        self.status.lock().clone()
    }

    /// Whether the terminal widget may take keyboard focus for this process.
    #[must_use]
    pub fn can_focus(&self) -> bool {
        self.interactive
    }

    /// Subscribe to rendered frames. Each subscriber observes a strictly
    /// increasing generation counter and may skip intermediate values.
    #[must_use]
    pub fn output(&self) -> OutputStream {
        OutputStream {
            rx: self.gen_tx.subscribe(),
            parser: Arc::clone(&self.parser),
            status: Arc::clone(&self.status),
        }
    }

    /// Enqueue bytes for the child's stdin, in order. A no-op once the
    /// process has finished. Blocks only when the writer queue is full.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) {
        if self.status.lock().is_final() {
            return;
        }
        // Clone the sender out of the lock so a full queue blocks only the
        // caller, never `kill`.
        let tx = self.write_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(bytes.into());
        }
    }

    /// Resize the PTY and the parser together.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::InvalidSize`] for a zero dimension, or
    /// [`ProcessError::Pty`] if the PTY rejects the new size.
    pub fn resize(&self, size: TerminalSize) -> Result<(), ProcessError> {
        if size.cols == 0 || size.rows == 0 {
            return Err(ProcessError::InvalidSize {
                cols: size.cols,
                rows: size.rows,
            });
        }
        {
            // Hold the parser lock across both updates so readers never see
            // mismatched dimensions.
            let mut parser = self.parser.lock();
            parser.set_size(size.rows, size.cols);
            if let Some(master) = self.master.lock().as_ref() {
                master
                    .resize(size.into())
                    .map_err(|e| ProcessError::Pty(e.to_string()))?;
            }
        }
        *self.size.lock() = size;
        publish(&self.generation, &self.gen_tx);
        Ok(())
    }

    /// Move the viewport by `delta` rows; positive scrolls toward older
    /// history. The offset is clamped to the available scrollback.
    pub fn scroll(&self, delta: isize) {
        {
            let mut parser = self.parser.lock();
            let current = parser.screen().scrollback();
            parser.set_scrollback(current.saturating_add_signed(delta));
        }
        publish(&self.generation, &self.gen_tx);
    }

    /// Absolute form of [`Process::scroll`].
    pub fn set_scroll(&self, rows: usize) {
        self.parser.lock().set_scrollback(rows);
        publish(&self.generation, &self.gen_tx);
    }

    /// Forward a mouse click to the child if it has enabled mouse reporting;
    /// otherwise a no-op.
    pub fn click(&self, x: u16, y: u16) {
        if self.parser.lock().screen().mouse_protocol_mode() == vt100::MouseProtocolMode::None {
            return;
        }
        let mut bytes = format!("\x1b[<0;{};{}M", x + 1, y + 1).into_bytes();
        bytes.extend_from_slice(format!("\x1b[<0;{};{}m", x + 1, y + 1).as_bytes());
        self.write(bytes);
    }

    /// Forward a mouse wheel event to the child if it has enabled mouse
    /// reporting. Returns whether the event was forwarded, so callers can
    /// fall back to local scrollback.
    pub fn mouse_scroll(&self, up: bool, x: u16, y: u16) -> bool {
        if self.parser.lock().screen().mouse_protocol_mode() == vt100::MouseProtocolMode::None {
            return false;
        }
        // SGR mouse encoding: button 64 = scroll up, 65 = scroll down
        let button = if up { 64 } else { 65 };
        self.write(format!("\x1b[<{button};{};{}M", x + 1, y + 1).into_bytes());
        true
    }

    /// Reset the screen and scrollback and ask the child to repaint.
    pub fn clear(&self) {
        let size = *self.size.lock();
        {
            let mut parser = self.parser.lock();
            *parser = vt100::Parser::new(size.rows, size.cols, self.scrollback_size);
        }
        self.write(vec![0x0c]);
        publish(&self.generation, &self.gen_tx);
    }

    /// Wait for the child to be reaped and return the final status.
    pub async fn wait(&self) -> ProcessStatus {
        let mut rx = self.exit_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.status()
    }

    /// Terminate the child: graceful TERM first, a forceful kill after a
    /// short grace period. Joins the I/O threads and closes the PTY.
    /// Idempotent; a child that already exited keeps its `Exited` status.
    pub async fn kill(&self) {
        if !self.status.lock().is_final() {
            self.kill_requested.store(true, Ordering::SeqCst);
            send_term(self.pid);
            if !self.wait_exit(KILL_GRACE).await {
                debug!("Killing process after grace period");
                if let Err(e) = self.killer.lock().kill() {
                    debug!("Failed to kill process: {e}");
                }
                let _ = self.wait_exit(KILL_WAIT).await;
            }
            advance_status(&self.status, ProcessStatus::Killed);
            publish(&self.generation, &self.gen_tx);
        }
        self.teardown().await;
    }

    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    async fn teardown(&self) {
        drop(self.write_tx.lock().take()); // ends the writer thread
        drop(self.master.lock().take()); // closes the PTY master
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        let _ = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if !self.status.lock().is_final() {
            self.kill_requested.store(true, Ordering::SeqCst);
            send_term(self.pid);
            if let Err(e) = self.killer.lock().kill() {
                debug!("Failed to kill process on drop: {e}");
            }
        }
        drop(self.write_tx.lock().take());
        drop(self.master.lock().take());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// A pull-based stream of [`Frame`]s for one process.
///
/// Single consumer per instance; any number of instances may subscribe to
/// the same process. Ends when the process handle is dropped.
pub struct OutputStream {
    rx: watch::Receiver<u64>,
    parser: Arc<Mutex<vt100::Parser>>,
    status: Arc<Mutex<ProcessStatus>>,
}

impl OutputStream {
    /// Wait for the next generation tick and render a frame. Bursts are
    /// coalesced: only the latest generation is observed.
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.changed().await.ok()?;
        let generation = *self.rx.borrow_and_update();
        Some(self.frame(generation))
    }

    fn frame(&self, generation: u64) -> Frame {
        let mut parser = self.parser.lock();
        let (rows, cursor, cursor_hidden, scrollback_position) = {
            let screen = parser.screen();
            let (_, cols) = screen.size();
            let rows: Vec<String> = screen
                .rows_formatted(0, cols)
                .map(|row| String::from_utf8_lossy(&row).into_owned())
                .collect();
            (
                rows,
                screen.cursor_position(),
                screen.hide_cursor(),
                screen.scrollback(),
            )
        };
        let scrollback_size = scrollback_depth(&mut parser);
        Frame {
            rows,
            cursor,
            cursor_hidden,
            scrollback_position,
            scrollback_size,
            generation,
            status: self.status.lock().clone(),
        }
    }
}

/// Total scrollback rows available. The parser clamps the offset to the
/// buffer length, so probing with the maximum offset reveals the depth.
fn scrollback_depth(parser: &mut vt100::Parser) -> usize {
    let current = parser.screen().scrollback();
    parser.set_scrollback(usize::MAX);
    let depth = parser.screen().scrollback();
    parser.set_scrollback(current);
    depth
}

fn advance_status(status: &Mutex<ProcessStatus>, next: ProcessStatus) {
    let mut current = status.lock();
    let allowed = matches!(
        (&*current, &next),
        (ProcessStatus::Starting, _)
            | (ProcessStatus::Running, ProcessStatus::Exited(_))
            | (ProcessStatus::Running, ProcessStatus::Killed)
            | (ProcessStatus::Running, ProcessStatus::Crashed(_))
    );
    if allowed {
        *current = next;
    }
}

fn publish(generation: &AtomicU64, gen_tx: &watch::Sender<u64>) {
    let next = generation.fetch_add(1, Ordering::SeqCst) + 1;
    gen_tx.send_replace(next);
}

fn build_command(command: &Command) -> CommandBuilder {
    let mut builder = CommandBuilder::new("sh");
    builder.args(["-c", &command.cmd]);
    for (key, value) in std::env::vars() {
        builder.env(key, value);
    }
    for (key, value) in &command.env {
        builder.env(key, value);
    }
    builder.env("TERM", "xterm-256color");
    if !command.cwd.as_os_str().is_empty() {
        builder.cwd(&command.cwd);
    }
    builder
}

struct ReaderContext {
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    parser: Arc<Mutex<vt100::Parser>>,
    status: Arc<Mutex<ProcessStatus>>,
    generation: Arc<AtomicU64>,
    gen_tx: Arc<watch::Sender<u64>>,
    exit_tx: watch::Sender<bool>,
    kill_requested: Arc<AtomicBool>,
}

/// Read from the PTY master, feed the parser, and bump the generation after
/// every applied chunk. Reaps the child when the stream ends.
fn spawn_reader(mut ctx: ReaderContext) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match ctx.reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    {
                        let mut parser = ctx.parser.lock();
                        parser.process(&buf[..n]);
                    }
                    // Publish after the lock is released so subscribers can
                    // render immediately.
                    publish(&ctx.generation, &ctx.gen_tx);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if is_pty_hangup(&e) {
                        debug!("PTY reader closed: {e}");
                    } else {
                        error!("PTY reader error: {e}");
                        advance_status(&ctx.status, ProcessStatus::Crashed(e.to_string()));
                    }
                    break;
                }
            }
        }

        match ctx.child.wait() {
            Ok(exit) => {
                let code = exit.exit_code();
                if ctx.kill_requested.load(Ordering::SeqCst) {
                    advance_status(&ctx.status, ProcessStatus::Killed);
                } else {
                    let banner = if code == 0 {
                        format_success_message()
                    } else {
                        format_failure_message(code)
                    };
                    ctx.parser.lock().process(&banner);
                    advance_status(&ctx.status, ProcessStatus::Exited(code));
                }
            }
            Err(e) => {
                error!("Failed to wait for child: {e}");
                advance_status(&ctx.status, ProcessStatus::Crashed(e.to_string()));
            }
        }
        publish(&ctx.generation, &ctx.gen_tx);
        let _ = ctx.exit_tx.send(true);
    })
}

/// Drain the bounded byte queue into the PTY master, in order.
fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    rx: Receiver<Vec<u8>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for bytes in rx {
            if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                debug!("PTY writer closed: {e}");
                break;
            }
        }
    })
}

/// Linux reports EIO on the master once the child side is gone; treat it as
/// a normal hangup rather than a crash.
#[cfg(unix)]
fn is_pty_hangup(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn is_pty_hangup(_e: &std::io::Error) -> bool {
    false
}

#[cfg(unix)]
fn send_term(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let pid = i32::try_from(pid).unwrap_or(0);
    if pid <= 0 {
        return;
    }
    unsafe {
        // The child leads its own session on the PTY; signal the group too.
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_term(_pid: Option<u32>) {}

const ARROW_COLOR: Style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan)));
const SUCCESS_COLOR: Style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green)));
const ERROR_COLOR: Style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red)));

/// Banner shown before the command's own output.
#[must_use]
pub fn format_start_message(command: &str) -> Vec<u8> {
    format!("{ARROW_COLOR}❱{Reset} {command}\r\n\r\n").into()
}

/// Banner appended when the command exits with code 0.
#[must_use]
pub fn format_success_message() -> Vec<u8> {
    format!("\r\n{ARROW_COLOR}❱{Reset} Command succeeded {SUCCESS_COLOR}✓{Reset}\r\n").into()
}

/// Banner appended when the command exits with a non-zero code.
#[must_use]
pub fn format_failure_message(exit_code: u32) -> Vec<u8> {
    format!(
        "\r\n{ARROW_COLOR}❱{Reset} Command failed {ERROR_COLOR}✘{Reset} (exit code {exit_code})\r\n"
    )
    .into()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn command(cmd: &str, interactive: bool) -> Command {
        Command {
            id: "test".to_string(),
            name: "test".to_string(),
            cmd: cmd.to_string(),
            interactive,
            ..Command::default()
        }
    }

    async fn wait_for_frame<F>(stream: &mut OutputStream, pred: F) -> Frame
    where
        F: Fn(&Frame) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline - tokio::time::Instant::now();
            let frame = tokio::time::timeout(remaining, stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("output stream ended");
            if pred(&frame) {
                return frame;
            }
        }
    }

    fn screen_text(frame: &Frame) -> String {
        frame.rows.join("\n")
    }

    #[test]
    fn spawn_rejects_zero_dimensions() {
        match Process::spawn(&command("true", false), TerminalSize::new(0, 24)) {
            Err(ProcessError::InvalidSize { cols: 0, rows: 24 }) => {}
            other => panic!("Expected InvalidSize, got: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn echoes_written_input() {
        let proc = Process::spawn(&command("cat", true), TerminalSize::new(80, 24)).unwrap();
        assert!(proc.can_focus());
        assert_eq!(proc.status(), ProcessStatus::Running);

        let mut output = proc.output();
        proc.write(b"hello\n".to_vec());
        let frame = wait_for_frame(&mut output, |f| screen_text(f).contains("hello")).await;
        let cursor_row = frame.cursor.0 as usize;
        assert!(cursor_row <= frame.rows.len());

        proc.kill().await;
        assert_eq!(proc.status(), ProcessStatus::Killed);

        // Writes after kill are silently discarded.
        proc.write(b"ignored\n".to_vec());
        assert_eq!(proc.status(), ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn reports_exit_code_with_banner() {
        let proc = Process::spawn(&command("exit 3", false), TerminalSize::new(80, 24)).unwrap();
        let mut output = proc.output();

        let status = proc.wait().await;
        assert_eq!(status, ProcessStatus::Exited(3));

        let frame = wait_for_frame(&mut output, |f| f.status == ProcessStatus::Exited(3)).await;
        assert!(screen_text(&frame).contains("exit code 3"));
    }

    #[tokio::test]
    async fn kill_is_idempotent_after_exit() {
        let proc = Process::spawn(&command("true", false), TerminalSize::new(80, 24)).unwrap();
        assert_eq!(proc.wait().await, ProcessStatus::Exited(0));

        proc.kill().await;
        proc.kill().await;
        assert_eq!(proc.status(), ProcessStatus::Exited(0));
    }

    #[tokio::test]
    async fn generations_increase_monotonically() {
        let proc = Process::spawn(
            &command("for i in 1 2 3 4 5; do echo line$i; done", false),
            TerminalSize::new(80, 24),
        )
        .unwrap();
        let mut output = proc.output();

        let mut last = 0;
        let mut observed = 0;
        loop {
            let frame = match tokio::time::timeout(Duration::from_secs(5), output.next()).await {
                Ok(Some(frame)) => frame,
                _ => break,
            };
            assert!(frame.generation > last, "generation must advance");
            last = frame.generation;
            observed += 1;
            if frame.status.is_final() {
                break;
            }
        }
        assert!(observed >= 1);
        proc.kill().await;
    }

    #[tokio::test]
    async fn resize_preserves_scrollback() {
        let proc = Process::spawn(
            &command(
                "i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done",
                false,
            ),
            TerminalSize::new(80, 24),
        )
        .unwrap();
        let mut output = proc.output();
        assert_eq!(proc.wait().await, ProcessStatus::Exited(0));

        proc.scroll(500);
        let frame = wait_for_frame(&mut output, |f| f.scrollback_position > 0).await;
        assert!(
            frame.scrollback_size >= 500 - 24,
            "expected at least {} rows of history, found {}",
            500 - 24,
            frame.scrollback_size
        );

        let scrolled_generation = frame.generation;
        proc.resize(TerminalSize::new(80, 50)).unwrap();
        let frame = wait_for_frame(&mut output, |f| f.generation > scrolled_generation).await;
        assert!(
            frame.scrollback_size >= 500 - 50,
            "resize must not drop history, found {} rows",
            frame.scrollback_size
        );
        proc.kill().await;
    }

    #[tokio::test]
    async fn click_without_mouse_mode_sends_nothing() {
        let proc = Process::spawn(&command("cat", true), TerminalSize::new(80, 24)).unwrap();
        let mut output = proc.output();

        proc.click(3, 4);
        proc.write(b"ping\n".to_vec());
        let frame = wait_for_frame(&mut output, |f| screen_text(f).contains("ping")).await;
        assert!(
            !screen_text(&frame).contains("[<0;"),
            "mouse sequence must not reach the child"
        );
        proc.kill().await;
    }

    #[tokio::test]
    async fn drop_terminates_the_child() {
        let proc = Process::spawn(&command("sleep 30", false), TerminalSize::new(80, 24)).unwrap();
        let pid = proc.pid.expect("child pid");
        drop(proc);

        // After drop the child has been reaped; signal 0 probes existence.
        let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
        assert!(!alive, "child should be gone after dropping the handle");
    }

    #[tokio::test]
    async fn clear_resets_screen_and_history() {
        let proc = Process::spawn(
            &command("i=0; while [ $i -lt 100 ]; do echo line$i; i=$((i+1)); done", false),
            TerminalSize::new(80, 24),
        )
        .unwrap();
        let mut output = proc.output();
        assert_eq!(proc.wait().await, ProcessStatus::Exited(0));

        proc.clear();
        let frame = wait_for_frame(&mut output, |f| f.scrollback_size == 0).await;
        assert!(!screen_text(&frame).contains("line42"));
        proc.kill().await;
    }
}
