//! Transport engine: the IO task that owns the modem stream.
//!
//! One tokio task owns the transport exclusively. Commands arrive over an
//! mpsc channel and are executed one at a time: write the command text plus
//! terminator, then read into a [`LineBuffer`] and feed completed frames to a
//! [`Transaction`] until it concludes or the rolling timer expires. While a
//! command is in flight every byte from the stream belongs to it; lines the
//! transaction sees past its conclusive match, and everything read while no
//! command is active, are forwarded on the notification channel.
//!
//! The engine publishes an explicit [`EngineState`] token through a
//! `watch` channel. It leaves `Idle` when a command is written and returns
//! to `Idle` exactly once per command, on every path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atgsm_core::driver::{DEFAULT_TERMINATOR, Driver};
use atgsm_core::error::{Error, Result};
use atgsm_core::transport::Transport;

use crate::framer::LineBuffer;
use crate::matcher::{Markers, Outcome, Transaction, starts_with_ignore_case};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Default rolling timeout for one command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default cumulative timeout count after which a health warning is logged.
pub const DEFAULT_TIMEOUT_THRESHOLD: u32 = 100;

/// Configuration for the IO task.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Line terminator, appended to every command and used for framing.
    pub terminator: String,
    /// Rolling timeout for a command. Re-armed whenever data arrives.
    pub command_timeout: Duration,
    /// Cumulative timeouts at which the engine starts warning.
    pub timeout_threshold: u32,
    /// Success and error sentinels.
    pub markers: Markers,
}

impl IoConfig {
    /// Terminator and markers taken from `driver`.
    pub fn from_driver(driver: &Driver) -> Self {
        IoConfig {
            terminator: driver.terminator(),
            markers: Markers::from_driver(driver),
            ..Default::default()
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            terminator: DEFAULT_TERMINATOR.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            timeout_threshold: DEFAULT_TIMEOUT_THRESHOLD,
            markers: Markers::default(),
        }
    }
}

/// An AT command and its matching options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    /// Prefixes that conclude the command with success, ahead of `OK`.
    pub expect: Vec<String>,
    /// Prefixes dropped from the captured response.
    pub ignore: Vec<String>,
    /// Overrides [`IoConfig::command_timeout`].
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Command {
            text: text.into(),
            expect: Vec::new(),
            ignore: Vec::new(),
            timeout: None,
        }
    }

    pub fn expect(mut self, pattern: impl Into<String>) -> Self {
        self.expect.push(pattern.into());
        self
    }

    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignore.push(pattern.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Lines captured for a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: String,
    pub lines: Vec<String>,
}

impl Response {
    /// The captured lines joined with a space.
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    pub fn first(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// The engine's busy token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Transmitting,
    AwaitingResponse,
}

impl EngineState {
    pub fn is_idle(self) -> bool {
        self == EngineState::Idle
    }
}

/// A request sent to the IO task.
pub enum Request {
    /// Transmit a command and await its conclusion.
    Command {
        command: Command,
        reply: oneshot::Sender<Result<Response>>,
    },
    /// Graceful shutdown; returns the transport for recovery.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Outcomes of a [`AtIo::batch`] run, by key, in submission order.
#[derive(Debug, Default)]
pub struct BatchResponses {
    order: Vec<String>,
    results: HashMap<String, Result<Response>>,
}

impl BatchResponses {
    pub fn get(&self, key: &str) -> Option<&Result<Response>> {
        self.results.get(key)
    }

    /// The response for `key` when that command succeeded.
    pub fn response(&self, key: &str) -> Option<&Response> {
        self.results.get(key).and_then(|r| r.as_ref().ok())
    }

    pub fn ok(&self, key: &str) -> bool {
        self.response(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Handle to the IO task.
pub struct AtIo {
    cmd_tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    state_rx: watch::Receiver<EngineState>,
    timeouts: Arc<AtomicU32>,
}

impl AtIo {
    /// Transmit `command` and await its conclusion.
    ///
    /// Success carries the captured lines. An error sentinel yields
    /// [`Error::CommandFailed`], an expired timer [`Error::CommandTimeout`].
    pub async fn send(&self, command: Command) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Request::Command {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::NotConnected),
        }
    }

    /// Transmit `commands` in order, recording every outcome. A failing
    /// command does not stop the batch.
    pub async fn batch<I>(&self, commands: I) -> BatchResponses
    where
        I: IntoIterator<Item = (String, Command)>,
    {
        let mut responses = BatchResponses::default();
        for (key, command) in commands {
            let result = self.send(command).await;
            if let Err(e) = &result {
                debug!(key = %key, error = %e, "batch command failed");
            }
            responses.order.push(key.clone());
            responses.results.insert(key, result);
        }
        responses
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Watch the engine state.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Number of commands that have timed out so far.
    pub fn timeouts(&self) -> u32 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Shut down the IO task and recover the transport.
    pub async fn shutdown(&self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Request::Shutdown { reply: reply_tx }).await;
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        Ok(transport)
    }
}

impl Drop for AtIo {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task. Returns the handle for sending commands.
///
/// Lines that belong to no command are sent on `notify_tx` in arrival
/// order, one batch per completed frame.
pub fn spawn_io_task(
    transport: Box<dyn Transport>,
    config: IoConfig,
    notify_tx: mpsc::UnboundedSender<Vec<String>>,
) -> AtIo {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Request>(32);
    let (state_tx, state_rx) = watch::channel(EngineState::Idle);
    let cancel = CancellationToken::new();
    let timeouts = Arc::new(AtomicU32::new(0));

    let task = tokio::spawn(io_loop(
        transport,
        config,
        notify_tx,
        cmd_rx,
        state_tx,
        Arc::clone(&timeouts),
        cancel.clone(),
    ));

    AtIo {
        cmd_tx,
        cancel,
        task: Mutex::new(Some(task)),
        state_rx,
        timeouts,
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Maximum buffer size before reset to prevent unbounded growth.
/// A multi-part listing rarely exceeds a few kilobytes.
const MAX_BUF: usize = 8192;

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Cancellation
/// 2. Command dispatch
/// 3. Idle unsolicited line reading
async fn io_loop(
    mut transport: Box<dyn Transport>,
    config: IoConfig,
    notify_tx: mpsc::UnboundedSender<Vec<String>>,
    mut cmd_rx: mpsc::Receiver<Request>,
    state_tx: watch::Sender<EngineState>,
    timeouts: Arc<AtomicU32>,
    cancel: CancellationToken,
) {
    let mut idle_buf = LineBuffer::new(&config.terminator);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("AT IO task cancelled");
                break;
            }

            req = cmd_rx.recv() => {
                match req {
                    Some(Request::Command { command, reply }) => {
                        let result = execute_command(
                            &mut *transport,
                            &command,
                            &config,
                            &state_tx,
                            &timeouts,
                            &notify_tx,
                        )
                        .await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Shutdown { reply }) => {
                        debug!("IO task shutdown requested");
                        let _ = reply.send(transport);
                        return;
                    }
                    None => {
                        debug!("command channel closed, exiting IO task");
                        break;
                    }
                }
            }

            // Idle: read unsolicited data from the modem.
            _ = async {
                let mut buf = [0u8; 256];
                match transport.receive(&mut buf, Duration::from_millis(100)).await {
                    Ok(n) if n > 0 => {
                        idle_buf.add(&buf[..n]);
                        if idle_buf.len() > MAX_BUF {
                            warn!(len = idle_buf.len(), "idle buffer overflow, resetting");
                            idle_buf.clear();
                            return;
                        }
                        if idle_buf.is_complete() {
                            let lines = idle_buf.drain();
                            if !lines.is_empty() {
                                debug!(count = lines.len(), "unsolicited lines");
                                let _ = notify_tx.send(lines);
                            }
                        }
                    }
                    _ => {
                        // Timeout or error: yield briefly so the loop
                        // can check for commands or cancellation.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

/// Run one command through the state machine and settle its result.
async fn execute_command(
    transport: &mut dyn Transport,
    command: &Command,
    config: &IoConfig,
    state_tx: &watch::Sender<EngineState>,
    timeouts: &AtomicU32,
    notify_tx: &mpsc::UnboundedSender<Vec<String>>,
) -> Result<Response> {
    let result = match transact(transport, command, config, state_tx).await {
        Ok(mut tx) => {
            let extras = tx.take_extras();
            if !extras.is_empty() {
                debug!(command = %command.text, count = extras.len(), "forwarding extra lines");
                let _ = notify_tx.send(extras);
            }
            match tx.outcome() {
                Outcome::Success => Ok(Response {
                    command: command.text.clone(),
                    lines: tx.into_responses(),
                }),
                _ => Err(Error::CommandFailed {
                    command: command.text.clone(),
                    response: tx.into_responses(),
                }),
            }
        }
        Err(e) => {
            if e.is_timeout() {
                let count = timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= config.timeout_threshold {
                    warn!(
                        timeouts = count,
                        threshold = config.timeout_threshold,
                        "modem keeps timing out, check the connection"
                    );
                }
            }
            Err(e)
        }
    };

    state_tx.send_replace(EngineState::Idle);

    match &result {
        Ok(response) => debug!(command = %command.text, lines = response.lines.len(), "command resolved"),
        Err(e) => debug!(command = %command.text, error = %e, "command rejected"),
    }
    result
}

/// Write the command and read until the transaction concludes.
///
/// The timer is rolling: every chunk received re-arms it.
async fn transact(
    transport: &mut dyn Transport,
    command: &Command,
    config: &IoConfig,
    state_tx: &watch::Sender<EngineState>,
) -> Result<Transaction> {
    state_tx.send_replace(EngineState::Transmitting);

    let mut data = command.text.as_bytes().to_vec();
    data.extend_from_slice(config.terminator.as_bytes());
    debug!(command = %command.text, "sending command");
    transport.send(&data).await?;

    state_tx.send_replace(EngineState::AwaitingResponse);

    let window = command.timeout.unwrap_or(config.command_timeout);
    let mut deadline = Instant::now() + window;
    let mut framer = LineBuffer::new(&config.terminator);
    let mut tx = Transaction::new(&command.expect, &command.ignore, &config.markers);
    let mut recv_buf = [0u8; 1024];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::CommandTimeout {
                command: command.text.clone(),
            });
        }
        let remaining = deadline - now;

        match transport.receive(&mut recv_buf, remaining).await {
            Ok(n) if n > 0 => {
                deadline = Instant::now() + window;
                framer.add(&recv_buf[..n]);

                if framer.len() > MAX_BUF {
                    warn!(len = framer.len(), "response buffer overflow, clearing");
                    framer.clear();
                    continue;
                }

                // A prompt arrives without a terminator.
                let prompted = framer.pending_tail().is_some_and(|tail| {
                    command
                        .expect
                        .iter()
                        .any(|p| starts_with_ignore_case(&tail, p))
                });

                if (framer.is_complete() || prompted) && tx.check(framer.drain()) {
                    return Ok(tx);
                }
            }
            Ok(_) | Err(Error::Timeout) => {
                tokio::time::sleep(remaining.min(Duration::from_millis(10))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
