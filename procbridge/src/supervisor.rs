//! Worker supervisor - owns the worker process lifecycle.
//!
//! Flow:
//! 1. Spawn worker subprocess (NotStarted/Restarting -> Starting -> Ready)
//! 2. Forward queued requests to its stdin, route decoded stdout lines to the correlator
//! 3. On exit: route output already buffered, fail all in-flight requests, back off
//! 4. Restart, or go Faulted once consecutive failures exceed the policy
//!
//! The supervisor task is the only code that touches the process pipes.
//! [`Lifecycle`] holds the state machine so it can be driven without processes.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::NdjsonCodec;
use crate::bridge::protocol::{RequestMessage, ResponseMessage};
use crate::correlator::Correlator;
use crate::error::{BridgeError, ProtocolError};
use crate::process::{ExitReport, WorkerProcess, WorkerSpawner, WorkerStdin, WorkerStdout};

/// How long to wait for the writer task to finish after stdin is closed.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorState {
    #[default]
    NotStarted,
    Starting,
    Ready,
    Restarting,
    /// Consecutive failures exceeded the restart policy; waiting for reset.
    Faulted,
    /// Shut down explicitly or by dropping every client.
    Stopped,
}

impl SupervisorState {
    /// Faulted and Stopped fail submissions immediately.
    pub fn accepts_requests(&self) -> bool {
        !matches!(self, Self::Faulted | Self::Stopped)
    }
}

/// Restart backoff and fault threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    /// `None` restarts forever.
    pub max_consecutive_failures: Option<u32>,
    /// A run at least this long resets the consecutive-failure count.
    pub stable_uptime: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
            max_consecutive_failures: Some(5),
            stable_uptime: Duration::from_secs(10),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: Option<u32>) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn with_stable_uptime(mut self, uptime: Duration) -> Self {
        self.stable_uptime = uptime;
        self
    }
}

/// Decision taken after the worker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterFailure {
    Restart { delay: Duration, attempt: u32 },
    Fault { failures: u32 },
}

/// Supervisor state machine, free of I/O.
///
/// Every failure passes through Restarting. When the policy gives up,
/// [`failed`](Self::failed) returns [`AfterFailure::Fault`] and the caller
/// moves on to Faulted with [`fault`](Self::fault).
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: SupervisorState,
    policy: RestartPolicy,
    consecutive_failures: u32,
    restarts: u64,
}

impl Lifecycle {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            state: SupervisorState::NotStarted,
            policy,
            consecutive_failures: 0,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// NotStarted/Restarting -> Starting. Returns false from any other state.
    pub fn begin_start(&mut self) -> bool {
        match self.state {
            SupervisorState::NotStarted => {}
            SupervisorState::Restarting => self.restarts += 1,
            _ => return false,
        }
        self.state = SupervisorState::Starting;
        true
    }

    /// Starting -> Ready.
    pub fn spawned(&mut self) {
        if self.state == SupervisorState::Starting {
            self.state = SupervisorState::Ready;
        }
    }

    /// Worker exited after `uptime`, or failed to spawn (`None`). -> Restarting.
    pub fn failed(&mut self, uptime: Option<Duration>) -> AfterFailure {
        if uptime.is_some_and(|u| u >= self.policy.stable_uptime) {
            self.consecutive_failures = 0;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = SupervisorState::Restarting;

        if let Some(max) = self.policy.max_consecutive_failures
            && self.consecutive_failures > max
        {
            return AfterFailure::Fault {
                failures: self.consecutive_failures,
            };
        }

        AfterFailure::Restart {
            delay: self.policy.backoff(self.consecutive_failures),
            attempt: self.consecutive_failures,
        }
    }

    /// Restarting -> Faulted. Returns false from any other state.
    pub fn fault(&mut self) -> bool {
        if self.state != SupervisorState::Restarting {
            return false;
        }
        self.state = SupervisorState::Faulted;
        true
    }

    /// Faulted -> NotStarted with a clean failure count.
    pub fn reset(&mut self) -> bool {
        if self.state != SupervisorState::Faulted {
            return false;
        }
        self.state = SupervisorState::NotStarted;
        self.consecutive_failures = 0;
        true
    }

    pub fn stop(&mut self) {
        self.state = SupervisorState::Stopped;
    }
}

/// Point-in-time view of the supervisor, published on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restarts: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_since: Option<DateTime<Utc>>,
}

/// Commands from the client to the supervisor task.
pub(crate) enum Control {
    /// Leave Faulted and start again. Acks false when not faulted.
    Reset(oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

enum Served {
    Exited(ExitReport),
    Stopped,
}

enum Wait {
    Continue,
    Stop,
}

type ResponseReader = FramedRead<WorkerStdout, NdjsonCodec<ResponseMessage>>;
type Frame = Option<Result<Result<ResponseMessage, ProtocolError>, io::Error>>;

pub struct WorkerSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    correlator: Arc<Correlator>,
    requests: mpsc::UnboundedReceiver<RequestMessage>,
    control: mpsc::Receiver<Control>,
    status: watch::Sender<SupervisorStatus>,
    lifecycle: Lifecycle,
    /// Requests received while no worker was ready.
    backlog: VecDeque<RequestMessage>,
    max_line_length: usize,
    shutdown_grace: Duration,
    shutdown_ack: Option<oneshot::Sender<()>>,
}

impl WorkerSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        spawner: Arc<dyn WorkerSpawner>,
        correlator: Arc<Correlator>,
        requests: mpsc::UnboundedReceiver<RequestMessage>,
        control: mpsc::Receiver<Control>,
        status: watch::Sender<SupervisorStatus>,
        policy: RestartPolicy,
        max_line_length: usize,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            spawner,
            correlator,
            requests,
            control,
            status,
            lifecycle: Lifecycle::new(policy),
            backlog: VecDeque::new(),
            max_line_length,
            shutdown_grace,
            shutdown_ack: None,
        }
    }

    fn publish(&self, update: impl FnOnce(&mut SupervisorStatus)) {
        let lifecycle = &self.lifecycle;
        self.status.send_modify(|status| {
            status.state = lifecycle.state();
            status.restarts = lifecycle.restarts();
            status.consecutive_failures = lifecycle.consecutive_failures();
            update(status);
        });
    }

    pub async fn run(mut self) {
        let worker = self.spawner.describe();
        loop {
            if !self.lifecycle.begin_start() {
                tracing::error!(state = ?self.lifecycle.state(), "Cannot start worker from this state");
                break;
            }
            self.publish(|s| s.pid = None);
            tracing::info!(%worker, restarts = self.lifecycle.restarts(), "Starting worker");

            let started_at = Instant::now();
            let (uptime, reason) = match self.spawner.spawn() {
                Ok(process) => {
                    let pid = process.pid();
                    self.lifecycle.spawned();
                    self.publish(|s| {
                        s.pid = pid;
                        s.ready_since = Some(Utc::now());
                    });
                    tracing::info!(?pid, "Worker ready");

                    match self.serve(process).await {
                        Served::Stopped => break,
                        Served::Exited(report) => {
                            self.publish(|s| {
                                s.pid = None;
                                s.ready_since = None;
                                s.last_exit = Some(report);
                                s.last_exit_at = Some(Utc::now());
                            });
                            (Some(started_at.elapsed()), format!("worker exited ({report})"))
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(%worker, error = %e, "Failed to spawn worker");
                    (None, format!("worker failed to start: {e}"))
                }
            };

            // Spawn failures are handled exactly like crashes.
            self.correlator.fail_all(&reason);

            let next = match self.lifecycle.failed(uptime) {
                AfterFailure::Restart { delay, attempt } => {
                    self.publish(|_| {});
                    tracing::warn!(
                        delay_ms = delay.as_millis() as u64,
                        attempt,
                        "Restarting worker after backoff"
                    );
                    self.wait_backoff(delay).await
                }
                AfterFailure::Fault { failures } => {
                    self.publish(|_| {});
                    // Let status observers see Restarting before Faulted.
                    tokio::task::yield_now().await;
                    self.lifecycle.fault();
                    self.publish(|_| {});
                    tracing::error!(failures, "Worker keeps failing - supervisor faulted");
                    self.fail_backlog("worker faulted");
                    self.wait_for_reset().await
                }
            };
            if let Wait::Stop = next {
                break;
            }
        }

        self.lifecycle.stop();
        self.publish(|s| {
            s.pid = None;
            s.ready_since = None;
        });
        self.fail_backlog("bridge shut down");
        self.correlator.fail_all("bridge shut down");
        tracing::info!("Supervisor stopped");
        if let Some(ack) = self.shutdown_ack.take() {
            let _ = ack.send(());
        }
    }

    /// Run one worker incarnation until it exits or we are told to stop.
    async fn serve(&mut self, process: WorkerProcess) -> Served {
        let WorkerProcess {
            pid,
            stdin,
            stdout,
            mut exited,
            terminate,
            ..
        } = process;

        let writer = RequestWriter::spawn(
            stdin,
            self.max_line_length,
            Arc::clone(&self.correlator),
            pid,
        );
        let mut reader = FramedRead::new(
            stdout,
            NdjsonCodec::<ResponseMessage>::with_max_line_length(self.max_line_length),
        );

        for message in self.backlog.drain(..) {
            writer.send(message);
        }

        let mut stdout_open = true;
        let report = loop {
            tokio::select! {
                biased;

                frame = reader.next(), if stdout_open => {
                    stdout_open = self.route(frame);
                }

                report = &mut exited => {
                    break report.unwrap_or_else(|_| ExitReport::unknown());
                }

                ctrl = self.control.recv() => match ctrl {
                    Some(Control::Reset(ack)) => {
                        let _ = ack.send(false);
                    }
                    Some(Control::Shutdown(ack)) => {
                        self.shutdown_ack = Some(ack);
                        self.stop_worker(writer, &mut reader, stdout_open, exited, terminate).await;
                        return Served::Stopped;
                    }
                    None => {
                        tracing::debug!("All bridge clients dropped");
                        self.stop_worker(writer, &mut reader, stdout_open, exited, terminate).await;
                        return Served::Stopped;
                    }
                },

                Some(message) = self.requests.recv() => {
                    writer.send(message);
                }
            }
        };

        // Deliver output the worker wrote before exiting, without waiting on a
        // pipe that a grandchild may still hold open.
        if stdout_open {
            while let Some(frame) = reader.next().now_or_never() {
                if !self.route(frame) {
                    break;
                }
            }
        }
        drop(reader);

        let failed = self
            .correlator
            .fail_all(&format!("worker exited ({report})"));
        tracing::warn!(?pid, %report, in_flight = failed, "Worker exited");
        writer.close().await;
        Served::Exited(report)
    }

    /// Hand one decoded stdout frame to the correlator. Returns false at end of stream.
    fn route(&self, frame: Frame) -> bool {
        match frame {
            Some(Ok(Ok(message))) => {
                self.correlator.on_message(message);
                true
            }
            Some(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Dropping malformed worker output");
                true
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Worker stdout read failed");
                false
            }
            None => {
                tracing::debug!("Worker stdout closed");
                false
            }
        }
    }

    /// Close stdin, give the worker `shutdown_grace` to exit, then terminate it.
    async fn stop_worker(
        &self,
        writer: RequestWriter,
        reader: &mut ResponseReader,
        mut stdout_open: bool,
        mut exited: oneshot::Receiver<ExitReport>,
        terminate: Option<oneshot::Sender<Duration>>,
    ) {
        tracing::info!("Stopping worker");
        writer.close().await;

        let deadline = Instant::now() + self.shutdown_grace;
        let mut terminate = terminate;
        loop {
            tokio::select! {
                biased;

                frame = reader.next(), if stdout_open => {
                    stdout_open = self.route(frame);
                }

                report = &mut exited => {
                    let report = report.unwrap_or_else(|_| ExitReport::unknown());
                    tracing::info!(%report, "Worker stopped");
                    return;
                }

                _ = tokio::time::sleep_until(deadline), if terminate.is_some() => {
                    if let Some(tx) = terminate.take() {
                        tracing::warn!("Worker did not exit after stdin closed, terminating");
                        let _ = tx.send(self.shutdown_grace);
                    }
                }

                _ = tokio::time::sleep_until(deadline + self.shutdown_grace * 2), if terminate.is_none() => {
                    tracing::warn!("Gave up waiting for worker to exit");
                    return;
                }
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Wait::Continue,

                ctrl = self.control.recv() => match ctrl {
                    Some(Control::Reset(ack)) => {
                        let _ = ack.send(false);
                    }
                    Some(Control::Shutdown(ack)) => {
                        self.shutdown_ack = Some(ack);
                        return Wait::Stop;
                    }
                    None => return Wait::Stop,
                },

                Some(message) = self.requests.recv() => {
                    tracing::debug!(request_id = %message.id, "Queueing request until worker restarts");
                    self.backlog.push_back(message);
                }
            }
        }
    }

    async fn wait_for_reset(&mut self) -> Wait {
        loop {
            tokio::select! {
                ctrl = self.control.recv() => match ctrl {
                    Some(Control::Reset(ack)) => {
                        self.lifecycle.reset();
                        self.publish(|_| {});
                        tracing::info!("Supervisor reset");
                        let _ = ack.send(true);
                        return Wait::Continue;
                    }
                    Some(Control::Shutdown(ack)) => {
                        self.shutdown_ack = Some(ack);
                        return Wait::Stop;
                    }
                    None => return Wait::Stop,
                },

                Some(message) = self.requests.recv() => {
                    self.correlator
                        .fail(message.id, BridgeError::unavailable("worker faulted"));
                }
            }
        }
    }

    fn fail_backlog(&mut self, reason: &str) {
        for message in self.backlog.drain(..) {
            self.correlator
                .fail(message.id, BridgeError::unavailable(reason));
        }
    }
}

/// Writes requests to worker stdin on its own task so a worker that stops
/// reading cannot stall stdout processing.
struct RequestWriter {
    tx: mpsc::UnboundedSender<RequestMessage>,
    task: JoinHandle<()>,
    correlator: Arc<Correlator>,
}

impl RequestWriter {
    fn spawn(
        stdin: WorkerStdin,
        max_line_length: usize,
        correlator: Arc<Correlator>,
        pid: Option<u32>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestMessage>();
        let mut sink = FramedWrite::new(
            stdin,
            NdjsonCodec::<RequestMessage>::with_max_line_length(max_line_length),
        );
        let task_correlator = Arc::clone(&correlator);
        let task = tokio::spawn(async move {
            let mut broken: Option<String> = None;
            while let Some(message) = rx.recv().await {
                let id = message.id;
                if !task_correlator.is_pending(&id) {
                    tracing::debug!(request_id = %id, "Skipping request that is no longer pending");
                    continue;
                }
                if let Some(reason) = &broken {
                    task_correlator.fail(id, BridgeError::unavailable(reason.clone()));
                    continue;
                }
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(?pid, request_id = %id, error = %e, "Failed to write request to worker");
                    let reason = format!("failed to write to worker: {e}");
                    task_correlator.fail(id, BridgeError::unavailable(reason.clone()));
                    broken = Some(reason);
                } else {
                    tracing::trace!(?pid, request_id = %id, "Request written");
                }
            }
            if let Err(e) = sink.close().await {
                tracing::debug!(?pid, error = %e, "Closing worker stdin failed");
            }
        });
        Self {
            tx,
            task,
            correlator,
        }
    }

    fn send(&self, message: RequestMessage) {
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            self.correlator
                .fail(message.id, BridgeError::unavailable("worker stdin closed"));
        }
    }

    /// Close stdin once queued requests are written.
    async fn close(self) {
        let Self { tx, mut task, .. } = self;
        drop(tx);
        if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            tracing::warn!("Worker stdin writer did not finish, aborting");
            task.abort();
        }
    }
}
