//! BridgeClient: the entry point for code that needs the worker.
//!
//! Cheap to clone; every clone talks to the same supervisor and worker. When
//! the last clone is dropped the supervisor stops the worker.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::bridge::protocol::TopicRequest;
use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::process::{CommandSpawner, WorkerSpawner};
use crate::supervisor::{Control, SupervisorState, SupervisorStatus, WorkerSupervisor};

struct Inner {
    correlator: Arc<Correlator>,
    control: mpsc::Sender<Control>,
    status: watch::Receiver<SupervisorStatus>,
    default_deadline: Duration,
}

#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl BridgeClient {
    /// Start a bridge for the configured executable.
    ///
    /// Must be called inside a tokio runtime; the supervisor runs as a task.
    pub fn start(config: BridgeConfig) -> Self {
        let mut spawner = CommandSpawner::new(&config.executable).with_args(config.args.clone());
        for (key, value) in &config.env {
            spawner = spawner.with_env(key, value);
        }
        Self::with_spawner(config, Arc::new(spawner))
    }

    /// Start a bridge with a custom spawn strategy.
    pub fn with_spawner(config: BridgeConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());

        let correlator = Correlator::new(request_tx);
        let supervisor = WorkerSupervisor::new(
            spawner,
            Arc::clone(&correlator),
            request_rx,
            control_rx,
            status_tx,
            config.restart.clone(),
            config.max_line_length,
            config.shutdown_grace,
        );
        tokio::spawn(supervisor.run());

        Self {
            inner: Arc::new(Inner {
                correlator,
                control: control_tx,
                status: status_rx,
                default_deadline: config.default_deadline,
            }),
        }
    }

    /// Send `payload` to the worker and wait up to `deadline` for its answer.
    ///
    /// `payload` must serialize to a JSON object; its fields are sent next to
    /// the correlation id.
    pub async fn process_request<P: Serialize + ?Sized>(
        &self,
        payload: &P,
        deadline: Duration,
    ) -> Result<Value, BridgeError> {
        let state = self.state();
        if !state.accepts_requests() {
            return Err(BridgeError::unavailable(match state {
                SupervisorState::Faulted => "worker faulted",
                _ => "bridge is shut down",
            }));
        }

        let handle = self.inner.correlator.submit(payload, deadline)?;
        handle.wait().await
    }

    /// Request a course outline with the configured default deadline.
    pub async fn process_topics(&self, request: &TopicRequest) -> Result<Value, BridgeError> {
        self.process_request(request, self.inner.default_deadline)
            .await
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> SupervisorStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver that observes every supervisor transition.
    pub fn status_updates(&self) -> watch::Receiver<SupervisorStatus> {
        self.inner.status.clone()
    }

    /// Requests waiting for a response.
    pub fn pending(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Responses that arrived for requests no longer pending.
    pub fn stale_responses(&self) -> u64 {
        self.inner.correlator.stale_count()
    }

    /// Wait until a worker is Ready, or fail once the supervisor faults or stops.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut status = self.inner.status.clone();
        let wait = status.wait_for(|s| {
            matches!(
                s.state,
                SupervisorState::Ready | SupervisorState::Faulted | SupervisorState::Stopped
            )
        });
        let state = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(status)) => status.state,
            Ok(Err(_)) => SupervisorState::Stopped,
            Err(_) => {
                return Err(BridgeError::unavailable(format!(
                    "worker not ready after {}ms",
                    timeout.as_millis()
                )));
            }
        };
        match state {
            SupervisorState::Ready => Ok(()),
            SupervisorState::Faulted => Err(BridgeError::unavailable("worker faulted")),
            _ => Err(BridgeError::unavailable("bridge is shut down")),
        }
    }

    /// Leave the Faulted state and start a fresh worker.
    ///
    /// Returns false when the supervisor was not faulted.
    pub async fn reset(&self) -> Result<bool, BridgeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .control
            .send(Control::Reset(ack_tx))
            .await
            .map_err(|_| BridgeError::unavailable("bridge is shut down"))?;
        ack_rx
            .await
            .map_err(|_| BridgeError::unavailable("bridge is shut down"))
    }

    /// Stop the worker and fail anything still in flight.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .inner
            .control
            .send(Control::Shutdown(ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::NdjsonCodec;
    use crate::bridge::protocol::{RequestMessage, ResponseMessage};
    use crate::error::SpawnError;
    use crate::process::{ExitReport, WorkerProcess};
    use crate::supervisor::RestartPolicy;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::codec::{FramedRead, FramedWrite};

    /// Worker side of an in-memory pipe pair.
    struct FakeWorker {
        requests: FramedRead<tokio::io::DuplexStream, NdjsonCodec<RequestMessage>>,
        responses: FramedWrite<tokio::io::DuplexStream, NdjsonCodec<ResponseMessage>>,
        exit: oneshot::Sender<ExitReport>,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> RequestMessage {
            self.requests.next().await.unwrap().unwrap().unwrap()
        }

        async fn reply(&mut self, response: ResponseMessage) {
            self.responses.send(response).await.unwrap();
        }

        async fn write_raw(&mut self, line: &str) {
            use tokio::io::AsyncWriteExt;
            self.responses.get_mut().write_all(line.as_bytes()).await.unwrap();
        }

        fn crash(self, code: i32) {
            let _ = self.exit.send(ExitReport::code(code));
        }

        /// Exit while something else (a grandchild) still holds stdout open.
        fn exit_holding_stdout(
            self,
            code: i32,
        ) -> FramedWrite<tokio::io::DuplexStream, NdjsonCodec<ResponseMessage>> {
            let _ = self.exit.send(ExitReport::code(code));
            self.responses
        }
    }

    /// Spawner that hands each incarnation's worker side to the test.
    struct FakeSpawner {
        workers: mpsc::UnboundedSender<FakeWorker>,
        spawns: AtomicUsize,
        fail_spawns: StdMutex<usize>,
    }

    impl WorkerSpawner for FakeSpawner {
        fn spawn(&self) -> Result<WorkerProcess, SpawnError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            {
                let mut remaining = self.fail_spawns.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SpawnError::Other("fake spawn failure".to_string()));
                }
            }
            let (bridge_in, worker_in) = tokio::io::duplex(64 * 1024);
            let (worker_out, bridge_out) = tokio::io::duplex(64 * 1024);
            let (exit_tx, exit_rx) = oneshot::channel();
            let _ = self.workers.send(FakeWorker {
                requests: FramedRead::new(worker_in, NdjsonCodec::new()),
                responses: FramedWrite::new(worker_out, NdjsonCodec::new()),
                exit: exit_tx,
            });
            Ok(WorkerProcess::from_parts(
                "fake-worker",
                bridge_in,
                bridge_out,
                exit_rx,
            ))
        }

        fn describe(&self) -> String {
            "fake-worker".to_string()
        }
    }

    fn fake_bridge(
        policy: RestartPolicy,
        fail_spawns: usize,
    ) -> (
        BridgeClient,
        mpsc::UnboundedReceiver<FakeWorker>,
        Arc<FakeSpawner>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(FakeSpawner {
            workers: tx,
            spawns: AtomicUsize::new(0),
            fail_spawns: StdMutex::new(fail_spawns),
        });
        let config = BridgeConfig::new("fake-worker")
            .with_restart_policy(policy)
            .with_shutdown_grace(Duration::from_millis(200));
        let client = BridgeClient::with_spawner(config, spawner.clone());
        (client, rx, spawner)
    }

    fn fast_policy(max: Option<u32>) -> RestartPolicy {
        RestartPolicy::default()
            .with_initial_backoff(Duration::from_millis(20))
            .with_max_backoff(Duration::from_millis(100))
            .with_max_consecutive_failures(max)
    }

    #[tokio::test]
    async fn concurrent_requests_answered_in_reverse_order() {
        let (client, mut workers, _) = fake_bridge(fast_policy(None), 0);
        let mut worker = workers.recv().await.unwrap();

        let calls: Vec<_> = (0..8)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    client
                        .process_request(&json!({"n": i}), Duration::from_secs(5))
                        .await
                })
            })
            .collect();

        let mut received = Vec::new();
        for _ in 0..8 {
            received.push(worker.next_request().await);
        }
        for request in received.into_iter().rev() {
            let n = request.fields["n"].clone();
            worker
                .reply(ResponseMessage::result(request.id, json!({"echo": n})))
                .await;
        }

        for (i, call) in calls.into_iter().enumerate() {
            let result = call.await.unwrap().unwrap();
            assert_eq!(result, json!({"echo": i}));
        }
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn stale_and_malformed_output_is_ignored() {
        let (client, mut workers, _) = fake_bridge(fast_policy(None), 0);
        let mut worker = workers.recv().await.unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .process_request(&json!({"q": 1}), Duration::from_secs(5))
                    .await
            })
        };
        let request = worker.next_request().await;

        worker.write_raw("this is not json\n").await;
        worker
            .reply(ResponseMessage::result(
                crate::bridge::protocol::RequestId::new(),
                json!("someone else"),
            ))
            .await;
        worker
            .reply(ResponseMessage::result(request.id, json!("mine")))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!("mine"));
        assert_eq!(client.stale_responses(), 1);
    }

    #[tokio::test]
    async fn crash_fails_in_flight_and_restarts() {
        let (client, mut workers, spawner) = fake_bridge(fast_policy(Some(3)), 0);
        let mut worker = workers.recv().await.unwrap();
        client
            .wait_until_ready(Duration::from_secs(1))
            .await
            .unwrap();

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    client
                        .process_request(&json!({"n": i}), Duration::from_secs(5))
                        .await
                })
            })
            .collect();
        for _ in 0..3 {
            worker.next_request().await;
        }
        worker.crash(1);

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(err.is_unavailable(), "{err}");
        }

        let mut replacement = workers.recv().await.unwrap();
        client
            .wait_until_ready(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);
        let status = client.status();
        assert_eq!(status.restarts, 1);
        assert_eq!(status.last_exit, Some(ExitReport::code(1)));

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .process_request(&json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let request = replacement.next_request().await;
        replacement
            .reply(ResponseMessage::result(request.id, json!("after restart")))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!("after restart"));
    }

    #[tokio::test]
    async fn exit_fails_in_flight_without_waiting_for_stdout_eof() {
        let (client, mut workers, _) = fake_bridge(fast_policy(None), 0);
        let mut worker = workers.recv().await.unwrap();

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    client
                        .process_request(&json!({"n": i}), Duration::from_secs(10))
                        .await
                })
            })
            .collect();
        for _ in 0..3 {
            worker.next_request().await;
        }
        let _stdout = worker.exit_holding_stdout(1);

        for call in calls {
            let err = tokio::time::timeout(Duration::from_millis(100), call)
                .await
                .expect("in-flight request not failed promptly")
                .unwrap()
                .unwrap_err();
            assert!(err.is_unavailable(), "{err}");
        }
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn fault_is_preceded_by_restarting() {
        let (client, _workers, _) = fake_bridge(fast_policy(Some(0)), 1);
        let mut updates = client.status_updates();
        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().state;
                seen.push(state);
                if state == SupervisorState::Faulted {
                    break;
                }
            }
            seen
        });

        let seen = tokio::time::timeout(Duration::from_secs(1), observer)
            .await
            .unwrap()
            .unwrap();
        assert!(seen.contains(&SupervisorState::Restarting), "{seen:?}");
        assert_eq!(seen.last(), Some(&SupervisorState::Faulted));
        assert_eq!(client.state(), SupervisorState::Faulted);
    }

    #[tokio::test]
    async fn response_written_before_exit_is_delivered() {
        let (client, mut workers, _) = fake_bridge(fast_policy(None), 0);
        let mut worker = workers.recv().await.unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .process_request(&json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let request = worker.next_request().await;
        worker
            .reply(ResponseMessage::result(request.id, json!("last words")))
            .await;
        worker.crash(0);

        assert_eq!(call.await.unwrap().unwrap(), json!("last words"));
    }

    #[tokio::test]
    async fn repeated_spawn_failures_fault_until_reset() {
        let (client, mut workers, spawner) = fake_bridge(fast_policy(Some(2)), 3);

        let err = client
            .wait_until_ready(Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(client.state(), SupervisorState::Faulted);
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 3);

        let err = client
            .process_request(&json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::unavailable("worker faulted"));
        assert_eq!(client.pending(), 0);

        assert!(client.reset().await.unwrap());
        let mut worker = workers.recv().await.unwrap();
        client
            .wait_until_ready(Duration::from_secs(1))
            .await
            .unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .process_request(&json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let request = worker.next_request().await;
        worker.reply(ResponseMessage::result(request.id, json!(1))).await;
        assert_eq!(call.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn requests_during_backoff_are_sent_to_next_worker() {
        let policy = RestartPolicy::default()
            .with_initial_backoff(Duration::from_millis(300))
            .with_max_consecutive_failures(None);
        let (client, mut workers, _) = fake_bridge(policy, 0);
        let worker = workers.recv().await.unwrap();
        client
            .wait_until_ready(Duration::from_secs(1))
            .await
            .unwrap();
        worker.crash(2);

        let mut status = client.status_updates();
        status
            .wait_for(|s| s.state == SupervisorState::Restarting)
            .await
            .unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .process_request(&json!({"queued": true}), Duration::from_secs(5))
                    .await
            })
        };

        let mut replacement = workers.recv().await.unwrap();
        let request = replacement.next_request().await;
        assert_eq!(request.fields["queued"], json!(true));
        replacement
            .reply(ResponseMessage::result(request.id, json!("ok")))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn reset_is_noop_when_healthy() {
        let (client, _workers, _) = fake_bridge(fast_policy(None), 0);
        client
            .wait_until_ready(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!client.reset().await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_rejects_new_requests() {
        let (client, mut workers, _) = fake_bridge(fast_policy(None), 0);
        let mut worker = workers.recv().await.unwrap();

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .process_request(&json!({}), Duration::from_secs(5))
                    .await
            })
        };
        worker.next_request().await;

        // The fake exits once it sees stdin close.
        let exit_on_eof = tokio::spawn(async move {
            while worker.requests.next().await.is_some() {}
            worker.crash(0);
        });

        client.shutdown().await;
        exit_on_eof.await.unwrap();
        assert_eq!(client.state(), SupervisorState::Stopped);
        assert!(call.await.unwrap().unwrap_err().is_unavailable());

        let err = client
            .process_request(&json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::unavailable("bridge is shut down"));
    }

    #[tokio::test]
    async fn timeout_does_not_disturb_other_requests() {
        let (client, mut workers, _) = fake_bridge(fast_policy(None), 0);
        let mut worker = workers.recv().await.unwrap();

        let slow = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .process_request(&json!({"slow": true}), Duration::from_millis(50))
                    .await
            })
        };
        let fast = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .process_request(&json!({"slow": false}), Duration::from_secs(5))
                    .await
            })
        };

        let first = worker.next_request().await;
        let second = worker.next_request().await;
        let (slow_req, fast_req) = if first.fields["slow"] == json!(true) {
            (first, second)
        } else {
            (second, first)
        };

        assert!(slow.await.unwrap().unwrap_err().is_timeout());

        worker
            .reply(ResponseMessage::result(slow_req.id, json!("too late")))
            .await;
        worker
            .reply(ResponseMessage::result(fast_req.id, json!("on time")))
            .await;

        assert_eq!(fast.await.unwrap().unwrap(), json!("on time"));
        assert_eq!(client.stale_responses(), 1);
    }
}
