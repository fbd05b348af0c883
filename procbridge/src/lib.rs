//! procbridge: supervised stdin/stdout JSON bridge to a long-lived worker process.
//!
//! Callers go through [`BridgeClient`]; the [`supervisor`] owns the worker
//! process, the [`correlator`] matches responses to requests, and
//! [`bridge::codec`] frames messages as newline-delimited JSON.

pub mod bridge;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod logging;
pub mod outline;
pub mod process;
pub mod supervisor;
pub mod worker;

pub use bridge::protocol::{RequestId, RequestMessage, ResponseBody, ResponseMessage, TopicRequest};
pub use client::BridgeClient;
pub use config::BridgeConfig;
pub use correlator::{Correlator, Resolution, ResponseHandle};
pub use error::{BridgeError, ConfigError, ProtocolError, SpawnError};
pub use process::{CommandSpawner, ExitReport, WorkerProcess, WorkerSpawner};
pub use supervisor::{AfterFailure, Lifecycle, RestartPolicy, SupervisorState, SupervisorStatus};
pub use worker::{RequestHandler, run_worker};
