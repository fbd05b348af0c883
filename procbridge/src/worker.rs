//! Worker side of the protocol - runs inside the worker subprocess.
//!
//! The parent side (spawning, supervision, correlation) lives in supervisor.rs
//! and correlator.rs. A worker reads request lines from stdin, hands each to a
//! [`RequestHandler`] concurrently, and writes responses to stdout in
//! completion order. Logs must go to stderr; stdout carries protocol only.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::NdjsonCodec;
use crate::bridge::protocol::{RequestMessage, ResponseMessage};

/// Computes the result for one request. Errors become `{"id", "error"}` lines.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: RequestMessage) -> Result<Value, String>;
}

/// Serve requests on the process's own stdin/stdout until stdin closes.
pub async fn run_worker<H: RequestHandler>(handler: Arc<H>) -> io::Result<()> {
    serve(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve requests over arbitrary streams. Returns once `input` reaches EOF and
/// every in-flight request has been answered.
pub async fn serve<H, R, W>(handler: Arc<H>, input: R, output: W) -> io::Result<()>
where
    H: RequestHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = FramedRead::new(input, NdjsonCodec::<RequestMessage>::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<ResponseMessage>();

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(output, NdjsonCodec::<ResponseMessage>::new());
        while let Some(response) = rx.recv().await {
            sink.send(response).await?;
        }
        sink.close().await
    });

    let mut in_flight = JoinSet::new();
    while let Some(frame) = reader.next().await {
        match frame? {
            Ok(request) => {
                let handler = Arc::clone(&handler);
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let id = request.id;
                    let outcome = AssertUnwindSafe(handler.handle(request))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err("handler panicked".to_string()));
                    let response = match outcome {
                        Ok(result) => ResponseMessage::result(id, result),
                        Err(error) => {
                            tracing::debug!(request_id = %id, %error, "Request failed");
                            ResponseMessage::error(id, error)
                        }
                    };
                    let _ = tx.send(response);
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed request");
            }
        }
        while in_flight.try_join_next().is_some() {}
    }

    tracing::debug!(in_flight = in_flight.len(), "Input closed, finishing in-flight requests");
    while in_flight.join_next().await.is_some() {}
    drop(tx);

    writer.await.map_err(io::Error::other)?
}
