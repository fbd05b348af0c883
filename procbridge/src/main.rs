//! procbridge CLI: pipe newline-delimited JSON payloads through a supervised worker.
//!
//! Each stdin line is one request payload. Results are printed to stdout in
//! input order as `{"ok": <result>}` or `{"error": "...", "kind": "..."}`.

use std::process;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use futures::stream::FuturesOrdered;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use procbridge::{BridgeClient, BridgeConfig, BridgeError, logging};

struct Options {
    worker: Option<String>,
    worker_args: Vec<String>,
    timeout_ms: Option<u64>,
    ready_timeout: Duration,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: procbridge [--worker <path>] [--timeout-ms <ms>] [-- <worker args>...]");
            eprintln!();
            eprintln!("Reads one JSON object per line from stdin and sends each to the worker.");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --worker <path>       Worker executable [default: $PROCBRIDGE_WORKER]");
            eprintln!("  --timeout-ms <ms>     Per-request deadline [default: 1000]");
            eprintln!("  --ready-timeout <s>   Seconds to wait for the worker to start [default: 10]");
            process::exit(2);
        }
    };

    logging::init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(options)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        worker: None,
        worker_args: Vec::new(),
        timeout_ms: None,
        ready_timeout: Duration::from_secs(10),
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--worker" => {
                i += 1;
                options.worker = Some(args.get(i).ok_or("--worker requires a value")?.clone());
            }
            "--timeout-ms" => {
                i += 1;
                let value = args.get(i).ok_or("--timeout-ms requires a value")?;
                options.timeout_ms = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid --timeout-ms '{value}'"))?,
                );
            }
            "--ready-timeout" => {
                i += 1;
                let value = args.get(i).ok_or("--ready-timeout requires a value")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("invalid --ready-timeout '{value}'"))?;
                options.ready_timeout = Duration::from_secs(secs);
            }
            "--" => {
                options.worker_args = args[i + 1..].to_vec();
                break;
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

async fn run(options: Options) -> anyhow::Result<()> {
    let mut config = match options.worker {
        Some(worker) => BridgeConfig::new(worker),
        None => BridgeConfig::from_env().context("no --worker given")?,
    };
    if !options.worker_args.is_empty() {
        config = config.with_args(options.worker_args);
    }
    if let Some(ms) = options.timeout_ms {
        config = config.with_default_deadline(Duration::from_millis(ms));
    }
    let deadline = config.default_deadline;

    let client = BridgeClient::start(config);
    client
        .wait_until_ready(options.ready_timeout)
        .await
        .context("worker did not start")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut in_flight = FuturesOrdered::new();
    let mut input_open = true;
    let mut failures = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line.context("reading stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let client = client.clone();
                    in_flight.push_back(async move {
                        let payload: Value = serde_json::from_str(&line)
                            .map_err(|e| BridgeError::InvalidPayload(e.to_string()))?;
                        client.process_request(&payload, deadline).await
                    });
                }
                None => input_open = false,
            },

            Some(outcome) = in_flight.next() => {
                let line = match outcome {
                    Ok(result) => json!({ "ok": result }),
                    Err(e) => {
                        failures += 1;
                        json!({ "error": e.to_string(), "kind": error_kind(&e) })
                    }
                };
                let mut text = serde_json::to_vec(&line)?;
                text.push(b'\n');
                stdout.write_all(&text).await.context("writing stdout")?;
                stdout.flush().await.context("writing stdout")?;
            }

            else => break,
        }
    }

    client.shutdown().await;
    if failures > 0 {
        anyhow::bail!("{failures} request(s) failed");
    }
    Ok(())
}

fn error_kind(error: &BridgeError) -> &'static str {
    match error {
        BridgeError::Timeout { .. } => "timeout",
        BridgeError::WorkerUnavailable { .. } => "worker_unavailable",
        BridgeError::Worker { .. } => "worker",
        BridgeError::InvalidPayload(_) => "invalid_payload",
    }
}
