use std::time::Duration;

use anyhow::Context;
use classifier_pool::{ClassificationRequest, Dispatcher, PoolConfig};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::task::JoinSet;
use tracing::{info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Results go to stdout, so logs must not.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = PoolConfig::from_env().context("invalid classifier pool configuration")?;

    eprintln!("📨 Classifier Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Command: {}", config.command.display());
    eprintln!("   Workers: {}", config.pool_size);
    eprintln!(
        "   Queue: {} max, task timeout {}s",
        config.max_queue,
        config.task_timeout.as_secs()
    );
    if config.restart_threshold == 0 {
        eprintln!("   Recycling: disabled");
    } else {
        eprintln!("   Recycling: every {} tasks", config.restart_threshold);
    }
    eprintln!("   Reading one JSON email per line on stdin.\n");

    let pool = Dispatcher::initialize(config)
        .await
        .context("failed to start classifier workers")?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut buf = Vec::new();
    let mut stdout = tokio::io::stdout();
    let mut in_flight: JoinSet<Value> = JoinSet::new();
    let mut line_no: u64 = 0;
    let mut input_open = true;

    let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);
    // First tick fires immediately
    stats_ticker.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if !input_open && in_flight.is_empty() {
            break;
        }

        tokio::select! {
            read = stdin.read_until(b'\n', &mut buf), if input_open => match read {
                Ok(0) => {
                    info!(pending = in_flight.len(), "Input closed, waiting for classifications");
                    input_open = false;
                }
                Ok(_) => {
                    line_no += 1;
                    let n = line_no;
                    let parsed = parse_request(&buf);
                    buf.clear();
                    match parsed {
                        Ok(Some(request)) => {
                            let pool = pool.clone();
                            in_flight.spawn(async move {
                                match pool.classify(request).await {
                                    Ok(result) => json!({ "line": n, "result": result }),
                                    Err(e) => json!({ "line": n, "error": e.to_string() }),
                                }
                            });
                        }
                        Ok(None) => {}
                        Err(message) => {
                            write_json(&mut stdout, &json!({ "line": n, "error": message })).await?;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    input_open = false;
                }
            },
            Some(joined) = in_flight.join_next() => match joined {
                Ok(output) => write_json(&mut stdout, &output).await?,
                Err(e) => warn!(error = %e, "Classification task failed to complete"),
            },
            _ = stats_ticker.tick() => log_stats(&pool).await,
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    pool.shutdown().await;

    // Anything still pending resolves as abandoned once the pool is down.
    while let Some(joined) = in_flight.join_next().await {
        if let Ok(output) = joined {
            write_json(&mut stdout, &output).await?;
        }
    }

    log_stats(&pool).await;
    eprintln!("   Processed {} input lines.", line_no);
    Ok(())
}

/// Decode one input line. Blank lines yield `Ok(None)`.
fn parse_request(raw: &[u8]) -> Result<Option<ClassificationRequest>, String> {
    let line = std::str::from_utf8(raw).map_err(|e| format!("invalid request: {e}"))?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| format!("invalid request: {e}"))
}

async fn write_json(out: &mut Stdout, value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

async fn log_stats(pool: &Dispatcher) {
    let stats = pool.stats().await;
    info!(
        workers = stats.total_workers,
        ready = stats.ready_workers,
        busy = stats.busy_workers,
        errored = stats.error_workers,
        dead = stats.dead_workers,
        restarting = stats.initializing_workers,
        queue = stats.queue_length,
        completed = stats.total_tasks_completed,
        failed = stats.total_tasks_failed,
        restarts = stats.total_restarts,
        breaker_open = stats.circuit_breaker.is_open,
        "Pool stats"
    );
}
