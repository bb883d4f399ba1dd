//! Command execution.

use crate::Commands;
use colored::Colorize;
use seqrpc_client::{Client, ClientError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

const PING: &str = "Sys.Ping";
const LIST_METHODS: &str = "Sys.Methods";
const ECHO: &str = "Echo.Say";
const SUM: &str = "Arith.Sum";
const SLEEP: &str = "Arith.Sleep";

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Arc<Client>, cmd: Commands) -> Result<String, ClientError> {
    match cmd {
        Commands::Ping => {
            let start = Instant::now();
            let reply: String = client.call(PING, &()).await?;
            Ok(format!(
                "{} ({:?})",
                reply.to_uppercase().green(),
                start.elapsed()
            ))
        }

        Commands::Methods => {
            let names: Vec<String> = client.call(LIST_METHODS, &()).await?;
            if names.is_empty() {
                return Ok("No methods registered".yellow().to_string());
            }
            Ok(names
                .iter()
                .map(|name| format!("  {}", name.cyan()))
                .collect::<Vec<_>>()
                .join("\n"))
        }

        Commands::Echo { text } => client.call(ECHO, &text).await,

        Commands::Sum { a, b } => {
            let sum: i64 = client.call(SUM, &(a, b)).await?;
            Ok(format!("{} + {} = {}", a, b, sum.to_string().cyan()))
        }

        Commands::Sleep { ms } => {
            let start = Instant::now();
            let slept: u64 = client.call(SLEEP, &ms).await?;
            Ok(format!(
                "slept {}ms (round trip {:?})",
                slept,
                start.elapsed()
            ))
        }

        Commands::Bench { calls, concurrency } => bench(client, calls, concurrency.max(1)).await,
    }
}

/// Runs `calls` sums spread over `concurrency` workers sharing one client.
async fn bench(
    client: &Arc<Client>,
    calls: usize,
    concurrency: usize,
) -> Result<String, ClientError> {
    let next = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut workers = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let client = client.clone();
        let next = next.clone();
        workers.push(tokio::spawn(async move {
            let mut errors = 0usize;
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= calls {
                    break;
                }
                let expected = i as i64 + 1;
                match client.call::<_, i64>(SUM, &(i as i64, 1i64)).await {
                    Ok(sum) if sum == expected => {}
                    Ok(sum) => {
                        tracing::warn!("call {} returned {} (expected {})", i, sum, expected);
                        errors += 1;
                    }
                    Err(e) if e.is_shutdown() => return Err(e),
                    Err(e) => {
                        tracing::warn!("call {} failed: {}", i, e);
                        errors += 1;
                    }
                }
            }
            Ok(errors)
        }));
    }

    let mut errors = 0;
    for worker in workers {
        match worker.await {
            Ok(result) => errors += result?,
            Err(e) => {
                tracing::warn!("bench worker failed: {}", e);
                errors += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    let rate = calls as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    let summary = format!(
        "{} calls in {:?} ({:.0} calls/s, concurrency {})",
        calls, elapsed, rate, concurrency
    );
    if errors == 0 {
        Ok(summary.green().to_string())
    } else {
        Ok(format!("{}, {} errors", summary, errors).yellow().to_string())
    }
}
