use anyhow::Result;
use clap::Parser;
use throttle_stage::config::{Config, CostBy};
use throttle_stage::driver::{run_throttle, Termination};
use throttle_stage::throttler::{len_cost, unit_cost};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::parse();

    // stdout carries the throttled lines, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("throttle_stage={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let throttle_config = config
        .throttle_config()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing::info!(
        cost = throttle_config.cost,
        per = ?throttle_config.per,
        maximum_burst = %throttle_config.maximum_burst,
        mode = %throttle_config.mode,
        cost_by = ?config.cost_by,
        "Starting throttle"
    );

    let (upstream_tx, upstream_rx) = mpsc::channel::<Result<String, String>>(config.buffer());
    let (downstream_tx, mut downstream_rx) = mpsc::channel::<String>(config.buffer());

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let next = match lines.next_line().await {
                Ok(Some(line)) => Ok(line),
                Ok(None) => break,
                Err(e) => Err(format!("failed to read stdin: {}", e)),
            };
            let failed = next.is_err();
            if upstream_tx.send(next).await.is_err() || failed {
                break;
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = downstream_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let termination = match config.cost_by {
        CostBy::Lines => {
            run_throttle(&throttle_config, unit_cost::<String>, upstream_rx, downstream_tx).await
        }
        CostBy::Bytes => {
            run_throttle(
                &throttle_config,
                |line: &String| len_cost(line) + 1,
                upstream_rx,
                downstream_tx,
            )
            .await
        }
    };

    reader.abort();
    writer.await??;

    match termination {
        Ok(Termination::Completed) => tracing::info!("Input exhausted, throttle completed"),
        Ok(Termination::Cancelled) => tracing::info!("Output closed, throttle cancelled"),
        Err(e) => {
            tracing::error!(error = %e, raised_by_throttle = e.is_local(), "Throttle failed");
            return Err(anyhow::anyhow!("Throttle failed: {}", e));
        }
    }

    Ok(())
}
