use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use batchflow::history::{HistoryRecorder, HttpHistoryClient};
use batchflow::{Config, FanoutDispatcher, Notifier, PipelineHandle, PipelineOptions};
use shared_types::ToastPayload;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: batchflow <pipeline|fanout> <customer numbers...>";
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let mut args = std::env::args().skip(1);
    let mode = args.next();
    let numbers: Vec<String> = args.collect();

    match mode.as_deref() {
        Some("pipeline") => run_pipeline(&config, numbers).await,
        Some("fanout") => run_fanout(&config, numbers).await,
        _ => bail!(USAGE),
    }
}

fn init_tracing() {
    let json = matches!(
        std::env::var("BATCHFLOW_LOG_JSON").as_deref(),
        Ok("1") | Ok("true")
    );
    let (plain, structured) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batchflow=debug,shared_types=info".into()),
        )
        .with(plain)
        .with(structured)
        .init();
}

fn print_toasts(mut toasts: mpsc::UnboundedReceiver<ToastPayload>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(toast) = toasts.recv().await {
            println!("({:?}) {}", toast.tone, toast.message);
        }
    })
}

/// Print log lines not printed yet; `printed` tracks how many were shown.
fn print_new_lines(logs: &[String], printed: &mut usize) {
    let start = (*printed).min(logs.len());
    for line in &logs[start..] {
        println!("{}", line.trim_end());
    }
    *printed = logs.len();
}

async fn run_pipeline(config: &Config, numbers: Vec<String>) -> anyhow::Result<()> {
    let (notifier, toasts) = Notifier::channel();
    let printer = print_toasts(toasts);

    let client = HttpHistoryClient::new(config.api_base_url.clone(), config.http_timeout)?;
    let recorder = HistoryRecorder::new(Arc::new(client));
    let options = PipelineOptions::from_config(config, Some(recorder), notifier);
    let (pipeline, actor_handle) = PipelineHandle::spawn(options).await?;

    info!(url = %config.ws_url, "connecting pipeline socket");
    pipeline
        .connect(&config.ws_url)
        .await
        .with_context(|| format!("connecting to {}", config.ws_url))?;

    // Session ownership is only meaningful once the welcome frame assigned an id
    tokio::time::timeout(WELCOME_TIMEOUT, async {
        loop {
            match pipeline.snapshot().await {
                Ok(snapshot) if snapshot.connection_id.is_some() => break,
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no welcome frame within {WELCOME_TIMEOUT:?}"))?;

    pipeline.start(numbers).await?;

    let mut printed = 0;
    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if let Err(e) = pipeline.cancel().await {
                    tracing::warn!("cancel failed: {e}");
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        let snapshot = pipeline.snapshot().await?;
        print_new_lines(&snapshot.logs, &mut printed);
        if !snapshot.running {
            break snapshot;
        }
    };

    let succeeded = finished.steps.iter().all(|s| *s == shared_types::StepStatus::Success);
    if succeeded {
        // History is submitted in the background; wait for its outcome line
        let _ = tokio::time::timeout(config.http_timeout, async {
            loop {
                match pipeline.snapshot().await {
                    Ok(snapshot) => {
                        print_new_lines(&snapshot.logs, &mut printed);
                        if snapshot.logs.iter().any(|l| l.to_lowercase().contains("load history")) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;
    }

    pipeline.shutdown().await;
    let _ = actor_handle.await;
    printer.abort();

    if succeeded {
        Ok(())
    } else {
        bail!(
            "pipeline did not complete: {}",
            finished.last_error.unwrap_or_else(|| "cancelled".to_string())
        )
    }
}

async fn run_fanout(config: &Config, numbers: Vec<String>) -> anyhow::Result<()> {
    let (notifier, toasts) = Notifier::channel();
    let printer = print_toasts(toasts);

    let (dispatcher, pump) =
        FanoutDispatcher::spawn(config.reconnect, notifier, config.output_log_capacity);

    info!(url = %config.task_ws_url, "connecting task socket");
    dispatcher
        .connect(&config.task_ws_url)
        .await
        .with_context(|| format!("connecting to {}", config.task_ws_url))?;

    let launch = dispatcher.launch(numbers);
    tokio::pin!(launch);
    let result = tokio::select! {
        result = &mut launch => result,
        _ = tokio::signal::ctrl_c() => {
            dispatcher.cancel();
            launch.await
        }
    };

    let mut printed = 0;
    print_new_lines(&dispatcher.snapshot().logs, &mut printed);

    dispatcher.connection().close().await;
    pump.abort();
    printer.abort();

    result.map_err(Into::into)
}
