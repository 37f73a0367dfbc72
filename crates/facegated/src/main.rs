use anyhow::{Context, Result};
use facegate_hw::ImageDirSource;
use facegated::sink_http::HttpAttendanceSink;
use facegated::{replay_detector, spawn_engine, Config, EngineError, EngineEvent, EngineHandle, Flow};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load()?;
    let frame_dir = config
        .frame_dir
        .as_ref()
        .context("no frame directory configured (FACEGATE_FRAME_DIR)")?;
    let api_url = config
        .api_url
        .as_deref()
        .context("no recognition service configured (FACEGATE_API_URL)")?;

    let source = ImageDirSource::open(frame_dir)?;
    let sink = HttpAttendanceSink::new(api_url)?;
    let (handle, mut events) = spawn_engine(
        config.engine_settings(),
        Box::new(source),
        replay_detector(config.detection_sources.clone()),
        Flow::Attendance {
            sink: Arc::new(sink),
            context: config.room.clone(),
        },
    );

    tracing::info!(
        mode = ?config.mode,
        room = ?config.room,
        api_url = %api_url,
        "facegated ready; Enter captures, `r` resets"
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                tracing::info!("facegated shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => command(&handle, line.trim()).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    match handle.teardown().await {
        Ok(()) | Err(EngineError::ChannelClosed) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn command(handle: &EngineHandle, line: &str) {
    let result = match line {
        "" => handle.trigger().await,
        "r" | "reset" => handle.reset().await,
        other => {
            tracing::warn!(input = other, "unknown command");
            return;
        }
    };
    if let Err(e) = result {
        let status = handle.status();
        tracing::info!(reason = %e, hint = status.message(), "request not admitted");
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::DetectorReady { source } => {
            tracing::info!(source = %source, "face detector ready")
        }
        EngineEvent::DetectorUnavailable { message } => {
            tracing::error!(error = %message, "face detector unavailable")
        }
        EngineEvent::Captured { trigger } => tracing::info!(trigger = ?trigger, "captured"),
        EngineEvent::CountdownTick { remaining } => {
            tracing::info!(remaining, "submitting in")
        }
        EngineEvent::Submitted { receipt } => {
            tracing::info!(identity = %receipt.identity_label, "attendance recorded")
        }
        EngineEvent::SubmissionFailed { message } => {
            tracing::warn!(error = %message, "attendance failed")
        }
        EngineEvent::SessionReset => tracing::info!("ready for the next person"),
        EngineEvent::PhotoAdded { .. } | EngineEvent::Registered { .. } => {}
    }
}
