use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::admission::CaptureMode;
use facegate_core::overlay::{draw_overlay, OverlayStyle};
use facegate_core::session::REQUIRED_PHOTOS;
use facegate_core::sink::RegistrationSink;
use facegate_core::{FaceDetection, FrameEvaluator, RegistrationForm};
use facegate_hw::ImageDirSource;
use facegated::sink_http::{HttpAttendanceSink, HttpRegistrationSink};
use facegated::store::FileUserStore;
use facegated::{
    replay_detector, spawn_engine, Config, EngineError, EngineEvent, EngineHandle, Flow,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facegate", about = "Face-capture attendance and registration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct CaptureArgs {
    /// Directory of frames replayed as the camera
    #[arg(long)]
    frames: Option<PathBuf>,
    /// Detection recording (JSON lines); may be repeated, first that loads wins
    #[arg(long = "detections")]
    detections: Vec<String>,
    /// Base URL of the face service
    #[arg(long)]
    api_url: Option<String>,
    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify one frame against a detection result
    Evaluate {
        /// Frame image
        image: PathBuf,
        /// Detection JSON (a face object or `null`)
        detection: PathBuf,
        /// Write the frame with the status overlay drawn on it
        #[arg(long)]
        annotate: Option<PathBuf>,
        /// Use registration overlay colours
        #[arg(long)]
        registration: bool,
    },
    /// Capture once and mark attendance
    Attend {
        #[command(flatten)]
        capture: CaptureArgs,
        /// Room or session to record attendance for
        #[arg(long)]
        room: Option<String>,
    },
    /// Capture three photos and register a new user
    Register {
        #[command(flatten)]
        capture: CaptureArgs,
        /// Login identifier (e.g. student number or email)
        #[arg(long)]
        identifier: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Register into a local user store instead of the face service
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Check a login against the local store
    Login {
        #[arg(long)]
        store: Option<PathBuf>,
        /// Login identifier
        #[arg(long)]
        identifier: String,
    },
    /// List users in the local store
    Users {
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Evaluate {
            image,
            detection,
            annotate,
            registration,
        } => evaluate(&config, image, detection, annotate, registration)?,
        Commands::Attend { capture, room } => {
            capture.apply(&mut config);
            if room.is_some() {
                config.room = room;
            }
            attend(&config, Duration::from_secs(capture.timeout_secs)).await?;
        }
        Commands::Register {
            capture,
            identifier,
            name,
            store,
        } => {
            capture.apply(&mut config);
            let sink: Arc<dyn RegistrationSink> = match store.or(config.store_path.clone()) {
                Some(path) => Arc::new(FileUserStore::new(path)),
                None => Arc::new(HttpRegistrationSink::new(api_url(&config)?)?),
            };
            let credential = prompt_credential()?;
            let form = RegistrationForm::new(identifier, credential, name);
            form.validate()?;
            register(&config, sink, form, Duration::from_secs(capture.timeout_secs)).await?;
        }
        Commands::Login { store, identifier } => {
            let store = FileUserStore::new(store_path(&config, store)?);
            let password = prompt_credential()?;
            match store.authenticate(&identifier, &password).await? {
                Some(user) => println!(
                    "Logged in as {} ({}, {})",
                    user.name, user.identifier, user.role
                ),
                None => bail!("wrong identifier or password"),
            }
        }
        Commands::Users { store } => {
            let users = FileUserStore::new(store_path(&config, store)?).list().await?;
            if users.is_empty() {
                println!("No users registered");
            }
            for user in users {
                println!(
                    "{}  {:<20} {:<24} {} photo(s)  {}",
                    user.id,
                    user.identifier,
                    user.name,
                    user.photos.len(),
                    user.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }

    Ok(())
}

impl CaptureArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(frames) = &self.frames {
            config.frame_dir = Some(frames.clone());
        }
        if !self.detections.is_empty() {
            config.detection_sources = self.detections.clone();
        }
        if let Some(url) = &self.api_url {
            config.api_url = Some(url.clone());
        }
    }
}

fn store_path(config: &Config, store: Option<PathBuf>) -> Result<PathBuf> {
    store
        .or(config.store_path.clone())
        .context("no user store given (--store or FACEGATE_STORE_PATH)")
}

fn api_url(config: &Config) -> Result<&str> {
    config
        .api_url
        .as_deref()
        .context("no face service given (--api-url or FACEGATE_API_URL)")
}

fn evaluate(
    config: &Config,
    image: PathBuf,
    detection: PathBuf,
    annotate: Option<PathBuf>,
    registration: bool,
) -> Result<()> {
    let frame = image::open(&image)
        .with_context(|| format!("failed to open {}", image.display()))?
        .to_rgb8();
    let text = std::fs::read_to_string(&detection)
        .with_context(|| format!("failed to read {}", detection.display()))?;
    let detection: Option<FaceDetection> =
        serde_json::from_str(&text).context("invalid detection JSON")?;

    let evaluator = FrameEvaluator::new(config.evaluator_config());
    let classification = evaluator.evaluate(detection.as_ref(), frame.width(), frame.height());

    println!("{}", serde_json::to_string_pretty(&classification)?);
    println!("{}", classification.status.message());

    if let Some(out) = annotate {
        let style = if registration {
            OverlayStyle::registration()
        } else {
            OverlayStyle::attendance()
        };
        let mut canvas = frame;
        let drawn = detection
            .as_ref()
            .and_then(|d| d.valid_box())
            .map(|bbox| draw_overlay(&mut canvas, &classification, bbox, &style))
            .unwrap_or(false);
        canvas
            .save(&out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        if !drawn {
            println!("No face box to draw");
        }
        println!("Annotated frame written to {}", out.display());
    }
    Ok(())
}

type Events = tokio::sync::mpsc::UnboundedReceiver<EngineEvent>;

fn open_engine(config: &Config, flow: Flow) -> Result<(EngineHandle, Events)> {
    let frames = config
        .frame_dir
        .as_ref()
        .context("no frame directory given (--frames or FACEGATE_FRAME_DIR)")?;
    if config.detection_sources.is_empty() {
        bail!("no detection recording given (--detections or FACEGATE_DETECTION_SOURCES)");
    }
    let source = ImageDirSource::open(frames)?;
    Ok(spawn_engine(
        config.engine_settings(),
        Box::new(source),
        replay_detector(config.detection_sources.clone()),
        flow,
    ))
}

async fn attend(config: &Config, timeout: Duration) -> Result<()> {
    let sink = HttpAttendanceSink::new(api_url(config)?)?;
    let mut settings_config = config.clone();
    // one capture, then exit
    settings_config.mode = CaptureMode::AutoSingleShot;
    let (handle, mut events) = open_engine(
        &settings_config,
        Flow::Attendance {
            sink: Arc::new(sink),
            context: config.room.clone(),
        },
    )?;

    println!("Looking for a face...");
    let outcome = tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::DetectorUnavailable { message } => return Err(anyhow!(message)),
                EngineEvent::Captured { .. } => println!("Captured"),
                EngineEvent::CountdownTick { remaining } if remaining > 0 => {
                    println!("Submitting in {remaining}...")
                }
                EngineEvent::Submitted { receipt } => {
                    println!("Attendance recorded for {}", receipt.identity_label);
                    return Ok(());
                }
                EngineEvent::SubmissionFailed { message } => return Err(anyhow!(message)),
                _ => {}
            }
        }
        Err(anyhow!("capture engine stopped"))
    })
    .await;

    shutdown(&handle).await?;
    match outcome {
        Ok(result) => result,
        Err(_) => bail!("{} (gave up after {:?})", handle.status().message(), timeout),
    }
}

async fn register(
    config: &Config,
    sink: Arc<dyn RegistrationSink>,
    form: RegistrationForm,
    timeout: Duration,
) -> Result<()> {
    let (handle, _events) = open_engine(config, Flow::Registration { sink })?;
    let poll = config.engine_settings().poll_interval;

    println!("Look at the camera; {REQUIRED_PHOTOS} photos will be taken.");
    let captured = tokio::time::timeout(timeout, async {
        while handle.status().photos < REQUIRED_PHOTOS {
            match handle.trigger().await {
                Ok(()) => println!("Photo {}/{REQUIRED_PHOTOS}", handle.status().photos),
                Err(EngineError::Rejected(reason)) => {
                    let status = handle.status();
                    tracing::debug!(%reason, hint = status.message(), "waiting to capture");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(poll).await;
        }
        Ok(())
    })
    .await;

    let result = match captured {
        Ok(Ok(())) => handle.submit_registration(form).await.map_err(Into::into),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(anyhow!(
            "{} (gave up after {:?})",
            handle.status().message(),
            timeout
        )),
    };
    shutdown(&handle).await?;

    let identity = result?;
    println!(
        "Registered {} ({}) as {}",
        identity.display_name, identity.identifier, identity.id
    );
    Ok(())
}

async fn shutdown(handle: &EngineHandle) -> Result<()> {
    match handle.teardown().await {
        Ok(()) | Err(EngineError::ChannelClosed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn prompt_credential() -> Result<String> {
    eprint!("Password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
