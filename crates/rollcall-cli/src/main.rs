use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::config::default_artifact_path;
use rollcall_core::{
    FaceGallery, FaceModelConfig, FingerprintConfig, OnnxFaceBackend, PairwiseVerifier, Trainer, TrainingConfig,
};
use rollcall_hw::Camera;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    fn start_camera(&self) -> zbus::Result<bool>;
    fn stop_camera(&self) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn verify_fingerprint(&self, enrolled: &str, query: &str, threshold: f64) -> zbus::Result<(bool, f64)>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the fingerprint verifier on a directory of scans
    Train {
        /// Directory of `<identity>_<sample>.<ext>` scans
        #[arg(short, long)]
        corpus: PathBuf,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Side length images are resized to
        #[arg(long)]
        input_size: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Where to write the trained model
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compare an enrolled fingerprint scan with a query scan
    Verify {
        enrolled: PathBuf,
        query: PathBuf,
        /// Acceptance threshold (defaults to the configured one)
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Trained model to load for local verification
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// Ask the running daemon instead of loading the model here
        #[arg(long)]
        daemon: bool,
    },
    /// Control the daemon's live camera session
    Camera {
        #[command(subcommand)]
        action: CameraAction,
    },
    /// Load a face gallery and list enrolled identities
    Gallery {
        /// Root directory with one subdirectory per identity
        #[arg(short, long)]
        dir: PathBuf,
        /// Directory holding the ONNX face models
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Subcommand)]
enum CameraAction {
    Start,
    Stop,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            corpus,
            epochs,
            batch_size,
            input_size,
            seed,
            output,
        } => {
            let mut fingerprint = FingerprintConfig::default();
            if let Some(size) = input_size {
                fingerprint.input_size = size;
            }
            let mut training = TrainingConfig {
                artifact_path: output.unwrap_or_else(default_artifact_path),
                ..TrainingConfig::default()
            };
            if let Some(epochs) = epochs {
                training.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                training.batch_size = batch_size;
            }
            if let Some(seed) = seed {
                training.seed = seed;
            }

            tracing::info!(
                corpus = %corpus.display(),
                epochs = training.epochs,
                output = %training.artifact_path.display(),
                "training fingerprint verifier"
            );
            let report = tokio::task::spawn_blocking(move || Trainer::new(fingerprint, training).run(&corpus))
                .await?
                .context("training failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Verify {
            enrolled,
            query,
            threshold,
            model,
            daemon,
        } => {
            if daemon {
                let proxy = connect(cli.system).await?;
                let (verified, score) = proxy
                    .verify_fingerprint(
                        &path_arg(&enrolled)?,
                        &path_arg(&query)?,
                        threshold.map(f64::from).unwrap_or(0.0),
                    )
                    .await?;
                println!("{}", serde_json::json!({ "verified": verified, "score": score }));
            } else {
                let model = model.unwrap_or_else(default_artifact_path);
                let verification = tokio::task::spawn_blocking(move || {
                    PairwiseVerifier::from_artifact(FingerprintConfig::default(), &model)?
                        .verify(&enrolled, &query, threshold)
                })
                .await??;
                println!("{}", serde_json::to_string_pretty(&verification)?);
            }
        }
        Commands::Camera { action } => {
            let proxy = connect(cli.system).await?;
            match action {
                CameraAction::Start => {
                    if proxy.start_camera().await? {
                        println!("camera session started");
                    } else {
                        println!("camera session already running");
                    }
                }
                CameraAction::Stop => {
                    if proxy.stop_camera().await? {
                        println!("camera session stopped");
                    } else {
                        println!("no camera session running");
                    }
                }
                CameraAction::Status => {
                    let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
            }
        }
        Commands::Gallery { dir, model_dir } => {
            let mut models = FaceModelConfig::default();
            if let Some(model_dir) = model_dir {
                models.model_dir = model_dir;
            }
            let gallery = tokio::task::spawn_blocking(move || -> Result<FaceGallery> {
                let mut backend = OnnxFaceBackend::load(&models)?;
                Ok(FaceGallery::load_dir(&dir, &mut backend)?)
            })
            .await??;

            let mut samples: BTreeMap<&str, usize> = BTreeMap::new();
            for entry in gallery.entries() {
                *samples.entry(entry.identity.as_str()).or_default() += 1;
            }
            if samples.is_empty() {
                println!("no faces enrolled");
            }
            for (identity, count) in samples {
                println!("{identity}\t{count}");
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no capture devices found");
            }
            for dev in devices {
                println!("{}\t{} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}

async fn connect(system: bool) -> Result<RollcallProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

/// The daemon resolves paths in its own working directory, so send absolute ones.
fn path_arg(path: &Path) -> Result<String> {
    let absolute = std::fs::canonicalize(path).with_context(|| format!("cannot resolve {}", path.display()))?;
    absolute
        .to_str()
        .map(str::to_string)
        .with_context(|| format!("path is not valid UTF-8: {}", absolute.display()))
}
