use face_attendance::{
    camera::{CameraBackend, V4l2Backend},
    config::{Config, DEFAULT_CONFIG_PATH},
    core::Annotator,
    dev_mode::DevMode,
    http::{self, AppState},
    service::{Networks, SessionController, Trainer},
    storage::{AttendanceLedger, CredentialStore, ModelStore, Thresholds, XlsxLedgerStore},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "face-attendance")]
#[command(about = "Webcam face recognition attendance service")]
struct Cli {
    /// Enable development mode (keeps all data under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Override the configured bind address
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Rebuild the classifier from the enrolled faces
    Train,
    /// List capture devices
    ListCameras,
    /// Replace the admin password
    SetPassword {
        #[arg(short, long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    let config = Config::load_or_default(&cli.config)?;
    let dev_mode = DevMode::new(cli.dev)?;
    let layout = dev_mode.layout(&config)?;
    tracing::info!("Data directory: {}", layout.root().display());

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            serve(config, layout, &bind).await?;
        }
        Commands::Train => {
            let networks = Networks::load(&config, &layout)
                .context("Face detection and embedding models are required for training")?;
            let trainer = Trainer::new(
                networks.detector.as_ref(),
                networks.embedder.as_ref(),
                &config.recognition,
            );
            let (report, _) = trainer.run(&layout.faces_dir(), &ModelStore::new(layout.models_dir()))?;
            println!("Trained on {} images of {} identities", report.used, report.identities.len());
            for (name, count) in &report.identities {
                println!("  {}: {}", name, count);
            }
            println!(
                "Discarded: {} without a face, {} with multiple faces, {} unreadable",
                report.no_face, report.multiple_faces, report.unreadable
            );
        }
        Commands::ListCameras => {
            let cameras = V4l2Backend::new(&config.camera).list_cameras()?;
            if cameras.is_empty() {
                println!("No capture devices found");
            }
            for camera in cameras {
                println!("/dev/video{}: {} [{}]", camera.index, camera.name, camera.formats.join(", "));
            }
        }
        Commands::SetPassword { password } => {
            let store = CredentialStore::open_or_init(layout.passkey_dir(), &config.security.default_password)?;
            store.reset(&password)?;
            println!("Admin password updated");
        }
    }

    Ok(())
}

async fn serve(config: Config, layout: face_attendance::DataLayout, bind: &str) -> Result<()> {
    let networks = match Networks::load(&config, &layout) {
        Ok(networks) => Some(networks),
        Err(e) => {
            tracing::warn!("Recognition models unavailable, only capture will work: {}", e);
            None
        }
    };

    let annotator = match Annotator::from_config(&config.annotation) {
        Ok(annotator) => annotator,
        Err(e) => {
            tracing::warn!("Annotation font unavailable, using bundled font: {}", e);
            Annotator::bundled(config.annotation.font_scale)?
        }
    };

    let ledger = AttendanceLedger::open(
        Box::new(XlsxLedgerStore::new(layout.attendance_dir())?),
        chrono::Local::now().date_naive(),
        Thresholds::from_config(&config.recognition),
        Duration::from_secs(config.attendance.flush_interval_secs),
    )?;
    let credentials = CredentialStore::open_or_init(layout.passkey_dir(), &config.security.default_password)?;

    let static_dir = config.server.static_dir.clone();
    let backend = Arc::new(V4l2Backend::new(&config.camera));
    let session = Arc::new(SessionController::new(backend, config, layout, ledger, networks, annotator));

    let state = AppState {
        session: session.clone(),
        credentials: Arc::new(credentials),
    };
    let app = http::router(state, &static_dir);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!("Listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutting down");
            // Stopping the session closes open MJPEG streams so connections can drain
            match tokio::task::spawn_blocking(move || session.stop()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("Failed to stop session: {}", e),
                Err(e) => tracing::error!("Shutdown task failed: {}", e),
            }
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }
}
