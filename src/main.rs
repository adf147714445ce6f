use clap::{Parser, Subcommand};
use anyhow::Result;
use std::path::PathBuf;
use kiosk_face::cli::commands::{self, DetectionFilter};
use kiosk_face::cli::Kiosk;
use kiosk_face::{Config, DevMode};

#[derive(Parser)]
#[command(name = "kioskface")]
#[command(about = "Face enrollment and recognition for unattended kiosks")]
struct Cli {
    /// Enable development mode (keeps all data under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run passive recognition on the configured cameras
    Run {
        /// Only this camera
        #[arg(short, long)]
        camera: Option<String>,
        /// Show an ASCII preview of the first camera
        #[arg(long)]
        preview: bool,
    },
    /// Enroll a new client
    Enroll {
        #[arg(short, long)]
        identity: String,
        #[arg(short, long)]
        camera: Option<String>,
        /// Replace an existing active profile
        #[arg(long)]
        replace: bool,
        /// Reference to the client's registration photo
        #[arg(long)]
        image_ref: Option<String>,
    },
    /// Add samples to an existing profile
    Append {
        #[arg(short, long)]
        identity: String,
        #[arg(short, long)]
        camera: Option<String>,
    },
    /// Deactivate a client's active profile
    Deactivate {
        #[arg(short, long)]
        identity: String,
        /// Provider name (defaults to the configured extractor)
        #[arg(short, long)]
        provider: Option<String>,
    },
    /// Show profile counts, or one client's profiles
    Profiles {
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// List recorded detections, newest first
    Detections {
        #[arg(short, long)]
        camera: Option<String>,
        #[arg(short, long)]
        identity: Option<String>,
        /// MATCHED, NEW_FACE, MULTIPLE_MATCHES or UNKNOWN
        #[arg(short, long)]
        status: Option<String>,
        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<String>,
        /// RFC 3339 upper bound
        #[arg(long)]
        until: Option<String>,
        #[arg(short, long, default_value = "100")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long)]
        json: bool,
    },
    /// Detection counts per classification and camera
    Stats,
    /// Check the ledger hash chain and signatures
    VerifyLedger,
    /// List V4L2 cameras
    DetectCamera,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    if let Commands::DetectCamera = cli.command {
        return commands::detect_camera();
    }

    let config = Config::load(cli.config.as_deref(), cli.dev)?;
    let dev_mode = DevMode::new(cli.dev)?;
    let kiosk = Kiosk::new(config, dev_mode);

    match cli.command {
        Commands::Run { camera, preview } => {
            commands::run(&kiosk, camera.as_deref(), preview).await?;
        }
        Commands::Enroll { identity, camera, replace, image_ref } => {
            commands::enroll(&kiosk, &identity, camera.as_deref(), replace, image_ref).await?;
        }
        Commands::Append { identity, camera } => {
            commands::append(&kiosk, &identity, camera.as_deref()).await?;
        }
        Commands::Deactivate { identity, provider } => {
            commands::deactivate(&kiosk, &identity, provider.as_deref()).await?;
        }
        Commands::Profiles { identity } => {
            commands::profiles(&kiosk, identity.as_deref()).await?;
        }
        Commands::Detections { camera, identity, status, since, until, limit, offset, json } => {
            let filter = DetectionFilter {
                camera: camera.as_deref(),
                identity: identity.as_deref(),
                status: status.as_deref(),
                since: since.as_deref(),
                until: until.as_deref(),
                limit,
                offset,
                json,
            };
            commands::detections(&kiosk, filter).await?;
        }
        Commands::Stats => commands::stats(&kiosk).await?,
        Commands::VerifyLedger => commands::verify_ledger(&kiosk).await?,
        Commands::DetectCamera => unreachable!("handled before config is loaded"),
    }

    Ok(())
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
        tracing_subscriber::fmt::init();
    }
}
