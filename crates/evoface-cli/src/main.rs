use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod setup;

#[zbus::proxy(
    interface = "org.evoface.Attendance1",
    default_service = "org.evoface.Attendance1",
    default_path = "/org/evoface/Attendance1"
)]
trait Attendance {
    async fn status(&self) -> zbus::Result<String>;
    async fn last_report(&self) -> zbus::Result<String>;
    async fn recent_logs(&self, limit: u32) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<u32>;
    async fn enroll(
        &self,
        id: &str,
        name: &str,
        image_path: &str,
        default_shift: &str,
    ) -> zbus::Result<bool>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn backfill(&self, id: &str, date: &str, time: &str) -> zbus::Result<String>;
    async fn manual_check_in(&self, id: &str) -> zbus::Result<(bool, String)>;
    async fn reset_liveness(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "evoface", version, about = "EvoFace attendance: model setup and daemon control")]
struct Cli {
    /// Talk to a daemon on the session bus (development mode).
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify the ONNX models.
    Setup {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Show daemon status.
    Status,
    /// Show the latest per-frame report.
    Last,
    /// List recent attendance events.
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Rebuild the identity table from the database.
    Reload,
    /// Enroll the face in an image (the largest, if several).
    Enroll {
        id: String,
        name: String,
        image: PathBuf,
        #[arg(long)]
        shift: Option<String>,
    },
    /// Remove an identity and its history.
    Remove { id: String },
    /// Record an event for a past business day (`YYYY-MM-DD`, `HH:MM[:SS]`).
    Backfill { id: String, date: String, time: String },
    /// Record a live event for an identity chosen by the operator.
    Checkin { id: String },
    /// Clear liveness progress and cooldown.
    Reset,
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        },
        Err(_) => println!("{raw}"),
    }
}

async fn connect(session: bool) -> Result<AttendanceProxy<'static>> {
    tracing::debug!(session, "connecting to evofaced");
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("failed to reach evofaced")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let session = cli.session;

    match cli.command {
        Command::Setup { model_dir } => setup::run(model_dir)?,
        Command::Status => print_json(&connect(session).await?.status().await?),
        Command::Last => print_json(&connect(session).await?.last_report().await?),
        Command::Logs { limit } => print_json(&connect(session).await?.recent_logs(limit).await?),
        Command::Reload => {
            let count = connect(session).await?.reload().await?;
            println!("identity table reloaded: {count} identities");
        }
        Command::Enroll {
            id,
            name,
            image,
            shift,
        } => {
            let image = image
                .canonicalize()
                .with_context(|| format!("cannot resolve {}", image.display()))?;
            let path = image.to_string_lossy();
            connect(session)
                .await?
                .enroll(&id, &name, &path, shift.as_deref().unwrap_or(""))
                .await?;
            println!("enrolled {id} ({name})");
        }
        Command::Remove { id } => {
            if connect(session).await?.remove_identity(&id).await? {
                println!("removed {id}");
            } else {
                println!("no identity {id}");
            }
        }
        Command::Backfill { id, date, time } => {
            let ts = connect(session).await?.backfill(&id, &date, &time).await?;
            println!("recorded {id} at {ts}");
        }
        Command::Checkin { id } => {
            let (recorded, message) = connect(session).await?.manual_check_in(&id).await?;
            println!("{message}");
            if !recorded {
                std::process::exit(2);
            }
        }
        Command::Reset => {
            connect(session).await?.reset_liveness().await?;
            println!("liveness gate reset");
        }
    }

    Ok(())
}
