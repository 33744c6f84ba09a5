use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.clockface.Attendance1",
    default_service = "org.clockface.Attendance1",
    default_path = "/org/clockface/Attendance1"
)]
trait Attendance {
    async fn verify(
        &self,
        identity: &str,
        frames: Vec<Vec<u8>>,
        latitude: f64,
        longitude: f64,
    ) -> zbus::Result<String>;
    async fn register(&self, identity: &str, frames: Vec<Vec<u8>>) -> zbus::Result<String>;
    async fn invalidate(&self, identity: &str) -> zbus::Result<bool>;
    async fn remove(&self, identity: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "clockface", about = "Clockface attendance verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify attendance from a burst of captured frames
    Verify {
        /// Identity to verify as
        identity: String,
        /// Latitude of the device, in degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        /// Longitude of the device, in degrees
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Encoded image files, in capture order
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Register a reference face from several poses
    Register {
        identity: String,
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Drop the daemon's cached reference for an identity
    Invalidate { identity: String },
    /// Delete a registration
    Remove { identity: String },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("clockfaced is not reachable")?;

    match cli.command {
        Commands::Verify {
            identity,
            lat,
            lon,
            frames,
        } => {
            let frames = read_frames(&frames)?;
            let reply = proxy.verify(&identity, frames, lat, lon).await?;
            let outcome = print_json(&reply)?;
            if outcome["verdict"]["status"] != "PASSED" {
                std::process::exit(1);
            }
        }
        Commands::Register { identity, frames } => {
            let frames = read_frames(&frames)?;
            let reply = proxy.register(&identity, frames).await?;
            print_json(&reply)?;
        }
        Commands::Invalidate { identity } => {
            let evicted = proxy.invalidate(&identity).await?;
            if evicted {
                println!("Evicted cached reference for {identity}");
            } else {
                println!("No cached reference for {identity}");
            }
        }
        Commands::Remove { identity } => {
            if proxy.remove(&identity).await? {
                println!("Removed registration for {identity}");
            } else {
                println!("{identity} is not registered");
            }
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            print_json(&reply)?;
        }
    }

    Ok(())
}

fn read_frames(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths.iter().map(|p| read_frame(p)).collect()
}

fn read_frame(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(reply: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(reply).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verify_accepts_negative_coordinates() {
        let cli = Cli::try_parse_from([
            "clockface", "verify", "emp-1", "--lat", "-33.86", "--lon", "-151.2", "a.jpg", "b.jpg",
        ])
        .unwrap();
        match cli.command {
            Commands::Verify { lat, lon, frames, .. } => {
                assert_eq!(lat, -33.86);
                assert_eq!(lon, -151.2);
                assert_eq!(frames.len(), 2);
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_verify_requires_frames() {
        assert!(Cli::try_parse_from(["clockface", "verify", "emp-1", "--lat", "0", "--lon", "0"]).is_err());
    }

    #[test]
    fn test_missing_frame_file_names_path() {
        let err = read_frames(&[PathBuf::from("/nonexistent/frame.jpg")]).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/frame.jpg"));
    }
}
