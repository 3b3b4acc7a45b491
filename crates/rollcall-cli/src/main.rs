use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use rollcall_core::client::DEFAULT_API_URL;
use rollcall_core::{
    ActivityLogEntry, CredentialProvider, HttpVerificationClient, StaticCredential, StillFrame,
    TokenFile, VerificationClient, VerificationOutcome,
};
use rollcall_hw::Camera;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance scanner CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon state and recent activity
    Status,
    /// List recent check-ins
    Recent,
    /// Start scanning
    Start,
    /// Stop scanning
    Stop,
    /// Verify a single image file against the service (bypasses the daemon)
    Verify {
        /// JPEG or PNG image to upload
        image: PathBuf,
        /// Service base URL (default: $ROLLCALL_API_URL or http://127.0.0.1:8000)
        #[arg(long)]
        api_url: Option<String>,
        /// Bearer token (default: $ROLLCALL_TOKEN)
        #[arg(long)]
        token: Option<String>,
        /// File holding the bearer token, used when no token is given
        #[arg(long)]
        token_file: Option<PathBuf>,
    },
    /// Run camera diagnostics: list devices and capture one still
    Test {
        /// V4L2 device to capture from
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Where to write the captured JPEG
        #[arg(short, long, default_value = "rollcall-test.jpg")]
        output: PathBuf,
    },
}

#[zbus::proxy(
    interface = "io.rollcall.Scanner1",
    default_service = "io.rollcall.Scanner1",
    default_path = "/io/rollcall/Scanner1",
    gen_blocking = false
)]
trait Scanner {
    async fn status(&self) -> zbus::Result<String>;
    async fn recent_activity(&self) -> zbus::Result<String>;
    async fn start(&self) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<()>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let conn = connect(cli.system).await?;
            let proxy = ScannerProxy::new(&conn).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Recent => {
            let conn = connect(cli.system).await?;
            let proxy = ScannerProxy::new(&conn).await?;
            let recent: Vec<ActivityLogEntry> =
                serde_json::from_str(&proxy.recent_activity().await?)?;
            if recent.is_empty() {
                println!("Waiting for scans...");
            }
            for entry in &recent {
                println!("{:<32} {}  VERIFIED", entry.identity.name, display_time(entry));
            }
        }
        Commands::Start => {
            let conn = connect(cli.system).await?;
            ScannerProxy::new(&conn).await?.start().await?;
            println!("Scanning started");
        }
        Commands::Stop => {
            let conn = connect(cli.system).await?;
            ScannerProxy::new(&conn).await?.stop().await?;
            println!("Scanning stopped");
        }
        Commands::Verify {
            image,
            api_url,
            token,
            token_file,
        } => verify_file(&image, api_url, token, token_file).await?,
        Commands::Test { device, output } => camera_test(&device, &output)?,
    }

    Ok(())
}

async fn connect(system: bool) -> Result<zbus::Connection> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    };
    conn.context("failed to connect to D-Bus")
}

async fn verify_file(
    image: &Path,
    api_url: Option<String>,
    token: Option<String>,
    token_file: Option<PathBuf>,
) -> Result<()> {
    let data = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
    let frame = StillFrame {
        data,
        mime_type: mime_for(image).to_string(),
    };

    let api_url = api_url
        .or_else(|| std::env::var("ROLLCALL_API_URL").ok())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let credentials: Arc<dyn CredentialProvider> =
        match token.or_else(|| std::env::var("ROLLCALL_TOKEN").ok()) {
            Some(token) => Arc::new(StaticCredential::new(token)),
            None => match token_file {
                Some(path) => Arc::new(TokenFile::new(path)),
                None => Arc::new(StaticCredential::none()),
            },
        };

    let client = HttpVerificationClient::new(&api_url, credentials, Duration::from_secs(10))?;
    println!("Verifying {} against {}", image.display(), client.endpoint());

    match client.verify(&frame).await {
        VerificationOutcome::Matched {
            identity,
            confidence,
            server_timestamp,
            attendance_id,
        } => {
            println!("Matched: {} (id {})", identity.name, identity.id);
            if let Some(confidence) = confidence {
                println!("  confidence: {confidence:.3}");
            }
            if let Some(ts) = server_timestamp {
                println!("  recorded:   {}", ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(id) = attendance_id {
                println!("  attendance: {id}");
            }
            Ok(())
        }
        VerificationOutcome::Unmatched => bail!("face not recognized"),
        VerificationOutcome::TransportError(e) => bail!("verification failed: {e}"),
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}

fn display_time(entry: &ActivityLogEntry) -> String {
    let at = entry
        .server_timestamp
        .or_else(|| DateTime::from_timestamp_millis(entry.confirmed_at_ms));
    match at {
        Some(ts) => ts.with_timezone(&Local).format("%H:%M").to_string(),
        None => "--:--".to_string(),
    }
}

fn camera_test(device: &str, output: &Path) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for info in &devices {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let camera = Camera::open(device, 640, 480).with_context(|| format!("failed to open {device}"))?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let frame = camera.capture_still()?;
    std::fs::write(output, &frame.jpeg)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Captured frame #{} ({} bytes) -> {}",
        frame.sequence,
        frame.jpeg.len(),
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rollcall_core::Identity;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verify() {
        let cli = Cli::parse_from(["rollcall", "verify", "face.jpg", "--token", "abc"]);
        match cli.command {
            Commands::Verify { image, token, .. } => {
                assert_eq!(image, PathBuf::from("face.jpg"));
                assert_eq!(token.as_deref(), Some("abc"));
            }
            _ => panic!("expected verify"),
        }
        assert!(!cli.system);
    }

    #[test]
    fn test_system_flag_is_global() {
        let cli = Cli::parse_from(["rollcall", "status", "--system"]);
        assert!(cli.system);
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn test_display_time_without_timestamp() {
        let entry = ActivityLogEntry {
            identity: Identity::new("1", "Ada"),
            confirmed_at_ms: i64::MAX,
            server_timestamp: None,
            attendance_id: None,
        };
        assert_eq!(display_time(&entry), "--:--");
    }
}
