use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mien_hw::{CameraSession, FrameGrabber};

#[zbus::proxy(
    interface = "org.mien.Kiosk1",
    default_service = "org.mien.Kiosk1",
    default_path = "/org/mien/Kiosk1"
)]
trait Kiosk {
    async fn scan_start(&self) -> zbus::Result<bool>;
    async fn scan_stop(&self) -> zbus::Result<()>;
    async fn scan_status(&self) -> zbus::Result<String>;
    async fn scan_wait_for_face(&self, timeout_ms: u64) -> zbus::Result<String>;
    async fn enroll_capture(&self, member: &str, label: &str) -> zbus::Result<String>;
    async fn enroll_confirm(&self, member: &str) -> zbus::Result<String>;
    async fn enroll_cancel(&self, member: &str) -> zbus::Result<bool>;
    async fn verify(&self, member: &str) -> zbus::Result<String>;
    async fn list_faces(&self) -> zbus::Result<String>;
    async fn remove_face(&self, member: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn notifications(&self) -> zbus::Result<String>;
    async fn mark_notification_read(&self, id: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "mien", about = "Mien club check-in CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a still and stage a face enrollment for a member
    Enroll {
        /// Member identifier
        member: String,
        /// Label for this enrollment (e.g., "glasses")
        #[arg(short, long, default_value = "front-desk")]
        label: String,
    },
    /// Save the staged enrollment
    Confirm {
        member: String,
    },
    /// Discard a staged enrollment
    Cancel {
        member: String,
    },
    /// Check a member in by face
    Verify {
        member: String,
    },
    /// Control the live detection loop
    Scan {
        #[command(subcommand)]
        action: ScanAction,
    },
    /// List enrolled members
    List,
    /// Remove a member's enrollment
    Remove {
        member: String,
    },
    /// Show daemon status
    Status,
    /// Show the notification ledger
    Notifications,
    /// Mark a notification read
    Read {
        id: String,
    },
    /// Grab one frame directly from the camera and save it as PNG
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Output file
        #[arg(short, long, default_value = "mien-test.png")]
        output: String,
    },
}

#[derive(Subcommand)]
enum ScanAction {
    Start,
    Stop,
    Status,
    /// Wait for the scan to see exactly one face
    Wait {
        /// Give up after this many milliseconds
        #[arg(short, long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // The camera diagnostic bypasses the daemon on purpose.
    if let Commands::Test { device, output } = &cli.command {
        return run_camera_test(device, output);
    }

    let connection = zbus::Connection::session()
        .await
        .context("connecting to the session bus — is miend running?")?;
    let kiosk = KioskProxy::new(&connection).await?;

    match cli.command {
        Commands::Enroll { member, label } => {
            let staged = kiosk.enroll_capture(&member, &label).await?;
            print_json(&staged);
            println!("run `mien confirm {member}` to save, or `mien cancel {member}` to discard");
        }
        Commands::Confirm { member } => {
            print_json(&kiosk.enroll_confirm(&member).await?);
        }
        Commands::Cancel { member } => {
            if kiosk.enroll_cancel(&member).await? {
                println!("enrollment for {member} discarded");
            } else {
                println!("no enrollment in progress for {member}");
            }
        }
        Commands::Verify { member } => {
            print_json(&kiosk.verify(&member).await?);
        }
        Commands::Scan { action } => match action {
            ScanAction::Start => {
                if kiosk.scan_start().await? {
                    println!("scan started");
                } else {
                    println!("scan already running");
                }
            }
            ScanAction::Stop => {
                kiosk.scan_stop().await?;
                println!("scan stopped");
            }
            ScanAction::Status => print_json(&kiosk.scan_status().await?),
            ScanAction::Wait { timeout_ms } => {
                print_json(&kiosk.scan_wait_for_face(timeout_ms).await?)
            }
        },
        Commands::List => print_json(&kiosk.list_faces().await?),
        Commands::Remove { member } => {
            if kiosk.remove_face(&member).await? {
                println!("removed enrollment for {member}");
            } else {
                println!("{member} has no enrollment");
            }
        }
        Commands::Status => print_json(&kiosk.status().await?),
        Commands::Notifications => print_json(&kiosk.notifications().await?),
        Commands::Read { id } => {
            if kiosk.mark_notification_read(&id).await? {
                println!("marked read");
            } else {
                println!("unknown notification id");
            }
        }
        Commands::Test { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn run_camera_test(device: &str, output: &str) -> Result<()> {
    println!("opening {device} at 640x480...");
    let mut session = CameraSession::open(device, 640, 480)
        .with_context(|| format!("opening camera {device}"))?;

    let frame = session.grab().context("grabbing frame")?;
    let brightness = frame.avg_brightness();

    let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
        .context("frame buffer size mismatch")?;
    image
        .save(output)
        .with_context(|| format!("saving {output}"))?;

    println!(
        "wrote {}x{} frame (avg brightness {brightness:.1}) to {output}",
        frame.width, frame.height
    );
    Ok(())
}

/// Pretty-print a JSON payload from the daemon, falling back to raw text.
fn print_json(payload: &str) {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{payload}"),
        },
        Err(_) => println!("{payload}"),
    }
}
