use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1"
)]
trait Presence {
    fn recognize(&self, session_id: i64, image: &[u8]) -> zbus::Result<String>;
    fn identify(&self, image: &[u8]) -> zbus::Result<String>;
    fn detection_status(&self, session_id: i64) -> zbus::Result<String>;
    fn start_session(
        &self,
        course_id: i64,
        date: &str,
        start: &str,
        end: &str,
    ) -> zbus::Result<String>;
    fn end_session(&self, session_id: i64) -> zbus::Result<bool>;
    fn enroll(&self, identity_id: i64, role: &str, name: &str, image: &[u8])
        -> zbus::Result<String>;
    fn list_attendance(&self, session_id: i64) -> zbus::Result<String>;
    fn list_absent(&self, session_id: i64) -> zbus::Result<String>;
    fn list_history(&self, identity_id: i64) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize a face image and record attendance
    Recognize {
        session_id: i64,
        /// Path to a JPEG or PNG image
        image: PathBuf,
    },
    /// Identify a face without recording attendance
    Identify {
        /// Path to a JPEG or PNG image
        image: PathBuf,
    },
    /// Show whether a session accepts recognition right now
    Window { session_id: i64 },
    /// Open a session
    Start {
        course_id: i64,
        /// Session date (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        date: Option<String>,
        /// Start time (HH:MM)
        start: String,
        /// End time (HH:MM)
        end: String,
    },
    /// Close a session
    End { session_id: i64 },
    /// Enroll a student or teacher from a face image
    Enroll {
        identity_id: i64,
        /// student or teacher
        #[arg(short, long, default_value = "student")]
        role: String,
        #[arg(short, long)]
        name: String,
        image: PathBuf,
    },
    /// List attendance records of a session
    List { session_id: i64 },
    /// List enrolled students absent from a session
    Absent { session_id: i64 },
    /// List the attendance history of an identity
    History { identity_id: i64 },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = PresenceProxy::new(&connection)
        .await
        .context("presenced is not reachable")?;

    match cli.command {
        Commands::Recognize { session_id, image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.recognize(session_id, &bytes).await?)?;
        }
        Commands::Identify { image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.identify(&bytes).await?)?;
        }
        Commands::Window { session_id } => {
            print_json(&proxy.detection_status(session_id).await?)?;
        }
        Commands::Start {
            course_id,
            date,
            start,
            end,
        } => {
            let date = date.unwrap_or_else(|| {
                chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
            });
            print_json(&proxy.start_session(course_id, &date, &start, &end).await?)?;
        }
        Commands::End { session_id } => {
            if proxy.end_session(session_id).await? {
                println!("session {session_id} closed");
            } else {
                println!("session {session_id} not found");
            }
        }
        Commands::Enroll {
            identity_id,
            role,
            name,
            image,
        } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.enroll(identity_id, &role, &name, &bytes).await?)?;
        }
        Commands::List { session_id } => {
            print_json(&proxy.list_attendance(session_id).await?)?;
        }
        Commands::Absent { session_id } => {
            print_json(&proxy.list_absent(session_id).await?)?;
        }
        Commands::History { identity_id } => {
            print_json(&proxy.list_history(identity_id).await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "image loaded");
    Ok(bytes)
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(reply).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
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
    fn test_identify_takes_only_an_image() {
        let cli = Cli::try_parse_from(["presence", "identify", "face.jpg"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Identify { ref image } if image == Path::new("face.jpg")
        ));
        assert!(Cli::try_parse_from(["presence", "identify", "3", "face.jpg"]).is_err());
    }

    #[test]
    fn test_start_parses_optional_date() {
        let cli = Cli::try_parse_from(["presence", "start", "3", "08:00", "10:00"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Start { course_id: 3, date: None, .. }
        ));

        let cli = Cli::try_parse_from([
            "presence", "--system", "start", "3", "-d", "2026-03-02", "08:00", "10:00",
        ])
        .unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Start { date: Some(_), .. }));
    }
}
