use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mcuprog_core::events::{ProgEvent, ProgObserver, ProgPhase};
use mcuprog_core::protocol::frame::CrcPolicy;
use mcuprog_core::session::{ProgramSession, SessionConfig};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "mcuboot serial image programmer", long_about = None)]
struct Args {
    /// Signed image to program
    image: PathBuf,

    /// Target slot (1 selects the secondary slot, anything else the primary)
    #[arg(short, long)]
    slot: Option<i64>,

    /// Serial device the bootloader is attached to
    #[arg(long)]
    device: Option<String>,

    /// UART baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// GPIO value file driving the target's reset line
    #[arg(long)]
    reset_gpio: Option<PathBuf>,

    /// Load session settings from a TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drop responses whose CRC does not check out
    #[arg(long)]
    strict_crc: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SessionConfig::default(),
        };
        if let Some(slot) = self.slot {
            config.slot = slot;
        }
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(gpio) = &self.reset_gpio {
            config.reset_gpio = gpio.clone();
        }
        if self.strict_crc {
            config.crc_policy = CrcPolicy::Reject;
        }
        Ok(config)
    }
}

/// Prints session progress on stdout the way an operator expects to see it.
struct ConsoleObserver;

impl ConsoleObserver {
    /// Text for one event, if it is shown on the console.
    fn render(event: &ProgEvent) -> Option<String> {
        let text = match event {
            ProgEvent::ResetAttempt { attempt: 1, .. } => "Resetting target...".to_string(),
            ProgEvent::ResetAttempt { .. } => "retry...".to_string(),
            ProgEvent::TargetReady => "Done\n".to_string(),
            ProgEvent::PhaseChanged {
                to: ProgPhase::Erase,
                ..
            } => "Erasing target...".to_string(),
            ProgEvent::PhaseChanged {
                to: ProgPhase::Upload,
                ..
            } => "Done\nWriting data to target\n".to_string(),
            ProgEvent::Progress {
                chunk,
                total_chunks,
                percent,
                image_size,
            } => format!(
                "\r  {chunk:3} / {total_chunks:3} [ {percent:3}% ] chunks sent, file is {image_size} bytes"
            ),
            ProgEvent::Complete => "\n".to_string(),
            _ => return None,
        };
        Some(text)
    }
}

impl ProgObserver for ConsoleObserver {
    fn on_event(&self, event: &ProgEvent) {
        if let ProgEvent::Warning { message } = event {
            tracing::warn!("{}", message);
        }
        if let Some(text) = Self::render(event) {
            print!("{text}");
            if let Err(e) = std::io::stdout().flush() {
                debug!(error = %e, "Failed to flush stdout");
            }
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = args.session_config()?;
    info!(
        device = %config.device,
        slot = config.slot,
        image = %args.image.display(),
        "Starting mcuprog"
    );

    let mut session = ProgramSession::open(config, Arc::new(ConsoleObserver))?;
    session.program_file(&args.image)?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("setting default subscriber failed");
    }

    match run(&args) {
        Ok(()) => println!("Programming is complete"),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "mcuprog",
            "app.bin",
            "-s",
            "1",
            "--device",
            "/dev/ttyUSB0",
            "--strict-crc",
        ]);
        let config = args.session_config().unwrap();
        assert_eq!(config.slot, 1);
        assert_eq!(config.device, "/dev/ttyUSB0");
        assert_eq!(config.crc_policy, CrcPolicy::Reject);
        assert_eq!(config.baud_rate, 115_200);
    }

    #[test]
    fn test_console_progress_line() {
        let line = ConsoleObserver::render(&ProgEvent::Progress {
            chunk: 2,
            total_chunks: 2,
            percent: 78,
            image_size: 500,
        });
        assert_eq!(
            line.as_deref(),
            Some("\r    2 /   2 [  78% ] chunks sent, file is 500 bytes")
        );
    }

    #[test]
    fn test_console_ignores_quiet_events() {
        assert_eq!(
            ConsoleObserver::render(&ProgEvent::Log {
                level: mcuprog_core::events::LogLevel::Info,
                message: "x".into(),
            }),
            None
        );
        assert_eq!(
            ConsoleObserver::render(&ProgEvent::ResetAttempt { attempt: 2, max: 5 }).as_deref(),
            Some("retry...")
        );
    }
}
