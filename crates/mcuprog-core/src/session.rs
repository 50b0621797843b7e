//! Programming session - high-level orchestrator for one image upload.
//!
//! Sequence: configure the UART, pulse reset until the bootloader prints
//! `ready`, ping it, stream the image, then pulse reset once more so the
//! target boots whatever is now in flash. The final pulse happens whether
//! or not the upload succeeded.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{LogLevel, ProgEvent, ProgObserver, ProgPhase, TracingObserver};
use crate::nmp::{NmpClient, NmpError};
use crate::payload::image::ImageSlot;
use crate::protocol::constants::{
    BYTE_TIMEOUT_MS, DEFAULT_BAUD_RATE, DEFAULT_DEVICE, DEFAULT_RESET_GPIO, MAX_RESET_ATTEMPTS,
    READY_BANNER, RESET_SETTLE_MS, RX_TIMEOUT_MS, SEGMENT_DELAY_MS,
};
use crate::protocol::frame::{CrcPolicy, FramerConfig};
use crate::state::machine::{SessionState, StateMachineContext};
use crate::transport::serial::{SerialPortTransport, SysfsResetLine};
use crate::transport::traits::{FlowControl, ResetControl, SerialTransport, TransportError};
use crate::upload::{UploadError, UploadReport, upload_image};

/// Configuration for a programming session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial device the bootloader listens on.
    pub device: String,
    pub baud_rate: u32,
    /// GPIO value file driving the target's reset line.
    pub reset_gpio: PathBuf,
    /// Settle time after each reset edge, in milliseconds.
    pub reset_settle_ms: u64,
    /// Target slot; anything other than 1 means the primary slot.
    pub slot: i64,
    /// Reset pulses to try before giving up on the `ready` banner.
    pub reset_attempts: u32,
    /// Overall deadline for one response, in milliseconds.
    pub rx_timeout_ms: u64,
    /// Longest silence tolerated between bytes, in milliseconds.
    pub byte_timeout_ms: u64,
    /// Pause before each continuation line, in milliseconds.
    pub segment_delay_ms: u64,
    pub crc_policy: CrcPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            reset_gpio: PathBuf::from(DEFAULT_RESET_GPIO),
            reset_settle_ms: RESET_SETTLE_MS,
            slot: 0,
            reset_attempts: MAX_RESET_ATTEMPTS,
            rx_timeout_ms: RX_TIMEOUT_MS,
            byte_timeout_ms: BYTE_TIMEOUT_MS,
            segment_delay_ms: SEGMENT_DELAY_MS,
            crc_policy: CrcPolicy::Warn,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn image_slot(&self) -> ImageSlot {
        ImageSlot::from_index(self.slot)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn framer_config(&self) -> FramerConfig {
        FramerConfig {
            rx_timeout: Duration::from_millis(self.rx_timeout_ms),
            byte_timeout: Duration::from_millis(self.byte_timeout_ms),
            segment_delay: Duration::from_millis(self.segment_delay_ms),
            crc_policy: self.crc_policy,
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No response from target after {attempts} reset attempts")]
    NoResetResponse { attempts: u32 },
    #[error("No response to ping: {0}")]
    NoPingResponse(#[source] NmpError),
    #[error("Error programming device: {0}")]
    Programming(#[from] UploadError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Link error: {0}")]
    Link(#[source] NmpError),
    #[error("Error opening file {path}: {source}")]
    ImageFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Programming session over a serial link and a reset line.
pub struct ProgramSession<T: SerialTransport, R: ResetControl, O: ProgObserver> {
    client: NmpClient<T>,
    reset: R,
    observer: Arc<O>,
    config: SessionConfig,
    state: StateMachineContext,
}

impl<T: SerialTransport, R: ResetControl> ProgramSession<T, R, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, reset: R, config: SessionConfig) -> Self {
        Self::with_observer(transport, reset, config, Arc::new(TracingObserver))
    }
}

impl<O: ProgObserver> ProgramSession<SerialPortTransport, SysfsResetLine, O> {
    /// Open the configured serial device and reset line.
    #[instrument(skip(config, observer), fields(device = %config.device))]
    pub fn open(config: SessionConfig, observer: Arc<O>) -> Result<Self, SessionError> {
        let transport = SerialPortTransport::open_with_baud(&config.device, config.baud_rate)?;
        let reset = SysfsResetLine::with_settle(&config.reset_gpio, config.reset_settle());
        Ok(Self::with_observer(transport, reset, config, observer))
    }
}

impl<T: SerialTransport, R: ResetControl, O: ProgObserver> ProgramSession<T, R, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: T, reset: R, config: SessionConfig, observer: Arc<O>) -> Self {
        let client = NmpClient::new(transport, config.framer_config());
        Self {
            client,
            reset,
            observer,
            config,
            state: StateMachineContext::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &StateMachineContext {
        &self.state
    }

    pub fn client(&self) -> &NmpClient<T> {
        &self.client
    }

    /// Open `path` and program it into the configured slot.
    pub fn program_file<P: AsRef<Path>>(&mut self, path: P) -> Result<UploadReport, SessionError> {
        let path = path.as_ref();
        let file_error = |source| SessionError::ImageFile {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(file_error)?;
        let image_size = file.metadata().map_err(file_error)?.len();
        info!(path = %path.display(), image_size, "Image opened");
        self.observer.on_event(&ProgEvent::Log {
            level: LogLevel::Info,
            message: format!("Programming {} ({} bytes)", path.display(), image_size),
        });
        self.run(&mut file, image_size)
    }

    /// Run the complete session for an image of `image_size` bytes.
    #[instrument(skip(self, image))]
    pub fn run<I: Read + ?Sized>(
        &mut self,
        image: &mut I,
        image_size: u64,
    ) -> Result<UploadReport, SessionError> {
        self.state = StateMachineContext::new();
        let result = self.program(image, image_size);

        match &result {
            Ok(report) => {
                self.state.goto_state(SessionState::Done);
                info!(chunks = report.chunks, bytes = report.bytes, "Programming complete");
            }
            Err(e) => {
                self.state.goto_state(SessionState::Failed);
                warn!(error = %e, "Programming failed");
            }
        }

        // Boot whatever is in flash now, good image or not.
        if let Err(e) = self.reset.pulse() {
            warn!(error = %e, "Final reset failed");
        }

        match &result {
            Ok(_) => {
                self.observer.on_event(&ProgEvent::PhaseChanged {
                    from: ProgPhase::Upload,
                    to: ProgPhase::Complete,
                });
                self.observer.on_event(&ProgEvent::Complete);
            }
            Err(e) => {
                self.observer.on_event(&ProgEvent::PhaseChanged {
                    from: ProgPhase::Upload,
                    to: ProgPhase::Error,
                });
                self.observer.on_event(&ProgEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn program<I: Read + ?Sized>(
        &mut self,
        image: &mut I,
        image_size: u64,
    ) -> Result<UploadReport, SessionError> {
        self.client
            .transport_mut()
            .configure(self.config.baud_rate, FlowControl::None)?;

        self.wait_for_ready()?;

        self.state.goto_state(SessionState::Ping);
        self.observer.on_event(&ProgEvent::PhaseChanged {
            from: ProgPhase::Reset,
            to: ProgPhase::Ping,
        });
        self.client.ping().map_err(SessionError::NoPingResponse)?;

        self.state.goto_state(SessionState::Uploading);
        let report = upload_image(
            &mut self.client,
            image,
            image_size,
            self.config.image_slot(),
            &*self.observer,
        )?;
        Ok(report)
    }

    /// Pulse reset until the bootloader prints its banner.
    fn wait_for_ready(&mut self) -> Result<(), SessionError> {
        let max = self.config.reset_attempts.max(1);

        for attempt in 1..=max {
            self.state.goto_state(SessionState::Resetting);
            self.state.reset_attempts = attempt;
            self.observer
                .on_event(&ProgEvent::ResetAttempt { attempt, max });
            self.reset.pulse()?;

            self.state.goto_state(SessionState::WaitReady);
            match self.client.read_line().map_err(SessionError::Link)? {
                Some(line) if line.starts_with(READY_BANNER) => {
                    info!(attempt, "Target ready");
                    self.observer.on_event(&ProgEvent::TargetReady);
                    return Ok(());
                }
                Some(line) => {
                    debug!(attempt, line = %String::from_utf8_lossy(&line), "Not a ready banner");
                }
                None => debug!(attempt, "No banner after reset"),
            }
        }

        Err(SessionError::NoResetResponse { attempts: max })
    }
}
