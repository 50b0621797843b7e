//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other frontend) to follow a programming session
//! without tight coupling to the protocol logic.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Programming session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgPhase {
    /// Pulsing reset and waiting for the bootloader banner.
    Reset,
    /// Echo request to prove the NMP link works.
    Ping,
    /// Target erases the slot while handling the first chunk.
    Erase,
    /// Image chunks in flight.
    Upload,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for ProgPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgPhase::Reset => write!(f, "Reset"),
            ProgPhase::Ping => write!(f, "Ping"),
            ProgPhase::Erase => write!(f, "Erase"),
            ProgPhase::Upload => write!(f, "Upload"),
            ProgPhase::Complete => write!(f, "Complete"),
            ProgPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by a programming session.
#[derive(Debug, Clone)]
pub enum ProgEvent {
    /// Phase changed.
    PhaseChanged { from: ProgPhase, to: ProgPhase },
    /// Reset pulse sent while waiting for the bootloader.
    ResetAttempt { attempt: u32, max: u32 },
    /// Bootloader answered with its banner.
    TargetReady,
    /// Chunk acknowledged by the target.
    Progress {
        chunk: usize,
        total_chunks: usize,
        percent: u8,
        image_size: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Non-fatal oddity (bad CBOR, nonzero rc, ...).
    Warning { message: String },
    /// Session failed.
    Error { message: String },
    /// All operations completed successfully.
    Complete,
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait ProgObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ProgEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ProgObserver for NullObserver {
    fn on_event(&self, _event: &ProgEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ProgObserver for TracingObserver {
    fn on_event(&self, event: &ProgEvent) {
        match event {
            ProgEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            ProgEvent::ResetAttempt { attempt, max } => {
                tracing::debug!(attempt, max, "Reset pulse");
            }
            ProgEvent::TargetReady => {
                tracing::info!("Bootloader ready");
            }
            ProgEvent::Progress {
                chunk,
                total_chunks,
                percent,
                image_size,
            } => {
                tracing::debug!(chunk, total_chunks, image_size, progress = %format!("{}%", percent), "Progress");
            }
            ProgEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            ProgEvent::Warning { message } => {
                tracing::warn!("{}", message);
            }
            ProgEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            ProgEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

/// Observer that records every event, for tests and scripted frontends.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<ProgEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgObserver for RecordingObserver {
    fn on_event(&self, event: &ProgEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
