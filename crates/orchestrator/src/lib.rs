//! Browser Session Orchestration
//!
//! Drives a real browser against a bot-resistant portal and keeps the mess
//! contained: version drift between binary and driver, launches that fail
//! halfway, sessions that stop answering, and the diagnostics needed to
//! triage any of it after the fact.
//!
//! Design decisions:
//! 1. **Resolve once, launch many** - the {binary, driver} pair is resolved
//!    at bootstrap and immutable afterwards; launch failures fall back
//!    through an ordered candidate cascade, never through reinstallation.
//! 2. **Ready means answering** - a session exists only once its control
//!    channel survives a round-trip, not when the process starts.
//! 3. **Process as owned resource** - every exit path runs
//!    `Closing -> Closed` exactly once and reaps the browser process.
//! 4. **Failures are data** - every failure returns a classified kind plus
//!    artifact references (screenshot, log, transcript); nothing raw escapes.

pub mod artifacts;
pub mod cascade;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod factory;
pub mod orchestrator;
pub mod profile;
pub mod session;
pub mod supervisor;
pub mod transcript;
pub mod version;

pub use artifacts::{ArtifactKind, ArtifactRecorder, ArtifactRef, LogEntry};
pub use cascade::{AttemptOutcome, AttemptRecord, RetryCascade, RetryPolicy};
pub use config::OrchestratorConfig;
pub use error::{CascadeExhausted, FailureKind, LaunchError, ResolutionError, SessionError};
pub use events::{EventBus, SessionEvent};
pub use factory::StealthSessionFactory;
pub use orchestrator::{BootstrapError, Orchestrator, TaskOutcome};
pub use profile::SessionProfile;
pub use session::{Session, SessionId, SessionState};
pub use supervisor::{SessionSupervisor, SessionTask, SupervisorConfig};
pub use transcript::{Step, Transcript, TranscriptStep};
pub use version::{BrowserTarget, BrowserVersion, CompatPair, CompatibilityTable, VersionResolver};
