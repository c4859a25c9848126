//! # logos-sync: Client-side step synchronization for collaborative editing
//!
//! Keeps one participant's document converged with everyone else's despite
//! out-of-order delivery, missed broadcasts and reconnects.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ChannelEvent    ┌──────────────┐   apply_remote   ┌───────────────┐
//! │  WsChannel   │ ────────────────► │ SyncProvider │ ───────────────► │ DocumentModel │
//! │ (WebSocket)  │ ◄──────────────── │  (one task)  │ ◄─────────────── │ (YrsDocument) │
//! └──────────────┘  steps/telepointer└──────┬───────┘  sendable_steps  └───────────────┘
//!                                           │
//!              ┌──────────────┬─────────────┼──────────────┐
//!              ▼              ▼             ▼              ▼
//!        ┌──────────┐ ┌──────────────┐ ┌──────────┐ ┌───────────┐
//!        │StepQueue │ │  Catchup     │ │ Presence │ │ EventBus  │
//!        │(ordering)│ │ (gap timer)  │ │ Tracker  │ │ (editor)  │
//!        └──────────┘ └──────────────┘ └──────────┘ └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Steps, batches, telepointers and the bincode `Frame`
//! - [`queue`]: Version-ordered batch buffer with gap detection
//! - [`catchup`]: Gap recovery timer and resync state machine
//! - [`presence`]: Active participants from telepointer traffic
//! - [`directory`]: Session to user resolution
//! - [`events`]: Typed publish/subscribe surface
//! - [`document`]: Document model capability and a yrs implementation
//! - [`channel`]: Channel capability and the WebSocket implementation
//! - [`provider`]: The synchronization core and its run loop

pub mod catchup;
pub mod channel;
pub mod clock;
pub mod config;
pub mod directory;
pub mod document;
pub mod error;
pub mod events;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod queue;

// Re-exports for convenience
pub use catchup::{
    CatchupController, CatchupState, ManualScheduler, Scheduler, TimerHandle, TimerToken,
    TokioScheduler,
};
pub use channel::{Channel, ChannelEvent, MemoryChannel, WsChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ProviderConfig;
pub use directory::{ParticipantDirectory, ParticipantProfile, StaticDirectory};
pub use document::{DocumentModel, MemoryDocument, Transaction, YrsDocument};
pub use error::SyncError;
pub use events::{EventBus, EventKind, SubscriptionId, SyncEvent};
pub use presence::{Participant, PresenceChange, PresenceTracker};
pub use protocol::{
    CatchupResponse, DocumentState, Frame, OutgoingMessage, SendableSteps, Selection, Step,
    StepBatch, Telepointer,
};
pub use provider::{Inbox, ProviderCommand, ProviderHandle, SyncProvider};
pub use queue::{DrainOutcome, Gap, StepQueue};
