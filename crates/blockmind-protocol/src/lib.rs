//! # blockmind-protocol: shared contract for the behavior-coordination core
//!
//! This crate defines the types and trait interfaces that the event bus, the
//! mode state machine and every external collaborator (world poller, behavior
//! loops, mode handlers) agree on.
//!
//! It is intentionally dependency-light (no locks; tokio only for the
//! dispatch-scoped task-local) so it can be used as a pure contract crate by
//! collaborators that only produce events or implement handlers.
//!
//! ## Module Overview
//!
//! - [`dispatch`]: Transition epoch carried through one event dispatch
//! - [`ids`]: Typed ID wrappers (EventId, ListenerId, ModeName)
//! - [`event`]: GameEvent + EventKind (15 known kinds, forward-compatible)
//! - [`factory`]: EventFactory: raw poller payloads → GameEvent, never fails
//! - [`mode`]: ModeConfig, ModeState, transition requests and outcomes
//! - [`ports`]: EventListener and ModeHandler collaborator traits
//! - [`error`]: CoreError, CoreResult

pub mod dispatch;
pub mod error;
pub mod event;
pub mod factory;
pub mod ids;
pub mod mode;
pub mod ports;

// Re-export the most commonly used types at the crate root.
pub use dispatch::{dispatch_epoch, scope_dispatch};
pub use error::{BoxError, CoreError, CoreResult};
pub use event::{
    DroppedItem, EntityInfo, EventKind, EventTag, EventTimestamp, GameEvent, PlayerInfo, Position,
};
pub use factory::EventFactory;
pub use ids::{EventId, ListenerId, ModeName};
pub use mode::{
    ModeConfig, ModeInfo, ModeSnapshot, ModeState, ModeTransitionRequest, RejectReason,
    TransitionOutcome, TransitionRecord, TransitionTrigger,
};
pub use ports::{EpochSource, EventListener, FnListener, ModeHandler, listener_fn};
