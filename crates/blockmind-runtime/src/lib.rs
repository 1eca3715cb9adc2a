//! Mode coordination for the blockmind core.
//!
//! [`ModeRegistry`] holds the mode table, [`HandlerRegistry`] the per-mode
//! handlers, and [`ModeStateMachine`] decides which mode is active. The
//! machine serializes transitions through a [`TransitionGate`] and raises the
//! shared [`InterruptSignal`] when a running behavior loop must stop.

pub mod gate;
pub mod handlers;
pub mod interrupt;
pub mod machine;
pub mod registry;

pub use gate::{GatePass, TransitionGate};
pub use handlers::{CallbackOutcome, HandlerRegistry};
pub use interrupt::InterruptSignal;
pub use machine::{
    DEFAULT_HISTORY_CAPACITY, MachineConfig, MachineStats, ModeStateMachine, ProposalOutcome,
    TickReport,
};
pub use registry::{ModeRegistry, builtin_modes};
