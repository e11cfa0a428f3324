pub mod engine;
pub mod states;

pub use engine::{ChatFlow, FlowDefinition, FlowEngine, FlowRun, FlowTransitionError};
pub use states::{FlowAction, FlowContext, FlowEvent, FlowState, TransitionOutcome};
