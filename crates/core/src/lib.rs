pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use domain::conversation::{ConversationContext, Role, SessionId, Turn};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{ChatFlow, FlowEngine, FlowEvent, FlowRun, FlowState, FlowTransitionError};
