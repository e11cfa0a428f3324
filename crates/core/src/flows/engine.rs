use thiserror::Error;

use crate::flows::states::{FlowAction, FlowContext, FlowEvent, FlowState, TransitionOutcome};

pub trait FlowDefinition {
    fn initial_state(&self) -> FlowState;
    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Per-request chat orchestration: detect, guard, then tool or model, then assemble.
#[derive(Clone, Debug, Default)]
pub struct ChatFlow;

impl FlowDefinition for ChatFlow {
    fn initial_state(&self) -> FlowState {
        FlowState::Received
    }

    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_chat(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> FlowState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }
}

impl Default for FlowEngine<ChatFlow> {
    fn default() -> Self {
        Self::new(ChatFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("flow already finished in {state:?}; cannot apply {event:?}")]
    TerminalState { state: FlowState, event: FlowEvent },
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: FlowState, event: FlowEvent },
}

fn transition_chat(
    current: &FlowState,
    event: &FlowEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use FlowAction::{
        AssembleResponse, EvaluateGuardrails, ExecuteTool, InvokeModel, PhraseToolResult,
        RenderFailure, RenderRejection, RenderToolResult,
    };
    use FlowEvent::{
        DetectionCompleted, Failed, GuardrailEvaluated, MessageAccepted, ModelCompleted,
        ResponseAssembled, ToolCompleted,
    };
    use FlowState::{
        Assembling, CallingModel, Detecting, Done, Error, ExecutingTool, Guarding, Received,
    };

    if current.is_terminal() {
        return Err(FlowTransitionError::TerminalState { state: *current, event: event.clone() });
    }

    let (to, actions) = match (current, event) {
        (Received, MessageAccepted) => (Detecting, Vec::new()),
        (Detecting, DetectionCompleted) => (Guarding, vec![EvaluateGuardrails]),
        (Guarding, GuardrailEvaluated) if !context.guardrail_allowed => {
            (Done, vec![RenderRejection])
        }
        (Guarding, GuardrailEvaluated) if context.tool_matched => {
            (ExecutingTool, vec![ExecuteTool])
        }
        (Guarding, GuardrailEvaluated) => (CallingModel, vec![InvokeModel]),
        (ExecutingTool, ToolCompleted) if context.tool_result_only => {
            (Assembling, vec![RenderToolResult])
        }
        (ExecutingTool, ToolCompleted) => (Assembling, vec![PhraseToolResult]),
        (CallingModel, ModelCompleted) => (Assembling, vec![AssembleResponse]),
        (Assembling, ResponseAssembled) => (Done, Vec::new()),
        (_, Failed) => (Error, vec![RenderFailure]),
        _ => {
            return Err(FlowTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}

/// One request's walk through the flow, keeping every visited state.
pub struct FlowRun {
    engine: FlowEngine<ChatFlow>,
    state: FlowState,
    trace: Vec<FlowState>,
}

impl Default for FlowRun {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowRun {
    pub fn new() -> Self {
        let engine = FlowEngine::default();
        let state = engine.initial_state();
        Self { engine, state, trace: vec![state] }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn trace(&self) -> &[FlowState] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<FlowState> {
        self.trace
    }

    pub fn apply(
        &mut self,
        event: FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        let outcome = self.engine.apply(&self.state, &event, context)?;
        self.state = outcome.to;
        self.trace.push(outcome.to);
        Ok(outcome)
    }

    /// Moves to `Error` unless the run already finished.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = FlowState::Error;
            self.trace.push(FlowState::Error);
        }
    }
}
