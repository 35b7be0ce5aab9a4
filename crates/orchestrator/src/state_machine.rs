use std::fmt;

/// Lifecycle of a single relay run.
///
/// File-tail runs go `AwaitingSource -> AwaitingClient -> Streaming -> Completed`,
/// PTY runs go `AwaitingClient -> Starting -> Running -> Completed`. Every state
/// may jump to `Completed` on error or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    AwaitingSource,
    AwaitingClient,
    Streaming,
    Starting,
    Running,
    Completed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::AwaitingSource => "awaiting_source",
            RunState::AwaitingClient => "awaiting_client",
            RunState::Streaming => "streaming",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Completed => "completed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct RunStateMachine {
    state: RunState,
}

impl RunStateMachine {
    pub fn new(initial: RunState) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Move to `to`, logging the transition.
    ///
    /// Invalid transitions are a programming error; they are logged and
    /// ignored so a run can always still reach `Completed`.
    pub fn advance(&mut self, to: RunState) {
        if Self::can_transition(self.state, to) {
            tracing::debug!(from = %self.state, to = %to, "Run state transition");
            self.state = to;
        } else {
            tracing::warn!(from = %self.state, to = %to, "Ignoring invalid run state transition");
        }
    }

    pub fn can_transition(from: RunState, to: RunState) -> bool {
        Self::allowed_transitions(from).contains(&to)
    }

    fn allowed_transitions(from: RunState) -> Vec<RunState> {
        match from {
            RunState::AwaitingSource => vec![RunState::AwaitingClient, RunState::Completed],
            RunState::AwaitingClient => vec![
                RunState::Streaming,
                RunState::Starting,
                RunState::Completed,
            ],
            RunState::Streaming => vec![RunState::Completed],
            RunState::Starting => vec![RunState::Running, RunState::Completed],
            RunState::Running => vec![RunState::Completed],
            RunState::Completed => vec![],
        }
    }
}
