//! Engine and group-session state machine types.

use serde::{Deserialize, Serialize};

use crate::types::{PipelineConfig, PipelineMetrics};

/// The current state of the pipeline engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum EngineState {
    /// Engine is idle, not capturing.
    #[default]
    Idle,

    /// Engine is starting up.
    Starting {
        /// Current startup phase.
        phase: StartupPhase,
    },

    /// Engine is live: capturing, pacing and distributing.
    Live {
        /// Active pipeline configuration.
        config: PipelineConfig,

        /// Current pipeline metrics.
        metrics: PipelineMetrics,
    },

    /// Engine is stopping.
    Stopping {
        /// Reason for stopping.
        reason: StopReason,

        /// Current shutdown phase.
        phase: ShutdownPhase,
    },

    /// Engine encountered an error.
    Error {
        /// Error message.
        message: String,

        /// Whether recovery is possible.
        recoverable: bool,
    },
}

impl EngineState {
    /// Returns true if the engine is in the Idle state.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the engine is currently live.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// Returns true if the engine is starting.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting { .. })
    }

    /// Returns true if the engine is stopping.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping { .. })
    }

    /// Returns true if the engine is in an error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Returns true if the engine hit an error it cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Error { recoverable: false, .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting { .. } => "Starting",
            Self::Live { .. } => "Live",
            Self::Stopping { .. } => "Stopping",
            Self::Error { .. } => "Error",
        }
    }
}

/// Startup phases for the engine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupPhase {
    /// Checking that the tracking hardware is available.
    CheckDevice,

    /// Starting the frame source and capture worker.
    StartCapture,

    /// Building the distribution channel.
    OpenChannel,

    /// Starting the frame pacer.
    StartPacer,
}

impl StartupPhase {
    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::CheckDevice => Some(Self::StartCapture),
            Self::StartCapture => Some(Self::OpenChannel),
            Self::OpenChannel => Some(Self::StartPacer),
            Self::StartPacer => None,
        }
    }

    /// Returns the previous phase, if any (for rollback).
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::CheckDevice => None,
            Self::StartCapture => Some(Self::CheckDevice),
            Self::OpenChannel => Some(Self::StartCapture),
            Self::StartPacer => Some(Self::OpenChannel),
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::CheckDevice => "Checking tracking device",
            Self::StartCapture => "Starting capture",
            Self::OpenChannel => "Opening channel",
            Self::StartPacer => "Starting pacer",
        }
    }
}

/// Shutdown phases for the engine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownPhase {
    /// Stopping the pacer and cancelling the in-flight dispatch.
    StopPacer,

    /// Releasing the distribution channel.
    CloseChannel,

    /// Stopping the frame source.
    StopCapture,
}

impl ShutdownPhase {
    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::StopPacer => Some(Self::CloseChannel),
            Self::CloseChannel => Some(Self::StopCapture),
            Self::StopCapture => None,
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::StopPacer => "Stopping pacer",
            Self::CloseChannel => "Closing channel",
            Self::StopCapture => "Stopping capture",
        }
    }
}

/// Reason for stopping the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StopReason {
    /// User requested stop.
    UserRequested,

    /// The frame source went away.
    CaptureLost,

    /// Fatal error occurred.
    FatalError { message: String },
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Pipeline stopped by user".to_string(),
            Self::CaptureLost => "Frame source disconnected".to_string(),
            Self::FatalError { message } => format!("Fatal error: {message}"),
        }
    }
}

/// Lifecycle of a shared group activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupSessionState {
    /// Nothing requested yet, or torn down.
    #[default]
    Unconfigured,

    /// Waiting for the environment to approve or decline activation.
    Preparing,

    /// The environment declined activation for this attempt.
    ActivationDisabled,

    /// Activation was requested; waiting for a concrete session.
    Activated,

    /// Joined a session; messenger and journal are usable.
    Joined,

    /// The joined session was invalidated; handles are revoked.
    Invalidated,
}

/// Inputs that drive [`GroupSessionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupTrigger {
    /// Local request to start sharing.
    PrepareRequested,

    /// The environment declined activation.
    ActivationDisabled,

    /// The environment approved activation and it was issued.
    ActivationApproved,

    /// The user cancelled preparation.
    ActivationCancelled,

    /// A session became available and the local participant joined it.
    Joined,

    /// The joined session reported invalidation.
    Invalidated,

    /// Explicit teardown.
    Teardown,
}

impl GroupSessionState {
    /// Returns the state reached by applying `trigger`, or `None` if the
    /// trigger is not valid from this state.
    pub fn on(self, trigger: GroupTrigger) -> Option<Self> {
        use GroupSessionState as S;
        use GroupTrigger as T;

        match (self, trigger) {
            (_, T::Teardown) => Some(S::Unconfigured),
            (S::Unconfigured | S::ActivationDisabled | S::Invalidated, T::PrepareRequested) => {
                Some(S::Preparing)
            }
            (S::Preparing, T::ActivationDisabled) => Some(S::ActivationDisabled),
            (S::Preparing, T::ActivationApproved) => Some(S::Activated),
            (S::Preparing, T::ActivationCancelled) => Some(S::Unconfigured),
            // Remote sessions may be discovered without a local activation,
            // including while a local prepare is still pending.
            (
                S::Unconfigured
                | S::Preparing
                | S::ActivationDisabled
                | S::Activated
                | S::Invalidated,
                T::Joined,
            ) => Some(S::Joined),
            (S::Joined, T::Invalidated) => Some(S::Invalidated),
            _ => None,
        }
    }

    /// Returns true while messenger and journal handles may be used.
    pub fn is_joined(self) -> bool {
        self == Self::Joined
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unconfigured => "Unconfigured",
            Self::Preparing => "Preparing",
            Self::ActivationDisabled => "ActivationDisabled",
            Self::Activated => "Activated",
            Self::Joined => "Joined",
            Self::Invalidated => "Invalidated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_phases_round_trip() {
        let mut phase = StartupPhase::CheckDevice;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert_eq!(next.previous(), Some(phase));
            phase = next;
            seen.push(phase);
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(phase, StartupPhase::StartPacer);
    }

    #[test]
    fn test_group_happy_path() {
        let state = GroupSessionState::Unconfigured;
        let state = state.on(GroupTrigger::PrepareRequested).unwrap();
        assert_eq!(state, GroupSessionState::Preparing);
        let state = state.on(GroupTrigger::ActivationApproved).unwrap();
        assert_eq!(state, GroupSessionState::Activated);
        let state = state.on(GroupTrigger::Joined).unwrap();
        assert!(state.is_joined());
        let state = state.on(GroupTrigger::Invalidated).unwrap();
        assert_eq!(state, GroupSessionState::Invalidated);
    }

    #[test]
    fn test_group_activation_disabled_is_terminal_for_attempt() {
        let state = GroupSessionState::Preparing
            .on(GroupTrigger::ActivationDisabled)
            .unwrap();
        assert_eq!(state, GroupSessionState::ActivationDisabled);
        assert_eq!(state.on(GroupTrigger::ActivationApproved), None);
        assert_eq!(state.on(GroupTrigger::Invalidated), None);
        assert_eq!(
            state.on(GroupTrigger::PrepareRequested),
            Some(GroupSessionState::Preparing)
        );
    }

    #[test]
    fn test_group_invalid_transitions_rejected() {
        assert_eq!(GroupSessionState::Unconfigured.on(GroupTrigger::Invalidated), None);
        assert_eq!(GroupSessionState::Activated.on(GroupTrigger::ActivationApproved), None);
        assert_eq!(GroupSessionState::Joined.on(GroupTrigger::Joined), None);
        assert_eq!(GroupSessionState::Joined.on(GroupTrigger::PrepareRequested), None);
    }

    #[test]
    fn test_group_teardown_from_anywhere() {
        for state in [
            GroupSessionState::Unconfigured,
            GroupSessionState::Preparing,
            GroupSessionState::ActivationDisabled,
            GroupSessionState::Activated,
            GroupSessionState::Joined,
            GroupSessionState::Invalidated,
        ] {
            assert_eq!(
                state.on(GroupTrigger::Teardown),
                Some(GroupSessionState::Unconfigured)
            );
        }
    }

    #[test]
    fn test_remote_session_joinable_without_activation() {
        assert_eq!(
            GroupSessionState::Unconfigured.on(GroupTrigger::Joined),
            Some(GroupSessionState::Joined)
        );
        assert_eq!(
            GroupSessionState::Invalidated.on(GroupTrigger::Joined),
            Some(GroupSessionState::Joined)
        );
        assert_eq!(
            GroupSessionState::ActivationDisabled.on(GroupTrigger::Joined),
            Some(GroupSessionState::Joined)
        );
        assert_eq!(
            GroupSessionState::Preparing.on(GroupTrigger::Joined),
            Some(GroupSessionState::Joined)
        );
        assert_eq!(GroupSessionState::Joined.on(GroupTrigger::Joined), None);
    }
}
