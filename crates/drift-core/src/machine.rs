//! The connector state machine.
//!
//! Leaf states of the hierarchical chart plus an explicit transition table.
//! `Disconnecting` carries its continuation, replacing the chart's routing
//! property: a close always passes through it, then lands wherever the
//! triggering event pointed. Super-state membership is exposed through the
//! `in_active` / `in_connected` predicates.

use tracing::debug;

/// Where a `Disconnecting` state continues once the socket is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterClose {
    /// Schedule a retry (recoverable error).
    Retry,
    /// Immediately reconnect (explicit reconnect request).
    Reconnect,
    /// Go inactive (fatal error).
    Deactivate,
    /// Go inactive and report the machine as finished (shutdown).
    Finish,
}

/// Leaf states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Inactive,
    Connecting,
    Retry,
    Disconnecting(AfterClose),
    Identifying,
    Registering,
    LoggingIn,
    Granting,
    Idle,
}

impl ConnectorState {
    /// Membership in the `Active` super-state.
    pub fn in_active(self) -> bool {
        !matches!(self, ConnectorState::Inactive)
    }

    /// Membership in the `Connected` super-state.
    pub fn in_connected(self) -> bool {
        matches!(
            self,
            ConnectorState::Identifying
                | ConnectorState::Registering
                | ConnectorState::LoggingIn
                | ConnectorState::Granting
                | ConnectorState::Idle
        )
    }
}

/// State machine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEvent {
    Start,
    Connected,
    Disconnected,
    NoConnect,
    AwaitRegister,
    AwaitLogin,
    AwaitGranted,
    Account,
    BasicError,
    FatalError,
    Reconnect,
    RetryTimer,
    Close,
}

/// Side effects the driver executes after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmAction {
    /// Begin a connection attempt.
    OpenSocket,
    /// Close the socket (or abort the attempt in flight).
    CloseSocket,
    /// Arm the retry timer with the next backoff delay.
    ScheduleRetry,
    /// Steady state reached: reset retry ladder, emit readiness.
    EnterIdle,
    /// Left the `Connected` region: drop the in-flight caches.
    ExitConnected,
    /// Left the `Active` region: end any pending operation, report
    /// disconnected.
    ExitActive,
    /// Ordered shutdown complete.
    EmitFinished,
}

/// The machine. `closing` latches once a shutdown begins; no event can
/// restart the machine afterwards.
pub struct ConnectorStateMachine {
    state: ConnectorState,
    closing: bool,
}

impl Default for ConnectorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectorState::Inactive,
            closing: false,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    #[cfg(test)]
    fn set_state(&mut self, state: ConnectorState) {
        self.state = state;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Feed an event; returns the side effects to execute, in order.
    pub fn submit(&mut self, event: SmEvent) -> Vec<SmAction> {
        use ConnectorState::*;
        use SmAction::*;
        use SmEvent::*;

        if event == Close {
            self.closing = true;
        }

        let (next, actions): (ConnectorState, Vec<SmAction>) = match (self.state, event) {
            // -- Inactive ---------------------------------------------------
            (Inactive, Start) | (Inactive, Reconnect) if !self.closing => {
                (Connecting, vec![OpenSocket])
            }
            (Inactive, Close) => (Inactive, vec![EmitFinished]),

            // -- Connecting -------------------------------------------------
            (Connecting, Connected) => (Identifying, vec![]),
            (Connecting, Disconnected) if self.closing => {
                (Inactive, vec![ExitActive, EmitFinished])
            }
            (Connecting, Disconnected) => (Retry, vec![ScheduleRetry]),
            (Connecting, NoConnect) => (Inactive, vec![ExitActive]),
            (Connecting, BasicError) => (Disconnecting(AfterClose::Retry), vec![CloseSocket]),
            (Connecting, FatalError) => {
                (Disconnecting(AfterClose::Deactivate), vec![CloseSocket])
            }
            (Connecting, Reconnect) => (Disconnecting(AfterClose::Reconnect), vec![CloseSocket]),
            (Connecting, Close) => (Disconnecting(AfterClose::Finish), vec![CloseSocket]),

            // -- Retry ------------------------------------------------------
            (Retry, RetryTimer) | (Retry, Reconnect) if !self.closing => {
                (Connecting, vec![OpenSocket])
            }
            (Retry, FatalError) | (Retry, NoConnect) => (Inactive, vec![ExitActive]),
            (Retry, Close) => (Inactive, vec![ExitActive, EmitFinished]),

            // -- Handshake --------------------------------------------------
            (Identifying, AwaitRegister) => (Registering, vec![]),
            (Identifying, AwaitLogin) => (LoggingIn, vec![]),
            (Identifying, AwaitGranted) => (Granting, vec![]),
            (Registering, Account) | (LoggingIn, Account) | (Granting, Account) => {
                (Idle, vec![EnterIdle])
            }

            // -- Whole Connected region ------------------------------------
            (s, BasicError) if s.in_connected() => (
                Disconnecting(AfterClose::Retry),
                vec![ExitConnected, CloseSocket],
            ),
            (s, FatalError) if s.in_connected() => (
                Disconnecting(AfterClose::Deactivate),
                vec![ExitConnected, CloseSocket],
            ),
            (s, Reconnect) if s.in_connected() => (
                Disconnecting(AfterClose::Reconnect),
                vec![ExitConnected, CloseSocket],
            ),
            (s, Close) if s.in_connected() => (
                Disconnecting(AfterClose::Finish),
                vec![ExitConnected, CloseSocket],
            ),
            (s, Disconnected) if s.in_connected() && self.closing => {
                (Inactive, vec![ExitConnected, ExitActive, EmitFinished])
            }
            (s, Disconnected) if s.in_connected() => {
                (Retry, vec![ExitConnected, ScheduleRetry])
            }

            // -- Disconnecting ----------------------------------------------
            (Disconnecting(_), Close) => (Disconnecting(AfterClose::Finish), vec![]),
            (Disconnecting(then), FatalError) if then != AfterClose::Finish => {
                (Disconnecting(AfterClose::Deactivate), vec![])
            }
            (Disconnecting(_), Disconnected) if self.closing => {
                (Inactive, vec![ExitActive, EmitFinished])
            }
            (Disconnecting(AfterClose::Retry), Disconnected) => (Retry, vec![ScheduleRetry]),
            (Disconnecting(AfterClose::Reconnect), Disconnected) => {
                (Connecting, vec![OpenSocket])
            }
            (Disconnecting(AfterClose::Deactivate), Disconnected) => {
                (Inactive, vec![ExitActive])
            }
            (Disconnecting(AfterClose::Finish), Disconnected) => {
                (Inactive, vec![ExitActive, EmitFinished])
            }

            // Everything else is ignored.
            (state, event) => {
                debug!("ignoring {event:?} in state {state:?}");
                (state, vec![])
            }
        };

        self.state = next;
        actions
    }
}
