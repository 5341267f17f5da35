//! Camera lifecycle as an explicit state machine
//!
//! `transition` is pure: it maps the current state and an event to the next
//! state plus the side effects the device must carry out. Handles (open
//! device, session) travel separately; events here only name what happened.

use crate::error::PlatformErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Closed,
    Opening,
    Open,
    SessionRequested,
    Configured,
    Streaming,
    Stopping,
}

impl LifecycleState {
    /// States between the open request and the readiness report
    pub fn is_negotiating(self) -> bool {
        matches!(self, Self::Opening | Self::Open | Self::SessionRequested | Self::Configured)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `start_preview` acquired the permit
    OpenRequested,
    /// The platform rejected the open call synchronously
    OpenFailed(String),
    Opened,
    Disconnected,
    DeviceError(PlatformErrorCode),
    /// A converter was built and the platform accepted the session request
    SessionRequested,
    /// Converter selection or session negotiation failed
    SessionFailed(String),
    Configured,
    StreamingStarted,
    StreamingFailed(String),
    StopRequested,
    TeardownComplete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartWorker,
    OpenDevice,
    CreateSession,
    StartRepeating,
    MarkConfigured(bool),
    ReportReady { ok: bool, reason: String },
    ReleasePermit,
    CloseDevice,
    Teardown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: LifecycleState,
    pub commands: Vec<Command>,
}

impl Transition {
    fn to(next: LifecycleState, commands: Vec<Command>) -> Self {
        Self { next, commands }
    }

    fn stay(state: LifecycleState) -> Self {
        Self::to(state, Vec::new())
    }
}

/// Failure while the open/session window is still open: release everything
/// and tell the caller.
fn fail_negotiation(reason: String) -> Transition {
    Transition::to(
        LifecycleState::Closed,
        vec![
            Command::MarkConfigured(false),
            Command::CloseDevice,
            Command::ReleasePermit,
            Command::ReportReady { ok: false, reason },
        ],
    )
}

pub fn transition(state: LifecycleState, event: &Event) -> Transition {
    use LifecycleState as S;

    match (state, event) {
        (S::Closed, Event::OpenRequested) => {
            Transition::to(S::Opening, vec![Command::StartWorker, Command::OpenDevice])
        }
        (S::Opening, Event::OpenFailed(reason)) => fail_negotiation(reason.clone()),
        (S::Opening, Event::Opened) => Transition::to(S::Open, vec![Command::CreateSession]),
        (S::Open, Event::SessionRequested) => Transition::stay(S::SessionRequested),
        (S::Open | S::SessionRequested | S::Configured, Event::SessionFailed(reason)) => {
            fail_negotiation(reason.clone())
        }
        (S::SessionRequested, Event::Configured) => {
            Transition::to(S::Configured, vec![Command::StartRepeating])
        }
        (S::Configured, Event::StreamingStarted) => Transition::to(
            S::Streaming,
            vec![
                Command::MarkConfigured(true),
                Command::ReleasePermit,
                Command::ReportReady {
                    ok: true,
                    reason: "OK".into(),
                },
            ],
        ),
        (S::Configured, Event::StreamingFailed(reason)) => fail_negotiation(reason.clone()),
        (s, Event::Disconnected) if s.is_negotiating() => {
            fail_negotiation("camera disconnected".into())
        }
        (s, Event::DeviceError(code)) if s.is_negotiating() => fail_negotiation(code.to_string()),
        (S::Streaming, Event::Disconnected | Event::DeviceError(_)) => Transition::to(
            S::Closed,
            vec![Command::MarkConfigured(false), Command::CloseDevice],
        ),
        (S::Closed | S::Stopping, Event::StopRequested) => Transition::stay(state),
        (s, Event::StopRequested) if s.is_negotiating() => Transition::to(
            S::Stopping,
            vec![
                Command::ReleasePermit,
                Command::ReportReady {
                    ok: false,
                    reason: "camera stopped before streaming".into(),
                },
                Command::Teardown,
            ],
        ),
        (_, Event::StopRequested) => Transition::to(S::Stopping, vec![Command::Teardown]),
        (S::Stopping, Event::TeardownComplete) => {
            Transition::to(S::Closed, vec![Command::MarkConfigured(false)])
        }
        _ => Transition::stay(state),
    }
}
