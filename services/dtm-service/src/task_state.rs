//! Task lifecycle states, user events and ODM webhook handling rules.
//!
//! State is never stored on the task row. Every change appends a
//! `task_events` row and the newest row is the current state, so a
//! transition is a compare-and-set against that latest row.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    RequestForMapping,
    #[default]
    UnlockedToMap,
    LockedForMapping,
    UnlockedToValidate,
    LockedForValidation,
    UnlockedDone,
    UnflyableTask,
    ImageUploaded,
    ImageProcessed,
    ImageProcessingFailed,
}

impl State {
    pub const ALL: [State; 10] = [
        State::RequestForMapping,
        State::UnlockedToMap,
        State::LockedForMapping,
        State::UnlockedToValidate,
        State::LockedForValidation,
        State::UnlockedDone,
        State::UnflyableTask,
        State::ImageUploaded,
        State::ImageProcessed,
        State::ImageProcessingFailed,
    ];

    /// Storage representation, matching the serde name.
    pub const fn as_str(self) -> &'static str {
        match self {
            State::RequestForMapping => "REQUEST_FOR_MAPPING",
            State::UnlockedToMap => "UNLOCKED_TO_MAP",
            State::LockedForMapping => "LOCKED_FOR_MAPPING",
            State::UnlockedToValidate => "UNLOCKED_TO_VALIDATE",
            State::LockedForValidation => "LOCKED_FOR_VALIDATION",
            State::UnlockedDone => "UNLOCKED_DONE",
            State::UnflyableTask => "UNFLYABLE_TASK",
            State::ImageUploaded => "IMAGE_UPLOADED",
            State::ImageProcessed => "IMAGE_PROCESSED",
            State::ImageProcessingFailed => "IMAGE_PROCESSING_FAILED",
        }
    }

    /// Label shown in per-user task statistics.
    pub const fn stats_label(self) -> &'static str {
        match self {
            State::RequestForMapping => "request logs",
            State::LockedForMapping => "ongoing",
            State::UnlockedDone => "completed",
            State::UnflyableTask => "unflyable task",
            _ => "UNLOCKED_TO_MAP",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown task state: {0}")]
pub struct ParseStateError(pub String);

impl std::str::FromStr for State {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Request,
    Map,
    Reject,
    Finish,
    Validate,
    Good,
    Bad,
    Comment,
    Unlock,
    ImageUpload,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Request => "request",
            EventType::Map => "map",
            EventType::Reject => "reject",
            EventType::Finish => "finish",
            EventType::Validate => "validate",
            EventType::Good => "good",
            EventType::Bad => "bad",
            EventType::Comment => "comment",
            EventType::Unlock => "unlock",
            EventType::ImageUpload => "image_upload",
        }
    }

    /// Who may emit the event besides any user.
    pub const fn required_actor(self) -> Actor {
        match self {
            EventType::Map | EventType::Reject => Actor::ProjectAuthor,
            EventType::Unlock => Actor::LockHolder,
            _ => Actor::Anyone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Anyone,
    ProjectAuthor,
    LockHolder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub comment: &'static str,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task is {current}, expected {expected} for this event")]
    WrongState { current: State, expected: State },
    #[error("only the project author may {0} a mapping request")]
    NotAuthor(&'static str),
    #[error("only the user who locked the task may unlock it")]
    NotLockHolder,
}

/// Expected source state, target state and event comment for `event`.
pub fn plan_transition(event: EventType, requires_approval: bool) -> Transition {
    let (from, to, comment) = match event {
        EventType::Request if requires_approval => (
            State::UnlockedToMap,
            State::RequestForMapping,
            "Request for mapping",
        ),
        EventType::Request => (
            State::UnlockedToMap,
            State::LockedForMapping,
            "Request accepted automatically",
        ),
        EventType::Map => (
            State::RequestForMapping,
            State::LockedForMapping,
            "Request accepted for mapping",
        ),
        EventType::Reject => (
            State::RequestForMapping,
            State::UnlockedToMap,
            "Request for mapping rejected",
        ),
        EventType::Finish => (
            State::LockedForMapping,
            State::UnlockedToValidate,
            "Done: unlocked to validate",
        ),
        EventType::Validate => (
            State::UnlockedToValidate,
            State::LockedForValidation,
            "Done: locked for validation",
        ),
        EventType::Good => (
            State::LockedForValidation,
            State::UnlockedDone,
            "Done: Task is Good",
        ),
        EventType::Bad => (
            State::LockedForValidation,
            State::UnlockedToMap,
            "Done: needs to redo",
        ),
        EventType::Comment => (
            State::LockedForMapping,
            State::UnflyableTask,
            "Task marked unflyable",
        ),
        EventType::Unlock => (
            State::LockedForMapping,
            State::UnlockedToMap,
            "Task unlocked",
        ),
        EventType::ImageUpload => (
            State::LockedForMapping,
            State::ImageUploaded,
            "Task images uploaded",
        ),
    };
    Transition { from, to, comment }
}

/// Facts about the task and acting user needed to validate an event.
pub struct EventContext<'a> {
    pub current: State,
    pub requires_approval: bool,
    pub user_id: &'a str,
    pub project_author: &'a str,
    pub last_actor: Option<&'a str>,
}

pub fn validate_event(
    event: EventType,
    context: &EventContext<'_>,
) -> Result<Transition, TransitionError> {
    let transition = plan_transition(event, context.requires_approval);
    if context.current != transition.from {
        return Err(TransitionError::WrongState {
            current: context.current,
            expected: transition.from,
        });
    }

    match event.required_actor() {
        Actor::ProjectAuthor if context.user_id != context.project_author => {
            Err(TransitionError::NotAuthor(event.as_str()))
        }
        Actor::LockHolder if context.last_actor != Some(context.user_id) => {
            Err(TransitionError::NotLockHolder)
        }
        _ => Ok(transition),
    }
}

/// Status codes reported by NodeODM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdmStatus {
    Queued,
    Running,
    Failed,
    Completed,
    Canceled,
    Unknown(i64),
}

impl From<i64> for OdmStatus {
    fn from(code: i64) -> Self {
        match code {
            10 => OdmStatus::Queued,
            20 => OdmStatus::Running,
            30 => OdmStatus::Failed,
            40 => OdmStatus::Completed,
            50 => OdmStatus::Canceled,
            other => OdmStatus::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    /// Fetch ODM assets into storage, then apply `transition`.
    CollectAssets { transition: Transition },
    /// Apply `transition`, then fetch whatever assets ODM produced.
    MarkFailed { transition: Transition },
    Ignore { reason: &'static str },
}

pub const TASK_COMPLETED_COMMENT: &str = "Task completed.";
pub const PROCESSING_FAILED_COMMENT: &str = "Image processing failed.";

pub fn webhook_action(status: OdmStatus, current: State) -> WebhookAction {
    match (status, current) {
        (OdmStatus::Completed, State::ImageUploaded | State::ImageProcessingFailed) => {
            WebhookAction::CollectAssets {
                transition: Transition {
                    from: current,
                    to: State::ImageProcessed,
                    comment: TASK_COMPLETED_COMMENT,
                },
            }
        }
        (OdmStatus::Completed, _) => WebhookAction::Ignore {
            reason: "task is not awaiting processing results",
        },
        (OdmStatus::Failed, State::ImageProcessingFailed) => WebhookAction::Ignore {
            reason: "task already marked as failed",
        },
        (OdmStatus::Failed, _) => WebhookAction::MarkFailed {
            transition: Transition {
                from: State::ImageUploaded,
                to: State::ImageProcessingFailed,
                comment: PROCESSING_FAILED_COMMENT,
            },
        },
        (OdmStatus::Queued | OdmStatus::Running, _) => WebhookAction::Ignore {
            reason: "processing still in progress",
        },
        (OdmStatus::Canceled, _) => WebhookAction::Ignore {
            reason: "processing was canceled",
        },
        (OdmStatus::Unknown(_), _) => WebhookAction::Ignore {
            reason: "unknown status code",
        },
    }
}
