//! Lifecycle status codes for transfers and destinations.
//!
//! The four-letter codes are the wire/storage representation; the labels are
//! what operators see in dashboards and history entries.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Status of a single [`DataTransfer`](crate::model::DataTransfer).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum TransferStatus {
    /// Arriving: record created, payload not yet confirmed on any mover.
    #[strum(serialize = "INIT")]
    Init,
    /// Preset: scheduled for a later retrieval (acquisition flow).
    #[strum(serialize = "SCHE")]
    Sche,
    /// Fetching: retrieval from the remote source in progress.
    #[strum(serialize = "FETC")]
    Fetc,
    /// StandBy: parked by an operator or by duplicate suppression.
    #[strum(serialize = "HOLD")]
    Hold,
    /// Queued: eligible for dispatch.
    #[strum(serialize = "WAIT")]
    Wait,
    /// Transferring: a mover is pushing the file right now.
    #[strum(serialize = "EXEC")]
    Exec,
    #[strum(serialize = "DONE")]
    Done,
    /// ReQueued: failed or interrupted, waiting for another attempt.
    #[strum(serialize = "RETR")]
    Retr,
    /// Stopped by an operator.
    #[strum(serialize = "STOP")]
    Stop,
    #[strum(serialize = "FAIL")]
    Fail,
    /// Interrupted by a process restart.
    #[strum(serialize = "INTR")]
    Intr,
}

impl TransferStatus {
    /// Human-readable label shown to operators.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Init => "Arriving",
            Self::Sche => "Preset",
            Self::Fetc => "Fetching",
            Self::Hold => "StandBy",
            Self::Wait => "Queued",
            Self::Exec => "Transferring",
            Self::Done => "Done",
            Self::Retr => "ReQueued",
            Self::Stop => "Stopped",
            Self::Fail => "Failed",
            Self::Intr => "Interrupted",
        }
    }

    /// Terminal or parked states that a worker drops from its queue.
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::Hold | Self::Fail | Self::Stop)
    }
}

/// Status of a [`Destination`](crate::model::Destination).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum DestinationStatus {
    #[strum(serialize = "INIT")]
    Init,
    /// Running: a worker is dispatching transfers.
    #[strum(serialize = "EXEC")]
    Exec,
    /// Waiting for its queue time.
    #[strum(serialize = "SCHE")]
    Sche,
    /// NoHosts: no dissemination host could be used.
    #[strum(serialize = "FAIL")]
    Fail,
    #[strum(serialize = "INTR")]
    Intr,
    /// Idle: eligible but nothing queued.
    #[strum(serialize = "WAIT")]
    Wait,
    #[strum(serialize = "DONE")]
    Done,
    #[strum(serialize = "RETR")]
    Retr,
    #[strum(serialize = "RSTR")]
    Rstr,
    #[strum(serialize = "STOP")]
    Stop,
    /// Failed: held after exhausting the destination retry budget.
    #[strum(serialize = "HOLD")]
    Hold,
    /// Sleeping: worker shut itself down after inactivity.
    #[strum(serialize = "IDLE")]
    Idle,
}

impl DestinationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Init => "Initialized",
            Self::Exec => "Running",
            Self::Sche => "Waiting",
            Self::Fail => "NoHosts",
            Self::Intr => "Interrupted",
            Self::Wait => "Idle",
            Self::Done => "Resending",
            Self::Retr => "Retrying",
            Self::Rstr => "Restarting",
            Self::Stop => "Stopped",
            Self::Hold => "Failed",
            Self::Idle => "Sleeping",
        }
    }
}

/// Dashboard color for a destination, derived from its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum StatusColor {
    #[strum(serialize = "green")]
    Green,
    #[strum(serialize = "blue")]
    Blue,
    #[strum(serialize = "yellow")]
    Yellow,
    #[strum(serialize = "red")]
    Red,
}

impl From<DestinationStatus> for StatusColor {
    fn from(status: DestinationStatus) -> Self {
        match status {
            DestinationStatus::Wait | DestinationStatus::Sche => Self::Blue,
            DestinationStatus::Stop => Self::Yellow,
            DestinationStatus::Hold
            | DestinationStatus::Fail
            | DestinationStatus::Done
            | DestinationStatus::Idle => Self::Red,
            _ => Self::Green,
        }
    }
}
