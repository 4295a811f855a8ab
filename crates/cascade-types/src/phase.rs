use std::fmt;

/// Observable lifecycle phase of a stage.
///
/// ```text
/// Pending ──(schedule)──► Running ──(success)──► Succeeded
///                         ├──(error)────► Failed
///                         └──(cancel)───► Cancelled
/// Pending ──(cancel)──► Cancelled
/// ```
///
/// A stage reaches exactly one terminal phase exactly once; terminal phases
/// are irreversible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StagePhase {
    Pending,
    Running,
    /// Terminal.
    Succeeded,
    /// Terminal.
    Failed,
    /// Terminal.
    Cancelled,
}

impl StagePhase {
    /// Whether the stage has reached a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}
