//! Two-valued callback outcome and the per-section status

use tftp::SectionOutcome;

/// What a user callback reports back to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationResult {
    #[default]
    Ok,
    Error,
}

impl OperationResult {
    pub fn is_ok(self) -> bool {
        self == OperationResult::Ok
    }

    /// Engine-side view of the outcome; `kind` names the callback in the
    /// resulting error
    pub(crate) fn into_engine(self, kind: &str) -> anyhow::Result<()> {
        match self {
            OperationResult::Ok => Ok(()),
            OperationResult::Error => Err(anyhow::anyhow!("{} callback reported an error", kind)),
        }
    }
}

impl<T, E> From<Result<T, E>> for OperationResult {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(_) => OperationResult::Ok,
            Err(_) => OperationResult::Error,
        }
    }
}

/// Status of a section as seen from callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionStatus {
    Ok,
    Error,
    /// The section has not concluded yet
    Undefined,
}

impl From<SectionOutcome> for SectionStatus {
    fn from(outcome: SectionOutcome) -> Self {
        match outcome {
            SectionOutcome::Pending => SectionStatus::Undefined,
            SectionOutcome::Succeeded => SectionStatus::Ok,
            SectionOutcome::Failed => SectionStatus::Error,
        }
    }
}
