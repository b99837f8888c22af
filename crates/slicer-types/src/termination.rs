use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// How a pipeline is being shut down.
///
/// Passed to every operator's `stop` hook.  The termination type decides
/// what happens to windows that are still open or partially staged.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "testing", derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum TerminationType {
    /// All sources are exhausted.  Open slices are flushed and every window
    /// whose contributions are complete is merged and emitted.
    #[default]
    Graceful,

    /// Stop as soon as possible.  In-flight windows are discarded.
    HardStop,

    /// The pipeline failed.  In-flight windows are discarded and reported.
    Failure,
}

impl TerminationType {
    /// Returns `true` if open windows should be flushed and emitted.
    pub fn flushes(&self) -> bool {
        matches!(self, Self::Graceful)
    }
}

impl Display for TerminationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::HardStop => write!(f, "hard-stop"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TerminationType;

    #[test]
    fn termination_serde() {
        let termination: TerminationType = serde_json::from_str("\"hard_stop\"").unwrap();
        assert_eq!(termination, TerminationType::HardStop);
        assert_eq!(
            serde_json::to_string(&TerminationType::Graceful).unwrap(),
            "\"graceful\""
        );
        assert!(TerminationType::Graceful.flushes());
        assert!(!TerminationType::Failure.flushes());
    }
}
