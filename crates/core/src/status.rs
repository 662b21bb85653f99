//! Job state machine states and the legal forward transitions between them.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::stage::Stage;

/// State of a job in the pipeline.
///
/// ```text
/// Uploaded -> Queued(Stt) -> Processing(Stt) -> Queued(Summary) -> Processing(Summary)
///          -> Queued(Postprocess) -> Processing(Postprocess) -> Completed
/// ```
///
/// Any `Queued`/`Processing` state (and `Uploaded`) may move to `Failed`.
/// Persisted as a flat string (`queued_stt`, `processing_summary`, ...).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum JobStatus {
    Uploaded,
    Queued(Stage),
    Processing(Stage),
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Uploaded => "uploaded",
            JobStatus::Queued(Stage::Stt) => "queued_stt",
            JobStatus::Queued(Stage::Summary) => "queued_summary",
            JobStatus::Queued(Stage::Postprocess) => "queued_postprocess",
            JobStatus::Processing(Stage::Stt) => "processing_stt",
            JobStatus::Processing(Stage::Summary) => "processing_summary",
            JobStatus::Processing(Stage::Postprocess) => "processing_postprocess",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// The stage this status belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobStatus::Queued(s) | JobStatus::Processing(s) => Some(*s),
            _ => None,
        }
    }

    /// Position along the success path (`Failed` has no position).
    pub fn rank(&self) -> Option<u8> {
        let stage_rank = |s: &Stage| match s {
            Stage::Stt => 0,
            Stage::Summary => 2,
            Stage::Postprocess => 4,
        };
        match self {
            JobStatus::Uploaded => Some(0),
            JobStatus::Queued(s) => Some(1 + stage_rank(s)),
            JobStatus::Processing(s) => Some(2 + stage_rank(s)),
            JobStatus::Completed => Some(7),
            JobStatus::Failed => None,
        }
    }

    /// Forward transitions of the state machine.
    ///
    /// `Processing(s) -> Processing(s)` is a reclaim (redelivery after lease
    /// expiry); it still bumps the version. Re-runs out of a terminal state
    /// are not covered here (see [`crate::Job::rerun`]).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (*self, next) {
            (Completed, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Uploaded, Queued(Stage::Stt)) => true,
            (Queued(a), Processing(b)) => a == b,
            (Processing(a), Processing(b)) => a == b,
            (Processing(a), Queued(b)) => a.next() == Some(b),
            (Processing(a), Completed) => a.is_last(),
            _ => false,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(JobStatus::Uploaded),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => {
                if let Some(stage) = other.strip_prefix("queued_") {
                    Ok(JobStatus::Queued(stage.parse()?))
                } else if let Some(stage) = other.strip_prefix("processing_") {
                    Ok(JobStatus::Processing(stage.parse()?))
                } else {
                    Err(DomainError::invalid_id(format!("unknown job status '{other}'")))
                }
            }
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 9] = [
        JobStatus::Uploaded,
        JobStatus::Queued(Stage::Stt),
        JobStatus::Processing(Stage::Stt),
        JobStatus::Queued(Stage::Summary),
        JobStatus::Processing(Stage::Summary),
        JobStatus::Queued(Stage::Postprocess),
        JobStatus::Processing(Stage::Postprocess),
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    #[test]
    fn happy_path_is_legal() {
        for pair in ALL[..8].windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn terminal_states_never_move() {
        for next in ALL {
            assert!(!JobStatus::Completed.can_transition_to(next));
            assert!(!JobStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn no_stage_is_skipped() {
        assert!(!JobStatus::Uploaded.can_transition_to(JobStatus::Queued(Stage::Summary)));
        assert!(!JobStatus::Processing(Stage::Stt).can_transition_to(JobStatus::Completed));
        assert!(
            !JobStatus::Processing(Stage::Stt)
                .can_transition_to(JobStatus::Queued(Stage::Postprocess))
        );
        assert!(!JobStatus::Queued(Stage::Stt).can_transition_to(JobStatus::Queued(Stage::Summary)));
    }

    #[test]
    fn processing_never_returns_to_queued_of_same_stage() {
        for stage in Stage::ALL {
            assert!(!JobStatus::Processing(stage).can_transition_to(JobStatus::Queued(stage)));
        }
    }

    #[test]
    fn serializes_as_flat_string() {
        let json = serde_json::to_string(&JobStatus::Processing(Stage::Summary)).unwrap();
        assert_eq!(json, "\"processing_summary\"");
        for status in ALL {
            let parsed: JobStatus = serde_json::from_str(&serde_json::to_string(&status).unwrap()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(serde_json::from_str::<JobStatus>("\"queued_transcode\"").is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_status() -> impl Strategy<Value = JobStatus> {
            (0usize..ALL.len()).prop_map(|i| ALL[i])
        }

        proptest! {
            /// Property: every legal non-failing transition moves forward (or reclaims in place).
            #[test]
            fn legal_transitions_never_move_backward(from in any_status(), to in any_status()) {
                if from.can_transition_to(to) {
                    if let (Some(a), Some(b)) = (from.rank(), to.rank()) {
                        prop_assert!(b >= a);
                        if b == a {
                            prop_assert!(matches!(from, JobStatus::Processing(_)));
                        }
                    }
                }
            }

            /// Property: a random walk over legal transitions is a prefix of the success path.
            #[test]
            fn random_walk_stays_on_the_success_path(choices in proptest::collection::vec(0usize..9, 0..32)) {
                let mut current = JobStatus::Uploaded;
                let mut ranks = vec![current.rank()];
                for c in choices {
                    let next = ALL[c];
                    if current.can_transition_to(next) {
                        current = next;
                        ranks.push(current.rank());
                    }
                }
                let success: Vec<u8> = ranks.iter().flatten().copied().collect();
                for pair in success.windows(2) {
                    prop_assert!(pair[1] == pair[0] || pair[1] == pair[0] + 1);
                }
                // `Failed` can only ever be the final observed state.
                if let Some(pos) = ranks.iter().position(|r| r.is_none()) {
                    prop_assert_eq!(pos, ranks.len() - 1);
                }
            }
        }
    }
}
