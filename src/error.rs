use hub_client::HubError;
use thiserror::Error;

use crate::pipeline::{PipelineStage, PipelineTask};

/// Everything that can go wrong while moving a pipeline forward.
///
/// None of these escape the dispatcher: they are logged, and the ones for
/// which `aborts_pipeline` is true also end the pipeline they belong to.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A reply arrived for an instance that is not waiting for it
    /// (duplicate or out-of-order delivery).
    #[error("pipeline {pipeline_id} is in stage {actual:?}, expected {expected:?}")]
    StageGuard {
        pipeline_id: String,
        expected: PipelineStage,
        actual: PipelineStage,
    },

    #[error("no outstanding request matches quoted message {quoted:?}")]
    CorrelationMiss { quoted: Option<String> },

    #[error("pipeline {0} is not live")]
    UnknownPipeline(String),

    #[error("routing reply for pipeline {pipeline_id} selected answerer {number}, catalog has {count}")]
    UnroutableSelection {
        pipeline_id: String,
        number: usize,
        count: usize,
    },

    #[error("participant `{0}` is not present in the conversation")]
    UnknownParticipant(String),

    /// Configuration error: a configured interpreter name is missing from the snapshot.
    #[error("interpreter `{name}` configured for {task} is not present in the conversation")]
    UnknownInterpreter { task: PipelineTask, name: String },

    #[error("no interpreter participant resolved for {0} yet")]
    InterpreterUnresolved(PipelineTask),

    #[error("pipeline {pipeline_id} timed out in stage {stage:?}")]
    Stale {
        pipeline_id: String,
        stage: PipelineStage,
    },

    #[error("template rendering failed for {task}: {reason}")]
    Render { task: PipelineTask, reason: String },

    #[error(transparent)]
    Transport(#[from] HubError),
}

impl PipelineError {
    /// Whether the pipeline this error belongs to can no longer make progress.
    pub fn aborts_pipeline(&self) -> bool {
        !matches!(
            self,
            PipelineError::StageGuard { .. }
                | PipelineError::CorrelationMiss { .. }
                | PipelineError::UnknownPipeline(_)
                | PipelineError::UnknownInterpreter { .. }
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Transport(HubError::Json(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anomalies_do_not_abort() {
        let guard = PipelineError::StageGuard {
            pipeline_id: "p".into(),
            expected: PipelineStage::RewriteRequested,
            actual: PipelineStage::Done,
        };
        assert!(!guard.aborts_pipeline());
        assert!(!PipelineError::CorrelationMiss { quoted: None }.aborts_pipeline());
        assert!(PipelineError::UnknownParticipant("Beta".into()).aborts_pipeline());
        assert!(PipelineError::Transport(HubError::Closed).aborts_pipeline());
    }

    #[test]
    fn test_messages_name_the_culprit() {
        let err = PipelineError::UnroutableSelection { pipeline_id: "u1".into(), number: 3, count: 2 };
        assert_eq!(err.to_string(), "routing reply for pipeline u1 selected answerer 3, catalog has 2");
        let err = PipelineError::UnknownInterpreter { task: PipelineTask::Route, name: "Router".into() };
        assert_eq!(err.to_string(), "interpreter `Router` configured for route is not present in the conversation");
    }
}
