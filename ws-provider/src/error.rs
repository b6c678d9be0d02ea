//! Error types for provisioning runs.

use thiserror::Error;
use ws_core::WsError;

use crate::state::ProvisionStage;

pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

/// Failure of one provisioning run, tagged with the stage it happened in.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("provisioning failed during {stage}: {source}")]
    Stage {
        stage: ProvisionStage,
        #[source]
        source: WsError,
    },

    #[error("unknown builder type: no devcontainer descriptor, Dockerfile or image found in {0}")]
    UnknownBuilderType(String),

    #[error("provisioning cancelled during {stage}")]
    Cancelled { stage: ProvisionStage },
}

impl ProvisionError {
    /// Wrap a shim error; cancellation keeps its own variant.
    pub fn at(stage: ProvisionStage, source: WsError) -> Self {
        match source {
            WsError::Cancelled => Self::Cancelled { stage },
            source => Self::Stage { stage, source },
        }
    }

    pub fn stage(&self) -> ProvisionStage {
        match self {
            Self::Stage { stage, .. } | Self::Cancelled { stage } => *stage,
            Self::UnknownBuilderType(_) => ProvisionStage::BuilderDetecting,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// `map_err` adapter: `.map_err(at_stage(ProvisionStage::Cloning))`.
pub fn at_stage(stage: ProvisionStage) -> impl FnOnce(WsError) -> ProvisionError {
    move |source| ProvisionError::at(stage, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_source_maps_to_cancelled_variant() {
        let err = ProvisionError::at(ProvisionStage::Cloning, WsError::Cancelled);
        assert!(err.is_cancelled());
        assert_eq!(err.stage(), ProvisionStage::Cloning);
    }

    #[test]
    fn test_unknown_builder_reports_detection_stage() {
        let err = ProvisionError::UnknownBuilderType("/ws/demo".into());
        assert_eq!(err.stage(), ProvisionStage::BuilderDetecting);
        assert!(err.to_string().contains("/ws/demo"));
    }
}
