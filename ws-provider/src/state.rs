//! Stage machine for a single provisioning run.
//!
//! ```text
//! NotStarted -> ImagePulling -> Cloning -> BuilderDetecting -> DevcontainerBuild -> Ready
//!                    |                            |
//!                    |                            +-> ImageFinalize -> Ready
//!                    +-> ImageFinalize  (no build configuration)
//! ```
//!
//! Any non-terminal stage may move to `Failed`, which remembers where it happened.

use std::fmt;

use tracing::{debug, info};
use ws_core::{LogWriter, WsError};

use crate::error::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStage {
    NotStarted,
    ImagePulling,
    Cloning,
    BuilderDetecting,
    DevcontainerBuild,
    ImageFinalize,
    Ready,
}

impl ProvisionStage {
    pub fn is_terminal(self) -> bool {
        self == Self::Ready
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use ProvisionStage::*;
        matches!(
            (self, next),
            (NotStarted, ImagePulling)
                | (ImagePulling, Cloning)
                | (ImagePulling, ImageFinalize)
                | (Cloning, BuilderDetecting)
                | (BuilderDetecting, DevcontainerBuild)
                | (BuilderDetecting, ImageFinalize)
                | (DevcontainerBuild, Ready)
                | (ImageFinalize, Ready)
        )
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not-started",
            Self::ImagePulling => "image-pulling",
            Self::Cloning => "cloning",
            Self::BuilderDetecting => "builder-detecting",
            Self::DevcontainerBuild => "devcontainer-build",
            Self::ImageFinalize => "image-finalize",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Active(ProvisionStage),
    Failed { stage: ProvisionStage },
}

/// Tracks the current stage of a run and reports transitions to the user log.
#[derive(Debug)]
pub struct StageTracker {
    state: ProvisionState,
    history: Vec<ProvisionStage>,
    log: LogWriter,
}

impl StageTracker {
    pub fn new(log: LogWriter) -> Self {
        Self {
            state: ProvisionState::Active(ProvisionStage::NotStarted),
            history: vec![ProvisionStage::NotStarted],
            log,
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    /// Stage the run is in, or the stage it failed in.
    pub fn current(&self) -> ProvisionStage {
        match self.state {
            ProvisionState::Active(stage) | ProvisionState::Failed { stage } => stage,
        }
    }

    pub fn history(&self) -> &[ProvisionStage] {
        &self.history
    }

    pub fn advance(&mut self, next: ProvisionStage) -> Result<(), ProvisionError> {
        let current = match self.state {
            ProvisionState::Active(stage) if stage.can_advance_to(next) => stage,
            ProvisionState::Active(stage) | ProvisionState::Failed { stage } => {
                return Err(ProvisionError::at(
                    stage,
                    WsError::Internal(format!("illegal stage transition {} -> {}", stage, next)),
                ));
            }
        };
        debug!("Provisioning stage {} -> {}", current, next);
        if next != ProvisionStage::Ready {
            self.log.write_line(&format!("==> {}", next));
        }
        self.state = ProvisionState::Active(next);
        self.history.push(next);
        Ok(())
    }

    /// Move to `Failed`, keeping the stage that was active. A no-op once terminal.
    pub fn fail(&mut self, err: &ProvisionError) {
        if let ProvisionState::Active(stage) = self.state {
            if stage.is_terminal() {
                return;
            }
            info!("Provisioning failed during {}: {}", stage, err);
            self.log.write_line(&format!("Provisioning failed: {}", err));
            self.state = ProvisionState::Failed { stage };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProvisionStage::*;

    #[test]
    fn test_build_path_transitions() {
        let mut tracker = StageTracker::new(LogWriter::sink());
        for stage in [ImagePulling, Cloning, BuilderDetecting, DevcontainerBuild, Ready] {
            tracker.advance(stage).unwrap();
        }
        assert_eq!(tracker.state(), ProvisionState::Active(Ready));
        assert_eq!(tracker.history().len(), 6);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut tracker = StageTracker::new(LogWriter::sink());
        tracker.advance(ImagePulling).unwrap();
        let err = tracker.advance(DevcontainerBuild).unwrap_err();
        assert_eq!(err.stage(), ImagePulling);
    }

    #[test]
    fn test_fail_records_originating_stage() {
        let mut tracker = StageTracker::new(LogWriter::sink());
        tracker.advance(ImagePulling).unwrap();
        tracker.advance(Cloning).unwrap();
        tracker.fail(&ProvisionError::at(Cloning, WsError::Command("git".into())));

        assert_eq!(tracker.state(), ProvisionState::Failed { stage: Cloning });
        assert!(tracker.advance(BuilderDetecting).is_err());
    }

    #[test]
    fn test_ready_is_terminal() {
        let mut tracker = StageTracker::new(LogWriter::sink());
        tracker.advance(ImagePulling).unwrap();
        tracker.advance(ImageFinalize).unwrap();
        tracker.advance(Ready).unwrap();
        tracker.fail(&ProvisionError::Cancelled { stage: Ready });
        assert_eq!(tracker.state(), ProvisionState::Active(Ready));
    }
}
