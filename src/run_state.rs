//! Provisioning run state machine
//!
//! Every provisioning run owns one [`ProvisioningContext`]. It is the only
//! mutable state of a run: the current stage, the stage history and the
//! package sets selected so far. Nothing is global, and the context is
//! dropped when the run ends, so two runs never see each other's progress.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! ResolvingLayout         ┐
//!     ↓                   │
//! AssemblingConfigs       │ collection: forward and cyclic
//!     ↓                   │ references are tolerated
//! ResolvingFeatures       │
//!     ↓                   │
//! ClosingPackages         ┘
//!     ↓
//! ValidatingCapabilities  ┐
//!     ↓                   │ validation: runs over the
//! OrderingConfigs         │ fully materialized graph
//!     ↓                   │
//! BuildingState           ┘
//!     ↓
//! Completed
//!
//! (Any non-terminal stage can transition to Failed)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::coordinate::ArtifactCoordinate;

/// Provisioning stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProvisioningStage {
    NotStarted = 0,
    /// Transitive feature packs and package selections
    ResolvingLayout = 1,
    /// Config selection, merging and group expansion
    AssemblingConfigs = 2,
    /// Parameter merge, identities and foreign keys
    ResolvingFeatures = 3,
    /// Package closure including feature-spec packages
    ClosingPackages = 4,
    ValidatingCapabilities = 5,
    OrderingConfigs = 6,
    BuildingState = 7,
    /// Terminal
    Completed = 8,
    /// Terminal, reachable from any non-terminal stage
    Failed = 255,
}

impl ProvisioningStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// True for the stages that validate the collected graph
    #[inline]
    pub const fn is_validation_phase(self) -> bool {
        matches!(
            self,
            Self::ValidatingCapabilities | Self::OrderingConfigs | Self::BuildingState
        )
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::ResolvingLayout),
            Self::ResolvingLayout => Some(Self::AssemblingConfigs),
            Self::AssemblingConfigs => Some(Self::ResolvingFeatures),
            Self::ResolvingFeatures => Some(Self::ClosingPackages),
            Self::ClosingPackages => Some(Self::ValidatingCapabilities),
            Self::ValidatingCapabilities => Some(Self::OrderingConfigs),
            Self::OrderingConfigs => Some(Self::BuildingState),
            Self::BuildingState => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::ResolvingLayout => "Resolving feature-pack layout",
            Self::AssemblingConfigs => "Assembling configs",
            Self::ResolvingFeatures => "Resolving features",
            Self::ClosingPackages => "Closing package dependencies",
            Self::ValidatingCapabilities => "Validating capabilities",
            Self::OrderingConfigs => "Ordering configs",
            Self::BuildingState => "Building provisioned state",
            Self::Completed => "Provisioning complete",
            Self::Failed => "Provisioning failed",
        }
    }

    /// All stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::NotStarted,
            Self::ResolvingLayout,
            Self::AssemblingConfigs,
            Self::ResolvingFeatures,
            Self::ClosingPackages,
            Self::ValidatingCapabilities,
            Self::OrderingConfigs,
            Self::BuildingState,
            Self::Completed,
        ]
    }
}

impl fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageTransitionError {
    #[error("Cannot skip from {from} to {to}")]
    SkippedStage {
        from: ProvisioningStage,
        to: ProvisioningStage,
    },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition {
        from: ProvisioningStage,
        to: ProvisioningStage,
    },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: ProvisioningStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: ProvisioningStage },
}

/// Per-run resolution context.
///
/// # Example
///
/// ```
/// use fpack::run_state::{ProvisioningContext, ProvisioningStage};
///
/// let mut ctx = ProvisioningContext::new();
/// ctx.advance().unwrap();
/// assert_eq!(ctx.current_stage(), ProvisioningStage::ResolvingLayout);
/// assert!(ctx.transition_to(ProvisioningStage::OrderingConfigs).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ProvisioningContext {
    current: ProvisioningStage,
    failed_at: Option<ProvisioningStage>,
    started: Instant,
    /// (stage, time since the run started)
    stage_history: Vec<(ProvisioningStage, Duration)>,
    /// Installed packages per feature pack, filled while closing packages
    installed: BTreeMap<ArtifactCoordinate, BTreeSet<String>>,
}

impl Default for ProvisioningContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisioningContext {
    pub fn new() -> Self {
        Self {
            current: ProvisioningStage::NotStarted,
            failed_at: None,
            started: Instant::now(),
            stage_history: Vec::with_capacity(ProvisioningStage::all_stages().len()),
            installed: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn current_stage(&self) -> ProvisioningStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<ProvisioningStage> {
        self.failed_at
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == ProvisioningStage::Completed
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == ProvisioningStage::Failed
    }

    pub fn stage_history(&self) -> &[(ProvisioningStage, Duration)] {
        &self.stage_history
    }

    /// Advance to the next stage in sequence.
    pub fn advance(&mut self) -> Result<ProvisioningStage, StageTransitionError> {
        let Some(next_stage) = self.current.next() else {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        };
        self.record_stage_transition(next_stage);
        self.current = next_stage;
        Ok(next_stage)
    }

    /// Transition to a specific stage, which must be the next one.
    pub fn transition_to(
        &mut self,
        target: ProvisioningStage,
    ) -> Result<ProvisioningStage, StageTransitionError> {
        if self.current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(StageTransitionError::AlreadyAtStage { stage: target });
        }
        if target != ProvisioningStage::Failed && target.order() < self.current.order() {
            return Err(StageTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(StageTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        self.record_stage_transition(target);
        self.current = target;
        Ok(target)
    }

    /// Mark the run as failed, recording the stage it failed in.
    pub fn fail(&mut self) -> Result<(), StageTransitionError> {
        if self.current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record_stage_transition(ProvisioningStage::Failed);
        self.current = ProvisioningStage::Failed;
        Ok(())
    }

    fn record_stage_transition(&mut self, stage: ProvisioningStage) {
        debug!(stage = %stage, "Provisioning stage");
        self.stage_history.push((stage, self.started.elapsed()));
    }

    /// Record the closed package set of a feature pack
    pub fn record_installed(&mut self, pack: ArtifactCoordinate, packages: BTreeSet<String>) {
        self.installed.insert(pack, packages);
    }

    pub fn installed(&self, pack: &ArtifactCoordinate) -> Option<&BTreeSet<String>> {
        self.installed.get(pack)
    }

    /// Hand the package sets over to the state builder
    pub fn take_installed(&mut self) -> BTreeMap<ArtifactCoordinate, BTreeSet<String>> {
        std::mem::take(&mut self.installed)
    }
}
