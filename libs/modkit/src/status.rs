//! Per-module lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::pipeline::PipelineStep;

// ----- Status model ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModuleStatus {
    Discovered,
    Stage1Registered,
    Stage2Initializing,
    Ready,
    ShuttingDownGraceful,
    ShuttingDownForced,
    Stopped,
    Failed,
}

impl ModuleStatus {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        match self {
            ModuleStatus::Discovered => 0,
            ModuleStatus::Stage1Registered => 1,
            ModuleStatus::Stage2Initializing => 2,
            ModuleStatus::Ready => 3,
            ModuleStatus::ShuttingDownGraceful => 4,
            ModuleStatus::ShuttingDownForced => 5,
            ModuleStatus::Stopped => 6,
            ModuleStatus::Failed => 7,
        }
    }

    #[inline]
    pub const fn from_u8(x: u8) -> Self {
        match x {
            1 => ModuleStatus::Stage1Registered,
            2 => ModuleStatus::Stage2Initializing,
            3 => ModuleStatus::Ready,
            4 => ModuleStatus::ShuttingDownGraceful,
            5 => ModuleStatus::ShuttingDownForced,
            6 => ModuleStatus::Stopped,
            7 => ModuleStatus::Failed,
            _ => ModuleStatus::Discovered,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ModuleStatus::Discovered => "discovered",
            ModuleStatus::Stage1Registered => "stage1_registered",
            ModuleStatus::Stage2Initializing => "stage2_initializing",
            ModuleStatus::Ready => "ready",
            ModuleStatus::ShuttingDownGraceful => "shutting_down_graceful",
            ModuleStatus::ShuttingDownForced => "shutting_down_forced",
            ModuleStatus::Stopped => "stopped",
            ModuleStatus::Failed => "failed",
        }
    }

    /// Whether `self -> to` is a legal lifecycle step.
    pub const fn can_transition_to(self, to: ModuleStatus) -> bool {
        use ModuleStatus::*;
        matches!(
            (self, to),
            (Discovered, Stage1Registered)
                | (Discovered, Failed)
                | (Stage1Registered, Stage2Initializing)
                | (Stage1Registered, Ready)
                | (Stage1Registered, Failed)
                | (Stage1Registered, ShuttingDownGraceful)
                | (Stage2Initializing, Ready)
                | (Stage2Initializing, Failed)
                | (Ready, ShuttingDownGraceful)
                | (ShuttingDownGraceful, ShuttingDownForced)
                | (ShuttingDownForced, Stopped)
        )
    }

    /// Modules past Stage 1 that have not failed.
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            ModuleStatus::Stage1Registered | ModuleStatus::Stage2Initializing | ModuleStatus::Ready
        )
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ModuleStatus,
    pub to: ModuleStatus,
}

/// Atomic holder for a [`ModuleStatus`].
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self(AtomicU8::new(ModuleStatus::Discovered.as_u8()))
    }
}

impl StatusCell {
    #[inline]
    pub fn get(&self) -> ModuleStatus {
        ModuleStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `to` if the step is legal; returns the previous status.
    pub fn transition(&self, to: ModuleStatus) -> Result<ModuleStatus, InvalidTransition> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = ModuleStatus::from_u8(current);
            if !from.can_transition_to(to) {
                return Err(InvalidTransition { from, to });
            }
            match self.0.compare_exchange(
                current,
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

// ----- Failure model ---------------------------------------------------------

/// Where in the lifecycle a module was failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    Resolve,
    Pipeline(PipelineStep),
    Stage1,
    Stage2,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Resolve => f.write_str("dependency resolution"),
            FailurePhase::Pipeline(step) => {
                write!(f, "registration step {} ({})", step.number(), step.as_str())
            }
            FailurePhase::Stage1 => f.write_str("stage 1"),
            FailurePhase::Stage2 => f.write_str("stage 2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    pub phase: FailurePhase,
    pub reason: String,
}

impl ModuleFailure {
    pub fn new(phase: FailurePhase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.phase, self.reason)
    }
}
