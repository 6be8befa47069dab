use std::fmt;

use uuid::Uuid;

use crate::models::RangeStatus;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a single deployment step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step did its work.
    Success,

    /// The step had nothing to do.
    Skipped(String),

    /// The step failed; deployment continued.
    Failed(String),
}

/// What a step acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStep {
    /// The range sandbox.
    Sandbox,

    /// The range router.
    Router,

    /// A range network.
    Network {
        /// The network id.
        network_id: Uuid,

        /// The network name.
        name: String,
    },

    /// A VM.
    Vm {
        /// The VM id.
        vm_id: Uuid,

        /// The VM hostname.
        hostname: String,
    },

    /// Console forwarding for the range.
    Consoles,
}

/// A step and its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// The step.
    pub step: DeploymentStep,

    /// How it went.
    pub outcome: StepOutcome,
}

/// Per-step results of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentReport {
    /// The deployed range.
    pub range_id: Uuid,

    /// The range status after the deployment.
    pub status: RangeStatus,

    /// Steps in execution order.
    pub steps: Vec<StepReport>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StepOutcome {
    /// Whether the step failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl DeploymentReport {
    /// Creates an empty report.
    pub fn new(range_id: Uuid) -> Self {
        Self {
            range_id,
            status: RangeStatus::Deploying,
            steps: Vec::new(),
        }
    }

    /// Records a step.
    pub fn record(&mut self, step: DeploymentStep, outcome: StepOutcome) {
        self.steps.push(StepReport { step, outcome });
    }

    /// The steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.outcome.is_failed())
    }

    /// Whether the range came up with at least one failed step.
    pub fn is_degraded(&self) -> bool {
        self.failures().next().is_some()
    }

    /// The outcome recorded for a VM.
    pub fn vm_outcome(&self, vm_id: Uuid) -> Option<&StepOutcome> {
        self.steps.iter().find_map(|s| match &s.step {
            DeploymentStep::Vm { vm_id: id, .. } if *id == vm_id => Some(&s.outcome),
            _ => None,
        })
    }

    /// The outcome recorded for the router.
    pub fn router_outcome(&self) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| s.step == DeploymentStep::Router)
            .map(|s| &s.outcome)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for DeploymentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sandbox => write!(f, "sandbox"),
            Self::Router => write!(f, "router"),
            Self::Network { name, .. } => write!(f, "network {name}"),
            Self::Vm { hostname, .. } => write!(f, "vm {hostname}"),
            Self::Consoles => write!(f, "consoles"),
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "ok"),
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            Self::Failed(reason) => write!(f, "FAILED: {reason}"),
        }
    }
}

impl fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "range {} is {}", self.range_id, self.status)?;
        for step in &self.steps {
            writeln!(f, "  {:<32} {}", step.step.to_string(), step.outcome)?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
