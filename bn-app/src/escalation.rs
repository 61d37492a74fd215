//! Mid-run escalation gate.
//!
//! A step whose intent needs more than the current level is allowed if the user already
//! approved that level, auto-approved if it is one level above the approval, and blocked
//! otherwise.

use crate::catalog::CapabilityCatalog;
use crate::plan::AutonomyLevel;
use crate::run::{EscalationRecord, Step};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow,
    AutoApproved(EscalationRecord),
    Blocked { required: AutonomyLevel },
}

#[derive(Clone)]
pub struct EscalationGate {
    catalog: Arc<CapabilityCatalog>,
}

impl EscalationGate {
    pub fn new(catalog: Arc<CapabilityCatalog>) -> Self {
        Self { catalog }
    }

    pub fn check(&self, step: &Step, current: AutonomyLevel, approved: AutonomyLevel) -> GateDecision {
        let required = self.catalog.minimum_level(&step.intent);
        if required <= current {
            return GateDecision::Allow;
        }
        if required.value() <= approved.value().saturating_add(1) {
            return GateDecision::AutoApproved(EscalationRecord {
                current_level: current,
                requested_level: required,
                reason: format!(
                    "Step #{} ({}) requires level {}",
                    step.step_id, step.intent, required
                ),
            });
        }
        GateDecision::Blocked { required }
    }
}
