use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{info, warn};

use crate::error::ApprovalError;
use crate::model::{Condition, ConditionKind, ConditionStatus, SigningRequest};
use crate::store::RequestStore;

pub const DECISION_REASON: &str = "User activation";
pub const APPROVED_MESSAGE: &str = "This CSR was approved";
pub const DENIED_MESSAGE: &str = "This CSR was denied by kubectl certificate deny";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn kind(self) -> ConditionKind {
        match self {
            Decision::Approve => ConditionKind::Approved,
            Decision::Deny => ConditionKind::Denied,
        }
    }

    /// The condition recorded for this decision at `at`.
    pub fn condition(self, at: DateTime<Utc>) -> Condition {
        let message = match self {
            Decision::Approve => APPROVED_MESSAGE,
            Decision::Deny => DENIED_MESSAGE,
        };
        Condition {
            kind: self.kind(),
            status: ConditionStatus::True,
            reason: DECISION_REASON.to_string(),
            message: message.to_string(),
            last_update_time: Some(at.trunc_subsecs(0)),
            last_transition_time: None,
        }
    }
}

/// Commits approve/deny decisions to the request store.
///
/// Each call appends exactly one condition to the caller's request and submits
/// it as a single conditional update. Conflicts are returned, never retried:
/// the caller has to re-read the request before deciding again.
#[derive(Clone)]
pub struct Approver {
    store: Arc<dyn RequestStore>,
}

impl Approver {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    pub async fn approve(
        &self,
        request: &mut SigningRequest,
    ) -> Result<SigningRequest, ApprovalError> {
        self.decide(request, Decision::Approve).await
    }

    pub async fn deny(&self, request: &mut SigningRequest) -> Result<SigningRequest, ApprovalError> {
        self.decide(request, Decision::Deny).await
    }

    pub async fn decide(
        &self,
        request: &mut SigningRequest,
        decision: Decision,
    ) -> Result<SigningRequest, ApprovalError> {
        if request.name().is_empty() {
            return Err(ApprovalError::MissingName);
        }
        request
            .status
            .conditions
            .push(decision.condition(Utc::now()));

        let name = request.name().to_string();
        match self.store.submit_approval_update(&name, request).await {
            Ok(updated) => {
                info!(
                    target = "csr.approval",
                    csr = %name,
                    decision = ?decision,
                    resource_version = updated.metadata.resource_version.as_deref().unwrap_or(""),
                    "signing request decided"
                );
                Ok(updated)
            }
            Err(err) => {
                let err = ApprovalError::from_store(&name, err);
                warn!(
                    target = "csr.approval",
                    csr = %name,
                    decision = ?decision,
                    error = %err,
                    "failed to submit decision"
                );
                Err(err)
            }
        }
    }
}
