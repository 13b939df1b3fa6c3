use std::time::Duration;

use csr_core::{
    ApprovalError, Approver, ChangeKind, SigningRequest, WatchError, WatchEvent, WatchRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::policy::{DecisionPolicy, PolicyDecision};

/// Counts of what the policy loop did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerSummary {
    pub approved: u64,
    pub denied: u64,
    pub ignored: u64,
    pub deleted: u64,
    pub already_decided: u64,
    pub conflicts: u64,
    pub failures: u64,
    pub watches_opened: u64,
}

/// Policy loop: reads the watch stream, decides each pending request and
/// commits the decision.
pub struct Controller<P> {
    registry: WatchRegistry,
    approver: Approver,
    policy: P,
    rewatch_delay: Duration,
}

impl<P: DecisionPolicy> Controller<P> {
    pub fn new(
        registry: WatchRegistry,
        approver: Approver,
        policy: P,
        rewatch_delay: Duration,
    ) -> Self {
        Self {
            registry,
            approver,
            policy,
            rewatch_delay,
        }
    }

    /// Run until `shutdown` fires or the registry is stopped elsewhere. Ended
    /// watches are re-opened after the rewatch delay; a conflicted decision is
    /// retried only when the watch redelivers the changed request.
    pub async fn run(&self, shutdown: CancellationToken) -> ControllerSummary {
        let mut summary = ControllerSummary::default();

        while !shutdown.is_cancelled() {
            let mut stream = match self.registry.open_watch().await {
                Ok(stream) => stream,
                Err(WatchError::Stopped) => break,
                Err(err) => {
                    warn!(target = "csr.controller", error = %err, delay_secs = self.rewatch_delay.as_secs(), "watch unavailable; retrying");
                    self.pause(&shutdown).await;
                    continue;
                }
            };
            summary.watches_opened += 1;
            info!(target = "csr.controller", session_id = stream.session_id(), "watching signing requests");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    next = stream.recv_event() => next,
                };
                let Some(change) = next else { break };
                self.handle(change, &mut summary).await;
            }

            if shutdown.is_cancelled() {
                break;
            }
            let end = stream.end().await;
            info!(target = "csr.controller", end = ?end, "watch ended");
            self.pause(&shutdown).await;
        }

        self.registry.stop_all();
        info!(target = "csr.controller", summary = ?summary, "controller stopped");
        summary
    }

    async fn pause(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.rewatch_delay) => {}
        }
    }

    async fn handle(&self, change: WatchEvent, summary: &mut ControllerSummary) {
        let mut request: SigningRequest = change.request;
        if change.kind == ChangeKind::Deleted {
            debug!(target = "csr.controller", csr = %request.name(), "request deleted");
            summary.deleted += 1;
            return;
        }
        if let Some(decision) = request.decision() {
            debug!(target = "csr.controller", csr = %request.name(), decision = ?decision, "already decided");
            summary.already_decided += 1;
            return;
        }
        if request.metadata.extra.contains_key("deletionTimestamp") {
            debug!(target = "csr.controller", csr = %request.name(), "request is being deleted");
            summary.ignored += 1;
            return;
        }

        let result = match self.policy.decide(&request) {
            PolicyDecision::Ignore => {
                debug!(
                    target = "csr.controller",
                    csr = %request.name(),
                    signer = %request.spec.signer_name,
                    "no policy match; leaving pending"
                );
                summary.ignored += 1;
                return;
            }
            PolicyDecision::Approve => self
                .approver
                .approve(&mut request)
                .await
                .map(|_| summary.approved += 1),
            PolicyDecision::Deny => self
                .approver
                .deny(&mut request)
                .await
                .map(|_| summary.denied += 1),
        };

        match result {
            Ok(()) => {}
            Err(ApprovalError::UpdateConflict { name }) => {
                info!(target = "csr.controller", csr = %name, "request changed before decision landed; waiting for next update");
                summary.conflicts += 1;
            }
            Err(err) => {
                warn!(target = "csr.controller", csr = %request.name(), error = %err, "decision not committed");
                summary.failures += 1;
            }
        }
    }
}
