use csr_core::SigningRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Approve,
    Deny,
    /// Leave the request pending for another approver.
    Ignore,
}

pub trait DecisionPolicy: Send + Sync {
    fn decide(&self, request: &SigningRequest) -> PolicyDecision;
}

impl<F> DecisionPolicy for F
where
    F: Fn(&SigningRequest) -> PolicyDecision + Send + Sync,
{
    fn decide(&self, request: &SigningRequest) -> PolicyDecision {
        (self)(request)
    }
}

/// Approves requests for an allow-listed signer, optionally restricted to a
/// set of requesting users.
#[derive(Debug, Clone, Default)]
pub struct SignerPolicy {
    approve_signers: Vec<String>,
    approve_users: Vec<String>,
    deny_unmatched: bool,
}

impl SignerPolicy {
    pub fn new(approve_signers: Vec<String>, approve_users: Vec<String>, deny_unmatched: bool) -> Self {
        Self {
            approve_signers,
            approve_users,
            deny_unmatched,
        }
    }

    pub fn approve_signers(&self) -> &[String] {
        &self.approve_signers
    }

    pub fn approve_users(&self) -> &[String] {
        &self.approve_users
    }

    pub fn deny_unmatched(&self) -> bool {
        self.deny_unmatched
    }

    fn matches(&self, request: &SigningRequest) -> bool {
        let signer_ok = self
            .approve_signers
            .iter()
            .any(|s| s == &request.spec.signer_name);
        let user_ok = self.approve_users.is_empty()
            || request
                .spec
                .username
                .as_ref()
                .is_some_and(|user| self.approve_users.contains(user));
        signer_ok && user_ok
    }
}

impl DecisionPolicy for SignerPolicy {
    fn decide(&self, request: &SigningRequest) -> PolicyDecision {
        if self.matches(request) {
            PolicyDecision::Approve
        } else if self.deny_unmatched {
            PolicyDecision::Deny
        } else {
            PolicyDecision::Ignore
        }
    }
}
