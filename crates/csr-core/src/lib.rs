//! Watch sessions and the approval protocol for certificate signing requests.
//!
//! - [`WatchRegistry`] opens subscriptions against a [`RequestStore`], runs one
//!   translation task per session and cancels them all on shutdown.
//! - [`translate`] classifies raw change notifications into signing requests or
//!   diagnostics; malformed events are reported and dropped, never fatal.
//! - [`Approver`] appends an approve/deny condition and submits it as a single
//!   conditional update. Conflicts surface to the caller without retries.

pub mod approval;
pub mod error;
pub mod model;
pub mod registry;
pub mod store;
pub mod translate;

pub use approval::{Approver, Decision};
pub use error::{ApprovalError, StoreError, WatchError};
pub use model::{Condition, ConditionKind, ConditionStatus, SigningRequest};
pub use registry::{StreamEnd, WatchConfig, WatchRegistry, WatchStream};
pub use store::{MemoryStore, RawEvent, RequestStore, Subscription};
pub use translate::{
    translate, translate_change, ChangeKind, DiagnosticSink, MalformedEvent, Outcome,
    TracingDiagnostics, WatchEvent,
};
