//! Certificate signing request approver.
//!
//! Wires the watch registry and approval protocol from `csr-core` to the
//! Kubernetes API and drives them with a signer allow-list policy.

pub mod config;
pub mod controller;
pub mod kube;
pub mod policy;
pub mod telemetry;
