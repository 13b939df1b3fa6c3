use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use crate::kube::KubeConfig;
use crate::policy::SignerPolicy;

pub const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_LOG_FILTER: &str = "info,csr_core=debug,csr_approver=debug";

#[derive(Debug, Parser)]
#[command(
    name = "csr-approver",
    author,
    version,
    about = "Approves or denies pending certificate signing requests"
)]
pub struct Cli {
    /// Kubernetes API server URL. Falls back to the in-cluster service address.
    #[arg(long, env = "CSR_APPROVER_KUBE_HOST")]
    pub kube_host: Option<String>,

    /// File holding the bearer token used against the API server.
    #[arg(long, env = "CSR_APPROVER_KUBE_TOKEN_FILE", default_value = DEFAULT_TOKEN_FILE)]
    pub kube_token_file: PathBuf,

    /// PEM bundle trusted for the API server certificate.
    #[arg(long, env = "CSR_APPROVER_KUBE_CA_FILE")]
    pub kube_ca_file: Option<PathBuf>,

    /// Skip API server certificate verification.
    #[arg(long, env = "CSR_APPROVER_INSECURE_SKIP_TLS_VERIFY", default_value_t = false)]
    pub insecure_skip_tls_verify: bool,

    /// Signer names whose requests are approved. Repeat or comma-separate.
    #[arg(
        long = "approve-signer",
        env = "CSR_APPROVER_SIGNERS",
        value_delimiter = ','
    )]
    pub approve_signers: Vec<String>,

    /// Usernames allowed to obtain certificates. Empty allows any requester.
    #[arg(long = "approve-user", env = "CSR_APPROVER_USERS", value_delimiter = ',')]
    pub approve_users: Vec<String>,

    /// Deny requests the policy does not approve instead of leaving them pending.
    #[arg(long, env = "CSR_APPROVER_DENY_UNMATCHED", default_value_t = false)]
    pub deny_unmatched: bool,

    /// Requests buffered per watch ahead of the policy loop.
    #[arg(long, env = "CSR_APPROVER_WATCH_BUFFER", default_value_t = 64)]
    pub watch_buffer: usize,

    /// Delay before re-opening a watch that ended.
    #[arg(long, env = "CSR_APPROVER_REWATCH_DELAY_SECS", default_value_t = 5)]
    pub rewatch_delay_secs: u64,

    #[arg(long, env = "RUST_LOG", default_value = DEFAULT_LOG_FILTER)]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct ApproverConfig {
    pub kube: KubeConfig,
    pub policy: SignerPolicy,
    pub watch_buffer: usize,
    pub rewatch_delay: Duration,
}

impl TryFrom<Cli> for ApproverConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let host = match cli.kube_host.filter(|h| !h.trim().is_empty()) {
            Some(host) => host.trim().trim_end_matches('/').to_string(),
            None => in_cluster_host()?,
        };
        let approve_signers = non_empty(cli.approve_signers);
        if approve_signers.is_empty() {
            bail!("at least one --approve-signer is required");
        }
        if cli.watch_buffer == 0 {
            bail!("--watch-buffer must be greater than zero");
        }

        Ok(ApproverConfig {
            kube: KubeConfig {
                host,
                token_file: cli.kube_token_file,
                ca_file: cli.kube_ca_file,
                insecure_skip_tls_verify: cli.insecure_skip_tls_verify,
            },
            policy: SignerPolicy::new(
                approve_signers,
                non_empty(cli.approve_users),
                cli.deny_unmatched,
            ),
            watch_buffer: cli.watch_buffer,
            rewatch_delay: Duration::from_secs(cli.rewatch_delay_secs),
        })
    }
}

fn in_cluster_host() -> Result<String> {
    let Ok(host) = std::env::var("KUBERNETES_SERVICE_HOST") else {
        bail!("no API server configured: pass --kube-host or run inside a cluster");
    };
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
    if host.contains(':') {
        Ok(format!("https://[{host}]:{port}"))
    } else {
        Ok(format!("https://{host}:{port}"))
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["csr-approver"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("valid args")
    }

    #[test]
    fn builds_config_from_flags() {
        let cli = parse(&[
            "--kube-host",
            "https://10.0.0.1:6443/",
            "--kube-token-file",
            "/tmp/token",
            "--approve-signer",
            "kubernetes.io/kube-apiserver-client, example.com/agent",
            "--approve-user",
            "agent",
            "--deny-unmatched",
            "--rewatch-delay-secs",
            "1",
        ]);
        let config = ApproverConfig::try_from(cli).expect("config");
        assert_eq!(config.kube.host, "https://10.0.0.1:6443");
        assert_eq!(config.kube.token_file, PathBuf::from("/tmp/token"));
        assert!(!config.kube.insecure_skip_tls_verify);
        assert_eq!(
            config.policy.approve_signers(),
            ["kubernetes.io/kube-apiserver-client", "example.com/agent"]
        );
        assert!(config.policy.deny_unmatched());
        assert_eq!(config.rewatch_delay, Duration::from_secs(1));
        assert_eq!(config.watch_buffer, 64);
    }

    #[test]
    fn requires_a_signer() {
        let cli = parse(&["--kube-host", "https://localhost:6443"]);
        let err = ApproverConfig::try_from(cli).expect_err("missing signer");
        assert!(err.to_string().contains("--approve-signer"));
    }

    #[test]
    fn rejects_zero_buffer() {
        let cli = parse(&[
            "--kube-host",
            "https://localhost:6443",
            "--approve-signer",
            "example.com/agent",
            "--watch-buffer",
            "0",
        ]);
        assert!(ApproverConfig::try_from(cli).is_err());
    }
}
