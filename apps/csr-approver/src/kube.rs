//! Kubernetes REST implementation of the request store.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use csr_core::{RawEvent, RequestStore, SigningRequest, StoreError, Subscription};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const CSR_COLLECTION_PATH: &str = "/apis/certificates.k8s.io/v1/certificatesigningrequests";
/// Longest watch line accepted before the stream is failed.
const MAX_WATCH_LINE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub host: String,
    pub token_file: PathBuf,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("failed to read token file {path}: {source}")]
    Token {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Client for the `certificates.k8s.io/v1` signing request API.
#[derive(Clone)]
pub struct KubeClient {
    http: Client,
    base_url: String,
    token: String,
}

impl KubeClient {
    /// Read the bearer token and build a TLS client for `config.host`.
    pub async fn connect(config: &KubeConfig) -> Result<Self, KubeError> {
        let token = tokio::fs::read_to_string(&config.token_file)
            .await
            .map_err(|source| KubeError::Token {
                path: config.token_file.clone(),
                source,
            })?;

        let mut builder = Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);
        if let Some(path) = &config.ca_file {
            let pem = tokio::fs::read(path)
                .await
                .map_err(|source| KubeError::CaBundle {
                    path: path.clone(),
                    source,
                })?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        Ok(Self::with_client(builder.build()?, &config.host, token.trim()))
    }

    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.base_url, CSR_COLLECTION_PATH)
    }

    fn approval_url(&self, name: &str) -> String {
        format!("{}{}/{}/approval", self.base_url, CSR_COLLECTION_PATH, name)
    }
}

#[async_trait]
impl RequestStore for KubeClient {
    async fn watch_signing_requests(&self) -> Result<Subscription, StoreError> {
        let res = self
            .http
            .get(self.collection_url())
            .query(&[("watch", "true")])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        debug!(target = "csr.kube", status = %res.status(), "watch established");

        let body = res.bytes_stream().map(|chunk| chunk.map_err(transport)).boxed();
        Ok(Subscription::new(watch_lines(body, MAX_WATCH_LINE)))
    }

    async fn submit_approval_update(
        &self,
        name: &str,
        request: &SigningRequest,
    ) -> Result<SigningRequest, StoreError> {
        let res = self
            .http
            .put(self.approval_url(name))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        let status = res.status();
        if status == StatusCode::CONFLICT {
            return Err(StoreError::Conflict {
                name: name.to_string(),
                message: status_message(res).await,
            });
        }
        if !status.is_success() {
            return Err(api_error(res).await);
        }
        res.json::<SigningRequest>()
            .await
            .map_err(|err| StoreError::Decode(err.to_string()))
    }
}

fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

async fn api_error(res: Response) -> StoreError {
    let status = res.status().as_u16();
    StoreError::Api {
        status,
        message: status_message(res).await,
    }
}

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

/// `message` of a `Status` response body, or the raw body.
async fn status_message(res: Response) -> String {
    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiStatus>(&body) {
        Ok(status) if !status.message.is_empty() => status.message,
        _ => body,
    }
}

struct LineState {
    body: Option<BoxStream<'static, Result<Bytes, StoreError>>>,
    buf: BytesMut,
    max_line: usize,
}

impl LineState {
    fn overflow(&mut self) -> StoreError {
        self.body = None;
        self.buf.clear();
        StoreError::Decode(format!(
            "watch line exceeds {} bytes",
            self.max_line
        ))
    }
}

/// Split a newline-delimited watch body into raw events. A body error, or a
/// line longer than `max_line`, is yielded once and ends the stream.
fn watch_lines(
    body: BoxStream<'static, Result<Bytes, StoreError>>,
    max_line: usize,
) -> impl Stream<Item = Result<RawEvent, StoreError>> + Send + 'static {
    let state = LineState {
        body: Some(body),
        buf: BytesMut::new(),
        max_line,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                if pos > state.max_line {
                    let err = state.overflow();
                    return Some((Err(err), state));
                }
                let line = state.buf.split_to(pos + 1);
                let line = line[..pos].trim_ascii();
                if line.is_empty() {
                    continue;
                }
                let event = RawEvent::decode_line(line);
                return Some((Ok(event), state));
            }

            if state.buf.len() > state.max_line {
                let err = state.overflow();
                return Some((Err(err), state));
            }

            let Some(body) = state.body.as_mut() else {
                let rest = state.buf.split();
                let rest = rest.trim_ascii();
                if rest.is_empty() {
                    return None;
                }
                let event = RawEvent::decode_line(rest);
                return Some((Ok(event), state));
            };

            match body.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    state.body = None;
                    state.buf.clear();
                    return Some((Err(err), state));
                }
                None => state.body = None,
            }
        }
    })
}
