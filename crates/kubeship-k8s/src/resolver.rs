//! Pod metadata lookup against the API server

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use thiserror::Error;
use tracing::debug;

use crate::credentials::{CredentialCache, CredentialError};
use kubeship_types::PodRecord;

/// Default service-account mount points inside a pod
pub const DEFAULT_CA_CERT_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
pub const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("no PEM certificate found in {}", .0.display())]
    NoCertificate(PathBuf),

    #[error("invalid CA certificate in {}: {message}", .path.display())]
    InvalidCertificate { path: PathBuf, message: String },

    #[error("token file {} is not valid UTF-8", .0.display())]
    InvalidToken(PathBuf),

    #[error("invalid API server URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },

    #[error("failed to build API client: {0}")]
    Client(#[source] kube::Error),

    #[error("pod lookup failed: {0}")]
    Api(#[source] kube::Error),

    #[error("pod lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Anything that can turn a pod name and namespace into a [`PodRecord`]
pub trait PodLookup: Send + Sync {
    fn resolve(
        &self,
        name: &str,
        namespace: &str,
    ) -> impl Future<Output = Result<PodRecord, ResolveError>> + Send;
}

/// Connection settings for the in-cluster API server
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    pub host: String,
    pub port: u16,
    pub ca_cert_file: PathBuf,
    pub token_file: PathBuf,
    /// Upper bound on a single pod lookup; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl ResolverConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ca_cert_file: PathBuf::from(DEFAULT_CA_CERT_FILE),
            token_file: PathBuf::from(DEFAULT_TOKEN_FILE),
            timeout: None,
        }
    }

    /// `https://host:port`, bracketing bare IPv6 hosts
    pub fn cluster_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("https://[{}]:{}", self.host, self.port)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }
}

/// Looks pods up through the API server using cached service-account credentials
pub struct PodResolver {
    config: ResolverConfig,
    credentials: Arc<CredentialCache>,
}

impl PodResolver {
    pub fn new(config: ResolverConfig, credentials: Arc<CredentialCache>) -> Self {
        Self {
            config,
            credentials,
        }
    }

    /// Build a client that trusts the cluster CA and sends the bearer token
    async fn client(&self) -> Result<kube::Client, ResolveError> {
        let ca = self.credentials.get(&self.config.ca_cert_file).await?;
        let token = self.credentials.get(&self.config.token_file).await?;

        let root_cert = parse_ca_bundle(&ca, &self.config.ca_cert_file)?;
        let token = std::str::from_utf8(&token)
            .map_err(|_| ResolveError::InvalidToken(self.config.token_file.clone()))?
            .trim()
            .to_string();

        let url = self.config.cluster_url();
        let cluster_url: http::Uri = url
            .parse()
            .map_err(|source| ResolveError::InvalidUrl { url, source })?;

        let mut config = kube::Config::new(cluster_url);
        config.root_cert = Some(root_cert);
        config.auth_info.token = Some(token.into());
        if let Some(timeout) = self.config.timeout {
            config.connect_timeout = Some(timeout);
            config.read_timeout = Some(timeout);
        }

        kube::Client::try_from(config).map_err(ResolveError::Client)
    }
}

impl PodLookup for PodResolver {
    async fn resolve(&self, name: &str, namespace: &str) -> Result<PodRecord, ResolveError> {
        let client = self.client().await?;
        let pods: Api<Pod> = Api::namespaced(client, namespace);

        debug!(pod = name, namespace, "looking up pod");
        let lookup = pods.get(name);
        let pod = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, lookup)
                .await
                .map_err(|_| ResolveError::Timeout(limit))?,
            None => lookup.await,
        }
        .map_err(ResolveError::Api)?;

        Ok(pod_to_record(pod, name, namespace))
    }
}

/// DER certificates from a PEM bundle
fn parse_ca_bundle(pem: &[u8], path: &Path) -> Result<Vec<Vec<u8>>, ResolveError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ResolveError::InvalidCertificate {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

    if certs.is_empty() {
        return Err(ResolveError::NoCertificate(path.to_path_buf()));
    }

    Ok(certs)
}

/// Convert a k8s Pod to the fields the shipper cares about
fn pod_to_record(pod: Pod, name: &str, namespace: &str) -> PodRecord {
    let mut record = PodRecord::new(
        pod.metadata.name.unwrap_or_else(|| name.to_string()),
        pod.metadata
            .namespace
            .unwrap_or_else(|| namespace.to_string()),
    );

    record.node_name = pod.spec.and_then(|spec| spec.node_name);
    record.annotations = pod.metadata.annotations.unwrap_or_default();
    record.labels = pod.metadata.labels.unwrap_or_default();

    record
}
