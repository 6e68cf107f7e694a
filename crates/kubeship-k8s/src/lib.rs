//! Kubernetes client for kubeship
//!
//! This crate resolves the pod behind a container log file by asking the API
//! server for its metadata, authenticating with the node's service-account
//! credentials.

mod credentials;
mod resolver;

pub use credentials::{CredentialCache, CredentialError};
pub use resolver::{
    DEFAULT_CA_CERT_FILE, DEFAULT_TOKEN_FILE, PodLookup, PodResolver, ResolveError, ResolverConfig,
};

// Re-export types that are used in our public API
pub use kubeship_types::{PodIdentity, PodRecord};
