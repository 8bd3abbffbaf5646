//! Namespace-scoped secret lookups for autodiscovered workloads.
//!
//! Discovery events may reference secrets as
//! `kubernetes.<namespace>.<secret>.<field>`. The registry hands out one
//! keystore per namespace, and each keystore only resolves references
//! bound to its own namespace, so a workload cannot read secrets across
//! namespace boundaries.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::mapping::{self, Mapping};

/// Secret payload: field name to raw bytes.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Errors surfaced by [`NamespaceKeystore::retrieve`].
#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("invalid secret key format: {0} (expected kubernetes.<namespace>.<secret>.<field>)")]
    MalformedKey(String),
    #[error("secret key {key} is bound to namespace {key_namespace}, keystore serves {namespace}")]
    NamespaceMismatch {
        key: String,
        key_namespace: String,
        namespace: String,
    },
    #[error("secret {name} not found in namespace {namespace}")]
    SecretNotFound { namespace: String, name: String },
    #[error("field {field} not present in secret {name}")]
    MissingField { name: String, field: String },
    #[error("failed to fetch secret: {0}")]
    Client(anyhow::Error),
}

/// A secret value whose bytes never appear in debug output.
pub struct SecureValue(Vec<u8>);

impl SecureValue {
    /// The raw secret bytes.
    pub fn get(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureValue(<redacted>)")
    }
}

/// Fetches secret payloads. The API-backed implementation talks to the
/// cluster; tests substitute an in-memory map.
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    async fn secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<SecretData>>;
}

/// [`SecretFetcher`] over the Kubernetes API.
pub struct ApiSecretFetcher {
    client: Client,
}

impl ApiSecretFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretFetcher for ApiSecretFetcher {
    async fn secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?;
        Ok(secret.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(field, bytes)| (field, bytes.0))
                .collect()
        }))
    }
}

/// Resolves secret references bound to a single namespace.
pub struct NamespaceKeystore {
    namespace: String,
    fetcher: Arc<dyn SecretFetcher>,
}

impl NamespaceKeystore {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolve `kubernetes.<namespace>.<secret>.<field>` to the secret
    /// bytes. The field may itself contain dots (`tls.crt`).
    pub async fn retrieve(&self, key: &str) -> Result<SecureValue, KeystoreError> {
        let tokens: Vec<&str> = key.splitn(4, '.').collect();
        if tokens.len() < 4 || tokens[0] != "kubernetes" {
            return Err(KeystoreError::MalformedKey(key.to_string()));
        }
        let (namespace, name, field) = (tokens[1], tokens[2], tokens[3]);
        if namespace != self.namespace {
            return Err(KeystoreError::NamespaceMismatch {
                key: key.to_string(),
                key_namespace: namespace.to_string(),
                namespace: self.namespace.clone(),
            });
        }

        let data = self
            .fetcher
            .secret(namespace, name)
            .await
            .map_err(KeystoreError::Client)?
            .ok_or_else(|| KeystoreError::SecretNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        match data.get(field) {
            Some(bytes) => Ok(SecureValue(bytes.clone())),
            None => Err(KeystoreError::MissingField {
                name: name.to_string(),
                field: field.to_string(),
            }),
        }
    }
}

/// Lazily creates and memoizes one keystore per namespace.
pub struct KeystoreRegistry {
    fetcher: Arc<dyn SecretFetcher>,
    keystores: Mutex<HashMap<String, Arc<NamespaceKeystore>>>,
}

impl KeystoreRegistry {
    pub fn new(fetcher: Arc<dyn SecretFetcher>) -> Self {
        Self {
            fetcher,
            keystores: Mutex::new(HashMap::new()),
        }
    }

    /// The keystore for the namespace named by `kubernetes.namespace` in
    /// the event, constructing it on first use. Returns `None` when the
    /// event carries no namespace.
    pub fn keystore_for(&self, event: &Mapping) -> Option<Arc<NamespaceKeystore>> {
        let namespace = match mapping::get(event, "kubernetes.namespace") {
            Some(serde_json::Value::String(namespace)) => namespace.clone(),
            _ => {
                tracing::debug!("event carries no kubernetes.namespace, no keystore to serve");
                return None;
            }
        };

        let mut keystores = self.keystores.lock().unwrap();
        let keystore = keystores.entry(namespace.clone()).or_insert_with(|| {
            Arc::new(NamespaceKeystore {
                namespace,
                fetcher: Arc::clone(&self.fetcher),
            })
        });
        Some(Arc::clone(keystore))
    }
}
