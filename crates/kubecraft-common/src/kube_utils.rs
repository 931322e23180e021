//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction for the two identities kubecraft acts as (the
//! administrator that provisions tenants, and a tenant confined to its own
//! namespace), plus condition checks and bounded readiness polling.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodCondition};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use secrecy::SecretString;
use tracing::{debug, trace};

use crate::error::is_transient;
use crate::{Error, ProvisionerConfig};

/// Condition status value meaning "true"
pub const STATUS_TRUE: &str = "True";

/// Pod condition type signalling readiness
pub const CONDITION_READY: &str = "Ready";

/// Check whether a list of conditions contains one of the given type with status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Whether a pod reports the Ready condition
pub fn is_pod_ready(pod: &Pod) -> bool {
    has_condition(
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref()),
        CONDITION_READY,
    )
}

/// Poll `check_fn` up to `attempts` times, `interval` apart
///
/// Returns `Ok(())` on the first `Ok(true)`. A substrate error that is not
/// transient (forbidden, unauthorized, invalid) is returned at once; any
/// other check error is treated as "not yet" and polling continues. No sleep
/// follows the final attempt, so the call returns promptly once the bound is
/// reached.
pub async fn poll_attempts<F, Fut>(
    attempts: u32,
    interval: Duration,
    what: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let what = what.into();
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match check_fn().await {
            Ok(true) => {
                debug!(what = %what, attempt, "Condition met");
                return Ok(());
            }
            Ok(false) => trace!(what = %what, attempt, "Condition not yet met"),
            Err(e) if is_definitive(&e) => {
                debug!(what = %what, attempt, error = %e, "Polling check failed definitively");
                return Err(e);
            }
            Err(e) => debug!(what = %what, attempt, error = %e, "Polling check failed, retrying"),
        }

        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(Error::Timeout { what, attempts })
}

fn is_definitive(err: &Error) -> bool {
    matches!(err, Error::Substrate { source, .. } if !is_transient(source))
}

/// Create the administrator client from an optional kubeconfig path
///
/// Without a path the configuration is inferred (in-cluster service account,
/// then `KUBECONFIG`/`~/.kube/config`).
pub async fn create_client(
    kubeconfig: Option<&Path>,
    config: &ProvisionerConfig,
) -> Result<Client, Error> {
    create_client_with_timeout(
        kubeconfig,
        config.substrate_connect_timeout,
        config.substrate_read_timeout,
    )
    .await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut kube_config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::validation(
                    "kubeconfig",
                    format!("failed to read {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::validation("kubeconfig", format!("failed to load: {}", e))
                })?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::substrate("infer client config", kube::Error::InferConfig(e)))?,
    };
    kube_config.connect_timeout = Some(connect_timeout);
    kube_config.read_timeout = Some(read_timeout);
    Client::try_from(kube_config).map_err(|e| Error::substrate("create client", e))
}

/// Connection settings for a tenant-scoped client
#[derive(Clone, Debug, Default)]
pub struct TenantEndpoint {
    /// API server URL (e.g. "https://10.0.0.5:6443")
    pub server: String,
    /// DER-encoded cluster CA certificate, if not publicly trusted
    pub ca_der: Option<Vec<u8>>,
    /// Skip server certificate verification
    pub accept_invalid_certs: bool,
}

/// Build the client configuration for a tenant identity
///
/// The resulting configuration authenticates with the tenant's bearer token
/// and defaults every namespaced call to the tenant's namespace.
pub fn tenant_config(
    endpoint: &TenantEndpoint,
    token: SecretString,
    namespace: &str,
    config: &ProvisionerConfig,
) -> Result<Config, Error> {
    let uri: http::Uri = endpoint.server.parse().map_err(|e| {
        Error::validation(
            "cluster endpoint",
            format!("'{}' is not a valid URL: {}", endpoint.server, e),
        )
    })?;

    let mut kube_config = Config::new(uri);
    kube_config.default_namespace = namespace.to_string();
    kube_config.auth_info.token = Some(token);
    kube_config.root_cert = endpoint.ca_der.clone().map(|ca| vec![ca]);
    kube_config.accept_invalid_certs = endpoint.accept_invalid_certs;
    kube_config.connect_timeout = Some(config.substrate_connect_timeout);
    kube_config.read_timeout = Some(config.substrate_read_timeout);
    Ok(kube_config)
}

/// Create a client that acts as a tenant within its own namespace
pub fn create_tenant_client(
    endpoint: &TenantEndpoint,
    token: SecretString,
    namespace: &str,
    config: &ProvisionerConfig,
) -> Result<Client, Error> {
    let kube_config = tenant_config(endpoint, token, namespace, config)?;
    Client::try_from(kube_config).map_err(|e| Error::substrate("create tenant client", e))
}
