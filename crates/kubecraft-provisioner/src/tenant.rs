//! Tenant onboarding and offboarding
//!
//! Registration creates, in order: the tenant namespace, its identity, the
//! role and binding that confine it, the namespace quota, the entry on the
//! authorization list, and finally a long-lived credential. Steps are not
//! rolled back on failure. A partially provisioned namespace blocks a retry of
//! the same name at the namespace-exists check.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info, instrument};

use kubecraft_common::error::is_not_found;
use kubecraft_common::validation::validate_tenant_name;
use kubecraft_common::{Error, ProvisionerConfig, Result, TENANT_LABEL_SELECTOR};

use crate::authz_list::AuthorizationList;
use crate::kube_client::KubeClient;
use crate::manifests::{
    tenant_namespace, tenant_resource_quota, tenant_role, tenant_role_binding,
    tenant_service_account, tenant_subject,
};

/// Outcome of a successful registration
#[derive(Debug)]
pub struct Registration {
    /// The registered tenant name
    pub tenant: String,
    /// Namespace owned by the tenant
    pub namespace: String,
    /// Bearer credential of the tenant identity
    pub token: SecretString,
}

/// Onboards and offboards tenants
pub struct TenantProvisioner {
    client: Arc<dyn KubeClient>,
    config: Arc<ProvisionerConfig>,
    authz_list: AuthorizationList,
}

impl TenantProvisioner {
    /// Create a provisioner over the given substrate
    pub fn new(client: Arc<dyn KubeClient>, config: Arc<ProvisionerConfig>) -> Self {
        let authz_list = AuthorizationList::new(client.clone(), config.clone());
        Self {
            client,
            config,
            authz_list,
        }
    }

    /// The authorization list this provisioner maintains
    pub fn authorization_list(&self) -> &AuthorizationList {
        &self.authz_list
    }

    /// Register a tenant and issue its credential
    #[instrument(skip(self))]
    pub async fn register(&self, tenant: &str) -> Result<Registration> {
        validate_tenant_name(tenant, &self.config)?;

        let current = self
            .client
            .count_namespaces(TENANT_LABEL_SELECTOR)
            .await
            .map_err(|e| Error::substrate("count tenant namespaces", e))?;
        if current >= self.config.max_tenants {
            return Err(Error::QuotaExceeded {
                current,
                max: self.config.max_tenants,
            });
        }

        let namespace = self.config.namespace_for(tenant);
        let exists = self
            .client
            .namespace_exists(&namespace)
            .await
            .map_err(|e| Error::substrate("check tenant namespace", e))?;
        if exists {
            return Err(already_registered(tenant, &namespace));
        }

        self.client
            .create_namespace(&tenant_namespace(&namespace, tenant))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 409 => already_registered(tenant, &namespace),
                e => Error::substrate("create tenant namespace", e),
            })?;
        debug!(namespace = %namespace, "Namespace created");

        self.client
            .create_service_account(&namespace, &tenant_service_account(&namespace, tenant))
            .await
            .map_err(|e| Error::substrate("create tenant identity", e))?;
        self.client
            .create_role(&namespace, &tenant_role(&namespace, &self.config))
            .await
            .map_err(|e| Error::substrate("create tenant role", e))?;
        self.client
            .create_role_binding(
                &namespace,
                &tenant_role_binding(&namespace, tenant, &self.config),
            )
            .await
            .map_err(|e| Error::substrate("create tenant role binding", e))?;
        self.client
            .create_resource_quota(
                &namespace,
                &tenant_resource_quota(&namespace, tenant, &self.config),
            )
            .await
            .map_err(|e| Error::substrate("create tenant quota", e))?;
        debug!(namespace = %namespace, "Identity, policy and quota installed");

        self.authz_list
            .append(tenant_subject(&namespace, tenant))
            .await?;

        let token = self
            .client
            .create_token(&namespace, tenant, self.config.token_expiry_seconds())
            .await
            .map_err(|e| Error::substrate("issue tenant credential", e))?;
        if token.is_empty() {
            return Err(Error::malformed(
                "issue tenant credential",
                "server returned an empty token",
            ));
        }

        info!(namespace = %namespace, "Tenant registered");
        Ok(Registration {
            tenant: tenant.to_string(),
            namespace,
            token: SecretString::from(token),
        })
    }

    /// Remove a tenant's namespace and its authorization list entry
    ///
    /// Repeating a deregistration is a no-op.
    #[instrument(skip(self))]
    pub async fn deregister(&self, tenant: &str) -> Result<()> {
        validate_tenant_name(tenant, &self.config)?;
        let namespace = self.config.namespace_for(tenant);

        match self.client.delete_namespace(&namespace).await {
            Ok(()) => debug!(namespace = %namespace, "Namespace deletion requested"),
            Err(e) if is_not_found(&e) => {
                debug!(namespace = %namespace, "Namespace already absent")
            }
            Err(e) => return Err(Error::substrate("delete tenant namespace", e)),
        }

        self.authz_list.remove(tenant, &namespace).await?;
        info!(namespace = %namespace, "Tenant deregistered");
        Ok(())
    }
}

fn already_registered(tenant: &str, namespace: &str) -> Error {
    Error::conflict(
        format!("namespace {namespace}"),
        format!("tenant '{tenant}' is already registered"),
    )
}
