//! Substrate client abstraction
//!
//! Every orchestration call the provisioner makes goes through [`KubeClient`],
//! so components can be tested against mocks and an in-memory fake. Methods
//! return raw `kube::Error`s; components translate them into domain errors
//! with the context only they know.

use std::future::Future;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolumeClaim, Pod, ResourceQuota, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use kubecraft_common::error::is_transient;
use kubecraft_common::retry::{retry_with_backoff, RetryConfig};
use kubecraft_common::{ProvisionerConfig, FIELD_MANAGER};

/// Field selector matching pods in the Running phase
pub const RUNNING_PHASE_SELECTOR: &str = "status.phase=Running";

/// Trait abstracting the Kubernetes operations kubecraft needs
///
/// Getters return `Ok(None)` for absent objects. Deletes and creates surface
/// the API status unchanged (404 for a missing target, 409 for an existing
/// one) so callers decide what absence or collision means.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Check whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, kube::Error>;

    /// Count namespaces matching a label selector
    async fn count_namespaces(&self, label_selector: &str) -> Result<usize, kube::Error>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), kube::Error>;

    /// Delete a namespace and, by cascade, everything in it
    async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error>;

    /// Create a ServiceAccount
    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), kube::Error>;

    /// Create a Role
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), kube::Error>;

    /// Create a RoleBinding
    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), kube::Error>;

    /// Create a ResourceQuota
    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &ResourceQuota,
    ) -> Result<(), kube::Error>;

    /// Get a ClusterRoleBinding
    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, kube::Error>;

    /// Replace a ClusterRoleBinding
    ///
    /// The object's `resourceVersion` is sent with the update, so a write
    /// based on a stale read fails with 409.
    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, kube::Error>;

    /// Issue a bearer token for a ServiceAccount
    ///
    /// Returns an empty string if the server answered without a token.
    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<String, kube::Error>;

    /// List Services matching a label selector in every namespace
    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>, kube::Error>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, kube::Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), kube::Error>;

    /// Delete a Service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Get a StatefulSet
    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, kube::Error>;

    /// List every StatefulSet in a namespace
    async fn list_stateful_sets(&self, namespace: &str) -> Result<Vec<StatefulSet>, kube::Error>;

    /// Create a StatefulSet
    async fn create_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), kube::Error>;

    /// Set the desired replica count of a StatefulSet
    async fn scale_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), kube::Error>;

    /// Delete a StatefulSet
    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Check whether a PersistentVolumeClaim exists
    async fn pvc_exists(&self, namespace: &str, name: &str) -> Result<bool, kube::Error>;

    /// Delete a PersistentVolumeClaim
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// List Running pods matching a label selector in every namespace
    async fn list_running_pods(&self, label_selector: &str) -> Result<Vec<Pod>, kube::Error>;

    /// Get a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error>;
}

/// Real Kubernetes client implementation
///
/// Each call is retried with backoff when it fails transiently.
pub struct KubeClientImpl {
    client: Client,
    retry: RetryConfig,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client, config: &ProvisionerConfig) -> Self {
        Self {
            client,
            retry: RetryConfig::with_max_attempts(config.substrate_retry_attempts),
        }
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, kube::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, kube::Error>>,
    {
        retry_with_backoff(&self.retry, operation, is_transient, f).await
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn namespace_exists(&self, name: &str) -> Result<bool, kube::Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        self.call("get namespace", || async { api.get_opt(name).await })
            .await
            .map(|ns| ns.is_some())
    }

    async fn count_namespaces(&self, label_selector: &str) -> Result<usize, kube::Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .call("list namespaces", || async { api.list_metadata(&lp).await })
            .await?;
        Ok(list.items.len())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), kube::Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        self.call("create namespace", || async {
            api.create(&PostParams::default(), namespace).await
        })
        .await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        self.call("delete namespace", || async {
            api.delete(name, &DeleteParams::default()).await
        })
        .await?;
        Ok(())
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), kube::Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        self.call("create service account", || async {
            api.create(&PostParams::default(), service_account).await
        })
        .await?;
        Ok(())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), kube::Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        self.call("create role", || async {
            api.create(&PostParams::default(), role).await
        })
        .await?;
        Ok(())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), kube::Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        self.call("create role binding", || async {
            api.create(&PostParams::default(), binding).await
        })
        .await?;
        Ok(())
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &ResourceQuota,
    ) -> Result<(), kube::Error> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        self.call("create resource quota", || async {
            api.create(&PostParams::default(), quota).await
        })
        .await?;
        Ok(())
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, kube::Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        self.call("get cluster role binding", || async {
            api.get_opt(name).await
        })
        .await
    }

    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, kube::Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.call("replace cluster role binding", || async {
            api.replace(&name, &PostParams::default(), binding).await
        })
        .await
    }

    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<String, kube::Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let token_request = TokenRequest {
            metadata: Default::default(),
            spec: TokenRequestSpec {
                audiences: vec![],
                expiration_seconds: Some(expiration_seconds),
                bound_object_ref: None,
            },
            status: None,
        };
        let result = self
            .call("create token", || async {
                api.create_token_request(service_account, &PostParams::default(), &token_request)
                    .await
            })
            .await?;
        Ok(result.status.map(|s| s.token).unwrap_or_default())
    }

    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>, kube::Error> {
        let api: Api<Service> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .call("list services", || async { api.list(&lp).await })
            .await?;
        Ok(list.items)
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.call("get service", || async { api.get_opt(name).await })
            .await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.call("create service", || async {
            api.create(&PostParams::default(), service).await
        })
        .await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.call("delete service", || async {
            api.delete(name, &DeleteParams::default()).await
        })
        .await?;
        Ok(())
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, kube::Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        self.call("get stateful set", || async { api.get_opt(name).await })
            .await
    }

    async fn list_stateful_sets(&self, namespace: &str) -> Result<Vec<StatefulSet>, kube::Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default();
        let list = self
            .call("list stateful sets", || async { api.list(&lp).await })
            .await?;
        Ok(list.items)
    }

    async fn create_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), kube::Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        self.call("create stateful set", || async {
            api.create(&PostParams::default(), stateful_set).await
        })
        .await?;
        Ok(())
    }

    async fn scale_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), kube::Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "replicas": replicas }
        });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.call("scale stateful set", || async {
            api.patch(name, &params, &Patch::Merge(&patch)).await
        })
        .await?;
        Ok(())
    }

    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        self.call("delete stateful set", || async {
            api.delete(name, &DeleteParams::default()).await
        })
        .await?;
        Ok(())
    }

    async fn pvc_exists(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        self.call("get persistent volume claim", || async { api.get_opt(name).await })
            .await
            .map(|pvc| pvc.is_some())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        self.call("delete persistent volume claim", || async {
            api.delete(name, &DeleteParams::default()).await
        })
        .await?;
        Ok(())
    }

    async fn list_running_pods(&self, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default()
            .labels(label_selector)
            .fields(RUNNING_PHASE_SELECTOR);
        let list = self
            .call("list running pods", || async { api.list(&lp).await })
            .await?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.call("get pod", || async { api.get_opt(name).await })
            .await
    }
}
