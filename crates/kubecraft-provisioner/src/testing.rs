//! In-memory substrate for component tests
//!
//! [`FakeKube`] keeps typed objects in maps and reproduces the API server
//! behaviour the provisioner depends on: 404/409 statuses, resourceVersion
//! checks on replace, NodePort allocation conflicts, cascading namespace
//! deletion, and a StatefulSet controller that materialises the claim and the
//! single pod.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Namespace, Pod, PodCondition, PodSpec, PodStatus, ResourceQuota, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::ErrorResponse;

use kubecraft_common::ProvisionerConfig;

use crate::kube_client::KubeClient;
use crate::manifests::{workload_claim_name, workload_pod_name, RBAC_API_GROUP};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Build a kube API error with the given status code
pub fn api_error(code: u16, message: &str) -> kube::Error {
    let reason = match code {
        404 => "NotFound",
        409 => "Conflict",
        422 => "Invalid",
        403 => "Forbidden",
        _ => "InternalError",
    };
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}

fn not_found(kind: &str, name: &str) -> kube::Error {
    api_error(404, &format!("{kind} \"{name}\" not found"))
}

fn already_exists(kind: &str, name: &str) -> kube::Error {
    api_error(409, &format!("{kind} \"{name}\" already exists"))
}

/// An authorization list object as an administrator would install it
pub fn authz_list_binding(name: &str, subjects: Vec<Subject>) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: "kubecraft-capacity-checker".to_string(),
        },
        subjects: Some(subjects),
    }
}

/// Whether `labels` satisfy an equality-based selector such as "a=b,c=d"
pub fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).map(String::as_str) == Some(v),
            None => false,
        })
}

fn running_pod(
    namespace: &str,
    name: &str,
    labels: BTreeMap<String, String>,
    spec: PodSpec,
    ready: bool,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(spec),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    roles: BTreeMap<Key, Role>,
    role_bindings: BTreeMap<Key, RoleBinding>,
    quotas: BTreeMap<Key, ResourceQuota>,
    cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    services: BTreeMap<Key, Service>,
    stateful_sets: BTreeMap<Key, StatefulSet>,
    claims: BTreeSet<Key>,
    pods: BTreeMap<Key, Pod>,
    tokens_issued: u32,
    authz_writes: u32,
    pods_become_ready: bool,
    failures: BTreeMap<&'static str, u16>,
    calls: Vec<String>,
}

impl State {
    fn take_failure(&mut self, op: &'static str) -> Result<(), kube::Error> {
        match self.failures.remove(op) {
            Some(code) => Err(api_error(code, &format!("injected failure for {op}"))),
            None => Ok(()),
        }
    }

    fn reconcile_pod(&mut self, namespace: &str, name: &str) {
        let Some(sts) = self.stateful_sets.get(&key(namespace, name)) else {
            self.pods.remove(&key(namespace, &workload_pod_name(name)));
            return;
        };
        let spec = sts.spec.clone().unwrap_or_default();
        let pod_key = key(namespace, &workload_pod_name(name));
        if spec.replicas.unwrap_or(1) > 0 {
            let template = spec.template;
            let labels = template
                .metadata
                .and_then(|m| m.labels)
                .unwrap_or_default();
            let pod = running_pod(
                namespace,
                &pod_key.1,
                labels,
                template.spec.unwrap_or_default(),
                self.pods_become_ready,
            );
            self.pods.insert(pod_key, pod);
        } else {
            self.pods.remove(&pod_key);
        }
    }
}

/// In-memory `KubeClient`
pub struct FakeKube {
    state: Mutex<State>,
}

impl Default for FakeKube {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKube {
    /// Empty cluster whose workload pods become ready
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pods_become_ready: true,
                ..Default::default()
            }),
        }
    }

    /// Cluster with an empty authorization list installed
    pub fn with_authz_list(config: &ProvisionerConfig) -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().cluster_role_bindings.insert(
            config.authz_list_name.clone(),
            authz_list_binding(&config.authz_list_name, vec![]),
        );
        fake
    }

    /// Make the next call of `op` fail with `code`
    pub fn fail_next(&self, op: &'static str, code: u16) {
        self.state.lock().unwrap().failures.insert(op, code);
    }

    /// Control whether workload pods report Ready
    pub fn set_pods_ready(&self, ready: bool) {
        self.state.lock().unwrap().pods_become_ready = ready;
    }

    /// Add an unrelated running pod
    pub fn add_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        let k = key(
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default(),
        );
        state.pods.insert(k, pod);
    }

    /// Insert a Service directly, bypassing NodePort admission
    pub fn add_service(&self, service: Service) {
        let mut state = self.state.lock().unwrap();
        let k = key(
            service.metadata.namespace.as_deref().unwrap_or_default(),
            service.metadata.name.as_deref().unwrap_or_default(),
        );
        state.services.insert(k, service);
    }

    /// Names of existing namespaces
    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().unwrap().namespaces.keys().cloned().collect()
    }

    /// Whether a namespaced object of the given kind exists
    pub fn has(&self, kind: &str, namespace: &str, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        let k = key(namespace, name);
        match kind {
            "ServiceAccount" => state.service_accounts.contains_key(&k),
            "Role" => state.roles.contains_key(&k),
            "RoleBinding" => state.role_bindings.contains_key(&k),
            "ResourceQuota" => state.quotas.contains_key(&k),
            "Service" => state.services.contains_key(&k),
            "StatefulSet" => state.stateful_sets.contains_key(&k),
            "PersistentVolumeClaim" => state.claims.contains(&k),
            "Pod" => state.pods.contains_key(&k),
            _ => false,
        }
    }

    /// Subjects of the authorization list, if installed
    pub fn authz_subjects(&self, name: &str) -> Option<Vec<Subject>> {
        self.state
            .lock()
            .unwrap()
            .cluster_role_bindings
            .get(name)
            .map(|b| b.subjects.clone().unwrap_or_default())
    }

    /// Number of successful authorization list replaces
    pub fn authz_writes(&self) -> u32 {
        self.state.lock().unwrap().authz_writes
    }

    /// Number of issued tokens
    pub fn tokens_issued(&self) -> u32 {
        self.state.lock().unwrap().tokens_issued
    }

    /// Mutating calls in the order they were made
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn namespace_exists(&self, name: &str) -> Result<bool, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("namespace_exists")?;
        Ok(state.namespaces.contains_key(name))
    }

    async fn count_namespaces(&self, label_selector: &str) -> Result<usize, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("count_namespaces")?;
        Ok(state
            .namespaces
            .values()
            .filter(|ns| matches_selector(ns.metadata.labels.as_ref(), label_selector))
            .count())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("create_namespace")?;
        let name = namespace.metadata.name.clone().unwrap_or_default();
        if state.namespaces.contains_key(&name) {
            return Err(already_exists("namespaces", &name));
        }
        state.calls.push(format!("create namespace {name}"));
        state.namespaces.insert(name, namespace.clone());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("delete_namespace")?;
        if state.namespaces.remove(name).is_none() {
            return Err(not_found("namespaces", name));
        }
        state.calls.push(format!("delete namespace {name}"));
        state.service_accounts.retain(|k, _| k.0 != name);
        state.roles.retain(|k, _| k.0 != name);
        state.role_bindings.retain(|k, _| k.0 != name);
        state.quotas.retain(|k, _| k.0 != name);
        state.services.retain(|k, _| k.0 != name);
        state.stateful_sets.retain(|k, _| k.0 != name);
        state.claims.retain(|k| k.0 != name);
        state.pods.retain(|k, _| k.0 != name);
        Ok(())
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("create_service_account")?;
        let name = service_account.metadata.name.clone().unwrap_or_default();
        if !state.namespaces.contains_key(namespace) {
            return Err(not_found("namespaces", namespace));
        }
        state.calls.push(format!("create serviceaccount {name}"));
        state
            .service_accounts
            .insert(key(namespace, &name), service_account.clone());
        Ok(())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("create_role")?;
        let name = role.metadata.name.clone().unwrap_or_default();
        state.calls.push(format!("create role {name}"));
        state.roles.insert(key(namespace, &name), role.clone());
        Ok(())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("create_role_binding")?;
        let name = binding.metadata.name.clone().unwrap_or_default();
        state.calls.push(format!("create rolebinding {name}"));
        state
            .role_bindings
            .insert(key(namespace, &name), binding.clone());
        Ok(())
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &ResourceQuota,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("create_resource_quota")?;
        let name = quota.metadata.name.clone().unwrap_or_default();
        state.calls.push(format!("create resourcequota {name}"));
        state.quotas.insert(key(namespace, &name), quota.clone());
        Ok(())
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("get_cluster_role_binding")?;
        Ok(state.cluster_role_bindings.get(name).cloned())
    }

    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("replace_cluster_role_binding")?;
        let name = binding.metadata.name.clone().unwrap_or_default();
        let current = state
            .cluster_role_bindings
            .get(&name)
            .ok_or_else(|| not_found("clusterrolebindings", &name))?;

        let current_version = current.metadata.resource_version.clone().unwrap_or_default();
        if binding.metadata.resource_version.as_deref() != Some(current_version.as_str()) {
            return Err(api_error(
                409,
                "the object has been modified; please apply your changes to the latest version and try again",
            ));
        }

        let next_version = current_version.parse::<u64>().unwrap_or(0) + 1;
        let mut stored = binding.clone();
        stored.metadata.resource_version = Some(next_version.to_string());
        state.cluster_role_bindings.insert(name, stored.clone());
        state.authz_writes += 1;
        state.calls.push("replace authorization list".to_string());
        Ok(stored)
    }

    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        expiration_seconds: i64,
    ) -> Result<String, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("create_token")?;
        if !state
            .service_accounts
            .contains_key(&key(namespace, service_account))
        {
            return Err(not_found("serviceaccounts", service_account));
        }
        state.tokens_issued += 1;
        state.calls.push(format!("create token {service_account}"));
        Ok(format!(
            "token-{namespace}-{service_account}-{expiration_seconds}"
        ))
    }

    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("list_services")?;
        Ok(state
            .services
            .values()
            .filter(|s| matches_selector(s.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("get_service")?;
        Ok(state.services.get(&key(namespace, name)).cloned())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("create_service")?;
        let name = service.metadata.name.clone().unwrap_or_default();
        if state.services.contains_key(&key(namespace, &name)) {
            return Err(already_exists("services", &name));
        }

        let requested: Vec<i32> = crate::ports::assigned_node_ports(service).collect();
        let allocated: BTreeSet<i32> = state
            .services
            .values()
            .flat_map(crate::ports::assigned_node_ports)
            .collect();
        if let Some(port) = requested.iter().find(|p| allocated.contains(*p)) {
            return Err(api_error(
                422,
                &format!(
                    "Service \"{name}\" is invalid: spec.ports[0].nodePort: Invalid value: {port}: provided port is already allocated"
                ),
            ));
        }

        state.calls.push(format!("create service {name}"));
        state
            .services
            .insert(key(namespace, &name), service.clone());
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("delete_service")?;
        state
            .services
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("services", name))?;
        state.calls.push(format!("delete service {name}"));
        Ok(())
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("get_stateful_set")?;
        Ok(state.stateful_sets.get(&key(namespace, name)).cloned())
    }

    async fn list_stateful_sets(&self, namespace: &str) -> Result<Vec<StatefulSet>, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("list_stateful_sets")?;
        Ok(state
            .stateful_sets
            .iter()
            .filter(|(k, _)| k.0 == namespace)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn create_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("create_stateful_set")?;
        let name = stateful_set.metadata.name.clone().unwrap_or_default();
        if state.stateful_sets.contains_key(&key(namespace, &name)) {
            return Err(already_exists("statefulsets.apps", &name));
        }

        let mut stored = stateful_set.clone();
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        state.calls.push(format!("create statefulset {name}"));
        state.stateful_sets.insert(key(namespace, &name), stored);
        state
            .claims
            .insert(key(namespace, &workload_claim_name(&name)));
        state.reconcile_pod(namespace, &name);
        Ok(())
    }

    async fn scale_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("scale_stateful_set")?;
        let sts = state
            .stateful_sets
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("statefulsets.apps", name))?;
        if let Some(spec) = sts.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        state.calls.push(format!("scale statefulset {name} {replicas}"));
        state.reconcile_pod(namespace, name);
        Ok(())
    }

    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("delete_stateful_set")?;
        state
            .stateful_sets
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("statefulsets.apps", name))?;
        state.calls.push(format!("delete statefulset {name}"));
        state.reconcile_pod(namespace, name);
        Ok(())
    }

    async fn pvc_exists(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("pvc_exists")?;
        Ok(state.claims.contains(&key(namespace, name)))
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("delete_pvc")?;
        if !state.claims.remove(&key(namespace, name)) {
            return Err(not_found("persistentvolumeclaims", name));
        }
        state.calls.push(format!("delete pvc {name}"));
        Ok(())
    }

    async fn list_running_pods(&self, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("list_running_pods")?;
        Ok(state
            .pods
            .values()
            .filter(|p| matches_selector(p.metadata.labels.as_ref(), label_selector))
            .filter(|p| {
                p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("get_pod")?;
        Ok(state.pods.get(&key(namespace, name)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifests::workload_service;

    #[test]
    fn selector_matching() {
        let labels = BTreeMap::from([
            ("app".to_string(), "kubecraft".to_string()),
            ("user".to_string(), "alice".to_string()),
        ]);
        assert!(matches_selector(Some(&labels), "app=kubecraft"));
        assert!(matches_selector(Some(&labels), "app=kubecraft,user=alice"));
        assert!(!matches_selector(Some(&labels), "app=kubecraft-server"));
        assert!(!matches_selector(None, "app=kubecraft"));
    }

    #[tokio::test]
    async fn node_port_collision_is_rejected() {
        let fake = FakeKube::new();
        let config = ProvisionerConfig::default();
        fake.create_service("mc-a", &workload_service("mc-a", "a", "s1", 30000, &config))
            .await
            .unwrap();
        let err = fake
            .create_service("mc-b", &workload_service("mc-b", "b", "s1", 30000, &config))
            .await
            .unwrap_err();
        assert!(kubecraft_common::error::is_conflict(&err));
    }

    #[tokio::test]
    async fn stale_replace_is_rejected() {
        let config = ProvisionerConfig::default();
        let fake = FakeKube::with_authz_list(&config);
        let first = fake
            .get_cluster_role_binding(&config.authz_list_name)
            .await
            .unwrap()
            .unwrap();
        fake.replace_cluster_role_binding(&first).await.unwrap();
        let err = fake.replace_cluster_role_binding(&first).await.unwrap_err();
        assert!(matches!(err, kube::Error::Api(ae) if ae.code == 409));
    }
}
