//! Workload lifecycle
//!
//! A tenant runs workloads made of three objects sharing one name: a NodePort
//! Service, a StatefulSet scaled between zero and one replica, and the storage
//! claim the StatefulSet's volume template produces. State per workload:
//!
//! ```text
//! Absent --create--> Running <--start/stop--> Stopped
//!    ^                  |                        |
//!    +------delete------+------------------------+
//! ```
//!
//! Status is derived from the desired replica count only, never from pod health.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, error, info, instrument, warn};

use kubecraft_common::error::{is_conflict, is_not_found};
use kubecraft_common::kube_utils::{is_pod_ready, poll_attempts};
use kubecraft_common::validation::validate_workload_name;
use kubecraft_common::{Error, ProvisionerConfig, Result};

use crate::capacity::CapacityAdmission;
use crate::kube_client::KubeClient;
use crate::manifests::{
    workload_claim_name, workload_pod_name, workload_service, workload_stateful_set,
};
use crate::ports::{assigned_node_ports, PortAllocator};

/// Desired state of a workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadStatus {
    /// Desired replicas is one (or unset)
    Running,
    /// Desired replicas is zero
    Stopped,
}

impl WorkloadStatus {
    /// Derive the status from a StatefulSet's desired replica count
    pub fn of(stateful_set: &StatefulSet) -> Self {
        match stateful_set.spec.as_ref().and_then(|s| s.replicas) {
            Some(0) => WorkloadStatus::Stopped,
            _ => WorkloadStatus::Running,
        }
    }

    /// Lowercase name as shown to tenants
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a workload listing
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadInfo {
    /// Workload name
    pub name: String,
    /// Derived desired state
    pub status: WorkloadStatus,
    /// External port read from the endpoint; `None` if the endpoint is gone
    pub port: Option<u16>,
    /// When the StatefulSet was created
    pub created: Option<DateTime<Utc>>,
}

/// External port assigned on a workload endpoint
fn endpoint_port(service: &Service) -> Option<u16> {
    assigned_node_ports(service)
        .next()
        .and_then(|p| u16::try_from(p).ok())
}

/// Manages the workloads of one tenant
pub struct WorkloadManager {
    client: Arc<dyn KubeClient>,
    config: Arc<ProvisionerConfig>,
    tenant: String,
    namespace: String,
    ports: PortAllocator,
    admission: CapacityAdmission,
}

impl WorkloadManager {
    /// Create a manager acting in `tenant`'s namespace
    pub fn new(
        client: Arc<dyn KubeClient>,
        config: Arc<ProvisionerConfig>,
        tenant: impl Into<String>,
    ) -> Self {
        let tenant = tenant.into();
        let namespace = config.namespace_for(&tenant);
        Self {
            ports: PortAllocator::new(client.clone(), config.clone()),
            admission: CapacityAdmission::new(client.clone(), config.clone()),
            client,
            config,
            tenant,
            namespace,
        }
    }

    /// Namespace this manager acts in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn resource(name: &str) -> String {
        format!("workload {name}")
    }

    async fn find(&self, name: &str) -> Result<Option<StatefulSet>> {
        self.client
            .get_stateful_set(&self.namespace, name)
            .await
            .map_err(|e| Error::substrate("get workload", e))
    }

    async fn require(&self, name: &str) -> Result<StatefulSet> {
        self.find(name)
            .await?
            .ok_or_else(|| Error::not_found(Self::resource(name)))
    }

    async fn any_part_exists(&self, name: &str, claim: &str) -> Result<bool> {
        if self.find(name).await?.is_some() {
            return Ok(true);
        }
        let endpoint = self
            .client
            .get_service(&self.namespace, name)
            .await
            .map_err(|e| Error::substrate("get workload endpoint", e))?;
        if endpoint.is_some() {
            return Ok(true);
        }
        self.client
            .pvc_exists(&self.namespace, claim)
            .await
            .map_err(|e| Error::substrate("get workload storage claim", e))
    }

    /// Create and start a workload; returns its external port
    ///
    /// The endpoint is created before the StatefulSet and removed again if the
    /// StatefulSet cannot be created. A readiness timeout leaves both in place.
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn create(&self, name: &str) -> Result<u16> {
        validate_workload_name(name, &self.config)?;

        if self.find(name).await?.is_some() {
            return Err(Error::conflict(
                Self::resource(name),
                format!("namespace {} already has a workload named '{name}'", self.namespace),
            ));
        }

        self.admission.check().await?;
        let port = self.ports.allocate().await?;

        let service = workload_service(&self.namespace, &self.tenant, name, port, &self.config);
        self.client
            .create_service(&self.namespace, &service)
            .await
            .map_err(|e| {
                if is_conflict(&e) {
                    warn!(port, error = %e, "Endpoint rejected, port taken concurrently");
                    Error::conflict(
                        format!("endpoint {name}"),
                        format!("port {port} or name already allocated: {e}"),
                    )
                } else {
                    Error::substrate("create workload endpoint", e)
                }
            })?;
        debug!(port, "Endpoint created");

        let stateful_set = workload_stateful_set(&self.namespace, &self.tenant, name, &self.config);
        if let Err(e) = self
            .client
            .create_stateful_set(&self.namespace, &stateful_set)
            .await
        {
            if let Err(cleanup) = self.client.delete_service(&self.namespace, name).await {
                error!(error = %cleanup, "Failed to remove endpoint after StatefulSet creation failed");
            }
            return Err(if is_conflict(&e) {
                Error::conflict(Self::resource(name), e.to_string())
            } else {
                Error::substrate("create workload", e)
            });
        }

        self.wait_ready(name).await?;
        info!(port, "Workload created");
        Ok(port)
    }

    /// Scale a stopped workload back to one replica; returns its external port
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn start(&self, name: &str) -> Result<u16> {
        self.require(name).await?;
        self.scale(name, 1).await?;
        self.wait_ready(name).await?;

        let port = self
            .client
            .get_service(&self.namespace, name)
            .await
            .map_err(|e| Error::substrate("get workload endpoint", e))?
            .as_ref()
            .and_then(endpoint_port)
            .ok_or_else(|| Error::not_found(format!("endpoint {name}")))?;

        info!(port, "Workload started");
        Ok(port)
    }

    /// Scale a workload to zero replicas; the claim and endpoint stay
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.require(name).await?;
        self.scale(name, 0).await?;
        info!("Workload stopped");
        Ok(())
    }

    /// Delete a workload's StatefulSet, endpoint and storage claim
    ///
    /// Every deletion is attempted. A sub-resource that is already gone counts
    /// as deleted; each one that fails is named in the returned error. The
    /// workload exists while any of its parts does, so a partial delete can be
    /// retried.
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let claim = workload_claim_name(name);
        if !self.any_part_exists(name, &claim).await? {
            return Err(Error::not_found(Self::resource(name)));
        }

        let results = [
            (
                "statefulset",
                self.client.delete_stateful_set(&self.namespace, name).await,
            ),
            (
                "endpoint",
                self.client.delete_service(&self.namespace, name).await,
            ),
            (
                "storage claim",
                self.client.delete_pvc(&self.namespace, &claim).await,
            ),
        ];

        let mut failed = Vec::new();
        let mut first = None;
        for (part, result) in results {
            match result {
                Ok(()) => debug!(part, "Deleted"),
                Err(e) if is_not_found(&e) => debug!(part, "Already absent"),
                Err(e) => {
                    error!(part, error = %e, "Failed to delete workload part");
                    failed.push(part);
                    first.get_or_insert(e);
                }
            }
        }

        match first {
            None => {
                info!("Workload deleted");
                Ok(())
            }
            Some(source) => Err(Error::substrate(
                format!("delete workload {name} ({} failed)", failed.join(", ")),
                source,
            )),
        }
    }

    /// Every workload in the tenant's namespace
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn list(&self) -> Result<Vec<WorkloadInfo>> {
        let stateful_sets = self
            .client
            .list_stateful_sets(&self.namespace)
            .await
            .map_err(|e| Error::substrate("list workloads", e))?;

        let mut workloads = Vec::with_capacity(stateful_sets.len());
        for sts in &stateful_sets {
            let Some(name) = sts.metadata.name.clone() else {
                continue;
            };
            let port = self
                .client
                .get_service(&self.namespace, &name)
                .await
                .map_err(|e| Error::substrate("get workload endpoint", e))?
                .as_ref()
                .and_then(endpoint_port);
            if port.is_none() {
                warn!(workload = %name, "Workload has no endpoint");
            }

            workloads.push(WorkloadInfo {
                status: WorkloadStatus::of(sts),
                port,
                created: sts.metadata.creation_timestamp.as_ref().map(|t| t.0),
                name,
            });
        }
        Ok(workloads)
    }

    async fn scale(&self, name: &str, replicas: i32) -> Result<()> {
        self.client
            .scale_stateful_set(&self.namespace, name, replicas)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    Error::not_found(Self::resource(name))
                } else {
                    Error::substrate("scale workload", e)
                }
            })
    }

    async fn wait_ready(&self, name: &str) -> Result<()> {
        let pod = workload_pod_name(name);
        let client = &self.client;
        let namespace = self.namespace.as_str();
        poll_attempts(
            self.config.readiness_attempts,
            self.config.readiness_interval,
            format!("pod {pod}"),
            || {
                let pod = pod.clone();
                async move {
                    client
                        .get_pod(namespace, &pod)
                        .await
                        .map(|p| p.as_ref().is_some_and(is_pod_ready))
                        .map_err(|e| Error::substrate("get workload pod", e))
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::testing::{api_error, FakeKube};
    use kubecraft_common::ErrorKind;
    use std::time::Duration;

    fn config() -> Arc<ProvisionerConfig> {
        Arc::new(ProvisionerConfig {
            readiness_attempts: 3,
            readiness_interval: Duration::from_millis(1),
            ..Default::default()
        })
    }

    fn manager(fake: &Arc<FakeKube>, tenant: &str) -> WorkloadManager {
        WorkloadManager::new(fake.clone(), config(), tenant)
    }

    /// Story: create, list, stop, start, delete
    #[tokio::test]
    async fn story_full_lifecycle() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");

        let port = alice.create("srv1").await.unwrap();
        assert_eq!(port, 30000);

        let listed = alice.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "srv1");
        assert_eq!(listed[0].status, WorkloadStatus::Running);
        assert_eq!(listed[0].port, Some(port));
        assert!(listed[0].created.is_some());

        alice.stop("srv1").await.unwrap();
        assert_eq!(alice.list().await.unwrap()[0].status, WorkloadStatus::Stopped);
        assert!(fake.has("Service", "mc-alice", "srv1"));
        assert!(fake.has("PersistentVolumeClaim", "mc-alice", "mc-srv1-0"));
        assert!(!fake.has("Pod", "mc-alice", "srv1-0"));

        assert_eq!(alice.start("srv1").await.unwrap(), port);
        assert_eq!(alice.list().await.unwrap()[0].status, WorkloadStatus::Running);
        assert!(fake.has("PersistentVolumeClaim", "mc-alice", "mc-srv1-0"));

        alice.delete("srv1").await.unwrap();
        assert!(alice.list().await.unwrap().is_empty());
        assert!(!fake.has("Service", "mc-alice", "srv1"));
        assert!(!fake.has("PersistentVolumeClaim", "mc-alice", "mc-srv1-0"));
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");
        alice.create("srv1").await.unwrap();

        let err = alice.create("srv1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn same_name_in_different_tenants_gets_different_ports() {
        let fake = Arc::new(FakeKube::new());
        let a = manager(&fake, "alice").create("srv1").await.unwrap();
        let b = manager(&fake, "bob").create("srv1").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn invalid_name_is_rejected_before_any_call() {
        let alice = WorkloadManager::new(Arc::new(MockKubeClient::new()), config(), "alice");
        let err = alice.create("Srv").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn admission_failure_is_propagated_verbatim() {
        let fake = Arc::new(FakeKube::new());
        let config = Arc::new(ProvisionerConfig {
            total_memory_mib: 1500,
            readiness_attempts: 3,
            readiness_interval: Duration::from_millis(1),
            ..Default::default()
        });
        WorkloadManager::new(fake.clone(), config.clone(), "alice")
            .create("srv1")
            .await
            .unwrap();

        let err = WorkloadManager::new(fake.clone(), config, "bob")
            .create("srv1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCapacity {
                available_mib: 732,
                required_mib: 1024
            }
        ));
        assert!(!fake.has("Service", "mc-bob", "srv1"));
    }

    #[tokio::test]
    async fn stopped_workloads_free_memory() {
        let fake = Arc::new(FakeKube::new());
        let config = Arc::new(ProvisionerConfig {
            total_memory_mib: 1500,
            readiness_attempts: 3,
            readiness_interval: Duration::from_millis(1),
            ..Default::default()
        });
        let alice = WorkloadManager::new(fake.clone(), config.clone(), "alice");
        alice.create("srv1").await.unwrap();
        alice.stop("srv1").await.unwrap();

        WorkloadManager::new(fake, config, "bob")
            .create("srv1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_ports_create_nothing() {
        let fake = Arc::new(FakeKube::new());
        let config = Arc::new(ProvisionerConfig {
            port_min: 30000,
            port_max: 30000,
            max_tenants: 1,
            readiness_attempts: 3,
            readiness_interval: Duration::from_millis(1),
            ..Default::default()
        });
        WorkloadManager::new(fake.clone(), config.clone(), "alice")
            .create("srv1")
            .await
            .unwrap();

        let err = WorkloadManager::new(fake.clone(), config, "bob")
            .create("srv1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exhausted);
        assert!(!fake.has("StatefulSet", "mc-bob", "srv1"));
    }

    /// Story: another writer takes the scanned port before our endpoint lands
    #[tokio::test]
    async fn story_port_taken_between_scan_and_create_is_a_conflict() {
        let fake = Arc::new(FakeKube::new());
        // Invisible to the allocator's label scan, but holds the node port
        let mut racer = workload_service("mc-bob", "bob", "srv9", 30000, &config());
        racer.metadata.labels = None;
        fake.add_service(racer);

        let err = manager(&fake, "alice").create("srv1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("30000"));
        assert!(!fake.has("Service", "mc-alice", "srv1"));
        assert!(!fake.has("StatefulSet", "mc-alice", "srv1"));
    }

    #[tokio::test]
    async fn failed_stateful_set_removes_endpoint() {
        let fake = Arc::new(FakeKube::new());
        fake.fail_next("create_stateful_set", 500);

        let err = manager(&fake, "alice").create("srv1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Substrate);
        assert!(!fake.has("Service", "mc-alice", "srv1"));
        assert!(fake.calls().contains(&"delete service srv1".to_string()));
    }

    #[tokio::test]
    async fn readiness_timeout_leaves_objects_in_place() {
        let fake = Arc::new(FakeKube::new());
        fake.set_pods_ready(false);

        let err = manager(&fake, "alice").create("srv1").await.unwrap_err();
        match err {
            Error::Timeout { what, attempts } => {
                assert_eq!(what, "pod srv1-0");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected timeout, got {other}"),
        }
        assert!(fake.has("Service", "mc-alice", "srv1"));
        assert!(fake.has("StatefulSet", "mc-alice", "srv1"));
    }

    #[tokio::test]
    async fn forbidden_readiness_check_fails_without_waiting_out_the_bound() {
        let fake = Arc::new(FakeKube::new());
        fake.fail_next("get_pod", 403);

        let err = manager(&fake, "alice").create("srv1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Substrate);
        assert!(err.to_string().contains("get workload pod"), "{err}");
    }

    #[tokio::test]
    async fn start_and_stop_require_an_existing_workload() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");
        assert_eq!(
            alice.start("ghost").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            alice.stop("ghost").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn start_waits_for_readiness() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");
        alice.create("srv1").await.unwrap();
        alice.stop("srv1").await.unwrap();
        fake.set_pods_ready(false);

        let err = alice.start("srv1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(alice.list().await.unwrap()[0].status, WorkloadStatus::Running);
    }

    #[tokio::test]
    async fn deleting_absent_workload_is_not_found() {
        let fake = Arc::new(FakeKube::new());
        let err = manager(&fake, "alice").delete("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_reports_each_failed_part() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");
        alice.create("srv1").await.unwrap();
        fake.fail_next("delete_service", 500);
        fake.fail_next("delete_pvc", 403);

        let err = alice.delete("srv1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Substrate);
        let message = err.to_string();
        assert!(message.contains("endpoint, storage claim failed"), "{message}");
        assert!(!message.contains("statefulset,"), "{message}");

        // The StatefulSet deletion still went through
        assert!(!fake.has("StatefulSet", "mc-alice", "srv1"));
        assert!(fake.has("Service", "mc-alice", "srv1"));
    }

    #[tokio::test]
    async fn delete_tolerates_already_missing_parts() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");
        alice.create("srv1").await.unwrap();
        fake.delete_service("mc-alice", "srv1").await.unwrap();

        alice.delete("srv1").await.unwrap();
        assert!(!fake.has("PersistentVolumeClaim", "mc-alice", "mc-srv1-0"));
    }

    #[tokio::test]
    async fn partial_delete_can_be_retried() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");
        alice.create("srv1").await.unwrap();
        fake.fail_next("delete_service", 500);

        alice.delete("srv1").await.unwrap_err();
        assert!(!fake.has("StatefulSet", "mc-alice", "srv1"));
        assert!(fake.has("Service", "mc-alice", "srv1"));

        alice.delete("srv1").await.unwrap();
        assert!(!fake.has("Service", "mc-alice", "srv1"));
        assert!(!fake.has("PersistentVolumeClaim", "mc-alice", "mc-srv1-0"));

        // The port went back to the pool
        assert_eq!(manager(&fake, "bob").create("srv2").await.unwrap(), 30000);
    }

    #[tokio::test]
    async fn leftover_claim_alone_keeps_workload_deletable() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");
        alice.create("srv1").await.unwrap();
        fake.fail_next("delete_pvc", 500);

        alice.delete("srv1").await.unwrap_err();
        assert!(fake.has("PersistentVolumeClaim", "mc-alice", "mc-srv1-0"));

        alice.delete("srv1").await.unwrap();
        assert!(!fake.has("PersistentVolumeClaim", "mc-alice", "mc-srv1-0"));
        assert_eq!(
            alice.delete("srv1").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn list_tolerates_missing_endpoint() {
        let fake = Arc::new(FakeKube::new());
        let alice = manager(&fake, "alice");
        alice.create("srv1").await.unwrap();
        fake.delete_service("mc-alice", "srv1").await.unwrap();

        let listed = alice.list().await.unwrap();
        assert_eq!(listed[0].port, None);
    }

    #[tokio::test]
    async fn list_is_scoped_to_the_tenant_namespace() {
        let fake = Arc::new(FakeKube::new());
        manager(&fake, "alice").create("srv1").await.unwrap();
        manager(&fake, "bob").create("srv2").await.unwrap();

        let names: Vec<_> = manager(&fake, "bob")
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["srv2".to_string()]);
    }

    #[tokio::test]
    async fn endpoint_create_failure_skips_stateful_set() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_stateful_set().returning(|_, _| Ok(None));
        mock.expect_list_running_pods().returning(|_| Ok(vec![]));
        mock.expect_list_services().returning(|_| Ok(vec![]));
        mock.expect_create_service()
            .returning(|_, _| Err(api_error(500, "etcd timeout")));
        mock.expect_create_stateful_set().never();

        let alice = WorkloadManager::new(Arc::new(mock), config(), "alice");
        let err = alice.create("srv1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Substrate);
    }

    #[test]
    fn status_follows_desired_replicas() {
        let config = ProvisionerConfig::default();
        let mut sts = workload_stateful_set("mc-alice", "alice", "srv1", &config);
        assert_eq!(WorkloadStatus::of(&sts), WorkloadStatus::Running);

        if let Some(spec) = sts.spec.as_mut() {
            spec.replicas = Some(0);
        }
        assert_eq!(WorkloadStatus::of(&sts), WorkloadStatus::Stopped);
        assert_eq!(WorkloadStatus::Stopped.to_string(), "stopped");

        if let Some(spec) = sts.spec.as_mut() {
            spec.replicas = None;
        }
        assert_eq!(WorkloadStatus::of(&sts), WorkloadStatus::Running);
    }
}
