//! Capacity admission control
//!
//! Sums the memory requests of every running workload pod and refuses a new
//! workload unless the remaining headroom covers one more workload's memory
//! limit. The check reserves nothing.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, instrument, warn};

use kubecraft_common::quantity::parse_memory_mib;
use kubecraft_common::{Error, ProvisionerConfig, Result, WORKLOAD_LABEL_SELECTOR};

use crate::kube_client::KubeClient;

/// Sum of container memory requests of a pod, in MiB
///
/// Containers without a memory request contribute nothing. Each container is
/// truncated to whole MiB before summing.
pub fn pod_memory_request_mib(pod: &Pod) -> Result<i64> {
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    let mut total = 0i64;
    for container in containers {
        let request = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("memory"));
        if let Some(qty) = request {
            let mib = parse_memory_mib(&qty.0).map_err(|e| {
                Error::malformed(
                    "sum workload memory requests",
                    format!(
                        "pod {}: {}",
                        pod.metadata.name.as_deref().unwrap_or("<unnamed>"),
                        e
                    ),
                )
            })?;
            total += mib as i64;
        }
    }
    Ok(total)
}

/// Advisory memory-headroom check gating workload creation
pub struct CapacityAdmission {
    client: Arc<dyn KubeClient>,
    config: Arc<ProvisionerConfig>,
}

impl CapacityAdmission {
    /// Create an admission controller over the given substrate
    pub fn new(client: Arc<dyn KubeClient>, config: Arc<ProvisionerConfig>) -> Self {
        Self { client, config }
    }

    /// Memory committed to running workloads, in MiB
    pub async fn committed_mib(&self) -> Result<i64> {
        let pods = self
            .client
            .list_running_pods(WORKLOAD_LABEL_SELECTOR)
            .await
            .map_err(|e| Error::substrate("list running workload pods", e))?;

        let mut total = 0i64;
        for pod in &pods {
            total += pod_memory_request_mib(pod)?;
        }
        Ok(total)
    }

    /// Admit one more workload, or fail with [`Error::InsufficientCapacity`]
    #[instrument(skip(self))]
    pub async fn check(&self) -> Result<()> {
        let required_mib = self.config.capacity_threshold_mib()?;
        let committed = self.committed_mib().await?;
        let available_mib = self.config.total_memory_mib - committed;

        if available_mib < required_mib {
            warn!(
                committed_mib = committed,
                available_mib, required_mib, "Admission rejected: insufficient memory"
            );
            return Err(Error::InsufficientCapacity {
                available_mib,
                required_mib,
            });
        }

        debug!(
            committed_mib = committed,
            available_mib, required_mib, "Admission granted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kubecraft_common::ErrorKind;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn container(memory: Option<&str>) -> Container {
        Container {
            name: "c".to_string(),
            resources: memory.map(|m| ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity(m.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(requests: &[Option<&str>]) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: requests.iter().map(|r| container(*r)).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn admission_with(pods: Vec<Pod>) -> CapacityAdmission {
        let mut mock = MockKubeClient::new();
        mock.expect_list_running_pods()
            .withf(|selector| selector == "app=kubecraft-server")
            .returning(move |_| Ok(pods.clone()));
        CapacityAdmission::new(Arc::new(mock), Arc::new(ProvisionerConfig::default()))
    }

    #[tokio::test]
    async fn empty_cluster_is_admitted() {
        admission_with(vec![]).check().await.unwrap();
    }

    #[rstest]
    // 8192 - 9 * 768 = 1280 >= 1024
    #[case::nine_running(9, true)]
    // 8192 - 10 * 768 = 512 < 1024
    #[case::ten_running(10, false)]
    #[tokio::test]
    async fn headroom_must_cover_one_workload_limit(#[case] running: usize, #[case] admitted: bool) {
        let pods = (0..running).map(|_| pod(&[Some("768Mi")])).collect();
        let result = admission_with(pods).check().await;
        assert_eq!(result.is_ok(), admitted, "{result:?}");
    }

    #[tokio::test]
    async fn rejection_reports_observed_headroom() {
        let pods = (0..10).map(|_| pod(&[Some("768Mi")])).collect();
        let err = admission_with(pods).check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientCapacity);
        match err {
            Error::InsufficientCapacity {
                available_mib,
                required_mib,
            } => {
                assert_eq!(available_mib, 512);
                assert_eq!(required_mib, 1024);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn headroom_exactly_at_threshold_is_admitted() {
        // 8192 - 7168 = 1024
        admission_with(vec![pod(&[Some("7Gi")])]).check().await.unwrap();
    }

    #[test]
    fn sums_every_container_and_skips_unrequested() {
        let p = pod(&[Some("512Mi"), None, Some("1Gi")]);
        assert_eq!(pod_memory_request_mib(&p).unwrap(), 1536);
    }

    #[test]
    fn unparseable_request_is_malformed() {
        let p = pod(&[Some("plenty")]);
        let err = pod_memory_request_mib(&p).unwrap_err();
        assert!(matches!(err, Error::MalformedObject { .. }));
    }
}
