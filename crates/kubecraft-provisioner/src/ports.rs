//! External port allocation
//!
//! The allocator scans every kubecraft endpoint in the cluster and picks the
//! lowest free port in the configured range. The scan is a plain read: two
//! concurrent callers can pick the same port, and the API server's NodePort
//! admission rejects the second Service create.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, instrument};

use kubecraft_common::{Error, ProvisionerConfig, Result, TENANT_LABEL_SELECTOR};

use crate::kube_client::KubeClient;

/// Node ports assigned on a Service, ignoring unset (zero) values
pub fn assigned_node_ports(service: &Service) -> impl Iterator<Item = i32> + '_ {
    service
        .spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .filter_map(|p| p.node_port)
        .filter(|p| *p != 0)
}

/// Lowest port in `[min, max]` not present in `taken`
pub fn lowest_free_port(taken: &BTreeSet<i32>, min: u16, max: u16) -> Option<u16> {
    (min..=max).find(|p| !taken.contains(&i32::from(*p)))
}

/// Picks collision-free external ports
pub struct PortAllocator {
    client: Arc<dyn KubeClient>,
    config: Arc<ProvisionerConfig>,
}

impl PortAllocator {
    /// Create an allocator over the given substrate
    pub fn new(client: Arc<dyn KubeClient>, config: Arc<ProvisionerConfig>) -> Self {
        Self { client, config }
    }

    /// Return the lowest unassigned port in range
    ///
    /// Fails with [`Error::Exhausted`] when every port is in use.
    #[instrument(skip(self))]
    pub async fn allocate(&self) -> Result<u16> {
        let services = self
            .client
            .list_services(TENANT_LABEL_SELECTOR)
            .await
            .map_err(|e| Error::substrate("list endpoint services", e))?;

        let taken: BTreeSet<i32> = services.iter().flat_map(assigned_node_ports).collect();

        let (min, max) = (self.config.port_min, self.config.port_max);
        match lowest_free_port(&taken, min, max) {
            Some(port) => {
                debug!(port, in_use = taken.len(), "Allocated external port");
                Ok(port)
            }
            None => Err(Error::Exhausted { min, max }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::manifests::workload_service;
    use kubecraft_common::ErrorKind;
    use rstest::rstest;

    fn service_on(port: u16) -> Service {
        workload_service(
            "mc-t",
            "t",
            &format!("s{port}"),
            port,
            &ProvisionerConfig::default(),
        )
    }

    fn allocator_with(ports: Vec<u16>) -> PortAllocator {
        let mut mock = MockKubeClient::new();
        mock.expect_list_services()
            .withf(|selector| selector == "app=kubecraft")
            .returning(move |_| Ok(ports.iter().copied().map(service_on).collect()));
        PortAllocator::new(Arc::new(mock), Arc::new(ProvisionerConfig::default()))
    }

    #[rstest]
    #[case::empty_cluster(vec![], 30000)]
    #[case::first_taken(vec![30000], 30001)]
    #[case::gap_in_middle(vec![30000, 30001, 30003], 30002)]
    #[case::unordered(vec![30002, 30000, 30001], 30003)]
    #[case::only_last_free((30000..30015).collect(), 30015)]
    #[case::ports_outside_range_ignored(vec![31000, 29999], 30000)]
    #[tokio::test]
    async fn allocates_lowest_free_port(#[case] taken: Vec<u16>, #[case] expected: u16) {
        let port = allocator_with(taken.clone()).allocate().await.unwrap();
        assert_eq!(port, expected);
        assert!(!taken.contains(&port));
        assert!((30000..=30015).contains(&port));
    }

    #[tokio::test]
    async fn full_range_is_exhausted() {
        let err = allocator_with((30000..=30015).collect())
            .allocate()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exhausted);
        assert_eq!(err.to_string(), "no available ports in range 30000-30015");
    }

    #[tokio::test]
    async fn list_failure_is_a_substrate_error() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_services().returning(|_| {
            Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }))
        });
        let allocator = PortAllocator::new(Arc::new(mock), Arc::new(ProvisionerConfig::default()));
        assert_eq!(
            allocator.allocate().await.unwrap_err().kind(),
            ErrorKind::Substrate
        );
    }

    #[test]
    fn unset_node_ports_are_ignored() {
        let mut svc = service_on(30000);
        if let Some(spec) = svc.spec.as_mut() {
            if let Some(ports) = spec.ports.as_mut() {
                ports[0].node_port = Some(0);
            }
        }
        assert_eq!(assigned_node_ports(&svc).count(), 0);
    }
}
