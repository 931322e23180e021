//! Kubecraft provisioner
//!
//! Onboards tenants onto a shared cluster and runs their single stateful
//! workload under a memory admission check and a small external port pool.
//!
//! # Components
//!
//! ```text
//! register ──► TenantProvisioner ──► namespace, identity, role, quota
//!                     │
//!                     └──► AuthorizationList (shared ClusterRoleBinding)
//!
//! create ────► WorkloadManager ──► CapacityAdmission ──► PortAllocator
//!                     │
//!                     └──► Service + StatefulSet, readiness poll
//! ```
//!
//! All cluster access goes through [`kube_client::KubeClient`].

#![deny(missing_docs)]

pub mod authz_list;
pub mod capacity;
pub mod kube_client;
pub mod manifests;
pub mod ports;
pub mod tenant;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod workload;

pub use authz_list::AuthorizationList;
pub use capacity::CapacityAdmission;
pub use kube_client::{KubeClient, KubeClientImpl};
pub use ports::PortAllocator;
pub use tenant::{Registration, TenantProvisioner};
pub use workload::{WorkloadInfo, WorkloadManager, WorkloadStatus};
