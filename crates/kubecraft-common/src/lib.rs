//! Common types for kubecraft: configuration, errors, and Kubernetes utilities

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod quantity;
pub mod retry;
pub mod telemetry;
pub mod validation;

pub use config::ProvisionerConfig;
pub use error::{Error, ErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key shared by every object kubecraft creates
pub const LABEL_APP: &str = "app";

/// Value of [`LABEL_APP`] on tenant namespaces, identities, policies and endpoints
pub const LABEL_APP_KUBECRAFT: &str = "kubecraft";

/// Value of [`LABEL_APP`] on stateful workloads and their pods
pub const LABEL_APP_WORKLOAD: &str = "kubecraft-server";

/// Label key carrying the owning tenant name
pub const LABEL_USER: &str = "user";

/// Label key carrying the workload name
pub const LABEL_SERVER: &str = "server";

/// Label key grouping RBAC objects
pub const LABEL_COMPONENT: &str = "component";

/// Label selector for tenant-owned namespaces and endpoint objects
pub const TENANT_LABEL_SELECTOR: &str = "app=kubecraft";

/// Label selector for workload pods
pub const WORKLOAD_LABEL_SELECTOR: &str = "app=kubecraft-server";

/// Field manager used for patches issued by kubecraft
pub const FIELD_MANAGER: &str = "kubecraft";
