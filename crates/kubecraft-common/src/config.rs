//! Provisioner configuration
//!
//! A single immutable [`ProvisionerConfig`] is built at process start, validated,
//! and shared by reference with every component. The defaults describe a small
//! single-node cluster hosting at most fifteen tenants.

use std::time::Duration;

use crate::quantity::parse_memory_mib;
use crate::Error;

/// Seconds in a (non-leap) year, used for credential expiry
pub const SECONDS_PER_YEAR: u64 = 365 * 24 * 60 * 60;

/// Namespace-wide resource caps installed once per tenant
#[derive(Clone, Debug, PartialEq)]
pub struct QuotaLimits {
    /// Aggregate CPU requests (e.g. "1500m")
    pub requests_cpu: String,
    /// Aggregate memory requests (e.g. "1536Mi")
    pub requests_memory: String,
    /// Aggregate CPU limits
    pub limits_cpu: String,
    /// Aggregate memory limits
    pub limits_memory: String,
    /// Maximum number of storage claims
    pub persistent_volume_claims: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            requests_cpu: "1500m".to_string(),
            requests_memory: "1536Mi".to_string(),
            limits_cpu: "2250m".to_string(),
            limits_memory: "3Gi".to_string(),
            persistent_volume_claims: 1,
        }
    }
}

/// Fixed shape of every tenant workload
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadTemplate {
    /// Container image
    pub image: String,
    /// Fixed internal port exposed by the container
    pub port: u16,
    /// Environment passed to the container
    pub env: Vec<(String, String)>,
    /// CPU request per workload
    pub cpu_request: String,
    /// CPU limit per workload
    pub cpu_limit: String,
    /// Memory request per workload
    pub memory_request: String,
    /// Memory limit per workload; also the admission headroom threshold
    pub memory_limit: String,
    /// Storage class of the workload's claim
    pub storage_class: String,
    /// Requested size of the workload's claim
    pub storage_size: String,
}

impl Default for WorkloadTemplate {
    fn default() -> Self {
        Self {
            image: "itzg/minecraft-server".to_string(),
            port: 25565,
            env: vec![
                ("EULA".to_string(), "TRUE".to_string()),
                ("VERSION".to_string(), "1.21.11".to_string()),
                ("GAME_MODE".to_string(), "survival".to_string()),
                ("MAX_PLAYERS".to_string(), "5".to_string()),
            ],
            cpu_request: "500m".to_string(),
            cpu_limit: "750m".to_string(),
            memory_request: "768Mi".to_string(),
            memory_limit: "1Gi".to_string(),
            storage_class: "local-path".to_string(),
            storage_size: "5Gi".to_string(),
        }
    }
}

/// Configuration shared by every provisioning component
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionerConfig {
    /// Maximum number of registered tenants
    pub max_tenants: usize,
    /// Minimum tenant/workload name length
    pub name_min_len: usize,
    /// Maximum tenant/workload name length
    pub name_max_len: usize,
    /// Tenant names that can never be registered
    pub reserved_names: Vec<String>,
    /// Prefix joined to a tenant name to form its namespace
    pub namespace_prefix: String,
    /// Lowest external port handed to a workload
    pub port_min: u16,
    /// Highest external port handed to a workload
    pub port_max: u16,
    /// Memory available to workloads cluster-wide, in MiB
    pub total_memory_mib: i64,
    /// Workload container shape
    pub workload: WorkloadTemplate,
    /// Per-tenant namespace quota
    pub quota: QuotaLimits,
    /// Lifetime of issued tenant credentials
    pub token_expiry: Duration,
    /// Number of readiness polls before giving up
    pub readiness_attempts: u32,
    /// Delay between readiness polls
    pub readiness_interval: Duration,
    /// Name of the cluster-scoped authorization list (a ClusterRoleBinding)
    pub authz_list_name: String,
    /// ClusterRole the authorization list grants
    pub capacity_cluster_role: String,
    /// Name of the per-tenant Role
    pub tenant_role_name: String,
    /// Name of the per-tenant ResourceQuota
    pub quota_name: String,
    /// Optimistic-concurrency attempts when rewriting the authorization list
    pub authz_update_attempts: u32,
    /// Connection timeout for substrate calls
    pub substrate_connect_timeout: Duration,
    /// Read timeout for substrate calls
    pub substrate_read_timeout: Duration,
    /// Attempts for a substrate call that fails transiently
    pub substrate_retry_attempts: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_tenants: 15,
            name_min_len: 3,
            name_max_len: 16,
            reserved_names: [
                "system",
                "admin",
                "root",
                "default",
                "kube-system",
                "kube-public",
                "kube-node-lease",
                "kubecraft",
                "kubecraft-system",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            namespace_prefix: "mc-".to_string(),
            port_min: 30000,
            port_max: 30015,
            total_memory_mib: 8192,
            workload: WorkloadTemplate::default(),
            quota: QuotaLimits::default(),
            token_expiry: Duration::from_secs(5 * SECONDS_PER_YEAR),
            readiness_attempts: 60,
            readiness_interval: Duration::from_secs(5),
            authz_list_name: "kc-users-capacity-check".to_string(),
            capacity_cluster_role: "kubecraft-capacity-checker".to_string(),
            tenant_role_name: "minecraft-manager".to_string(),
            quota_name: "mc-compute-resources".to_string(),
            authz_update_attempts: 5,
            substrate_connect_timeout: Duration::from_secs(5),
            substrate_read_timeout: Duration::from_secs(30),
            substrate_retry_attempts: 3,
        }
    }
}

impl ProvisionerConfig {
    /// Check internal consistency
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace_prefix.is_empty() {
            return Err(Error::validation(
                "namespace prefix",
                "must not be empty",
            ));
        }
        if self.port_min > self.port_max {
            return Err(Error::validation(
                "port range",
                format!("min {} is above max {}", self.port_min, self.port_max),
            ));
        }
        if self.port_range_size() < self.max_tenants {
            return Err(Error::validation(
                "port range",
                format!(
                    "{} ports cannot accommodate {} tenants",
                    self.port_range_size(),
                    self.max_tenants
                ),
            ));
        }
        if self.name_min_len == 0 || self.name_min_len > self.name_max_len {
            return Err(Error::validation(
                "name length",
                format!(
                    "bounds {}-{} are not a usable range",
                    self.name_min_len, self.name_max_len
                ),
            ));
        }
        if self.readiness_attempts == 0 {
            return Err(Error::validation(
                "readiness attempts",
                "must be at least 1",
            ));
        }
        if self.authz_update_attempts == 0 {
            return Err(Error::validation(
                "authorization update attempts",
                "must be at least 1",
            ));
        }
        for (field, qty) in [
            ("workload memory request", &self.workload.memory_request),
            ("workload memory limit", &self.workload.memory_limit),
        ] {
            parse_memory_mib(qty).map_err(|e| Error::validation(field, e))?;
        }
        Ok(())
    }

    /// Number of ports in the external range
    pub fn port_range_size(&self) -> usize {
        if self.port_min > self.port_max {
            0
        } else {
            usize::from(self.port_max - self.port_min) + 1
        }
    }

    /// Namespace owned by a tenant
    pub fn namespace_for(&self, tenant: &str) -> String {
        format!("{}{}", self.namespace_prefix, tenant)
    }

    /// Admission threshold: the per-workload memory limit in MiB
    pub fn capacity_threshold_mib(&self) -> Result<i64, Error> {
        parse_memory_mib(&self.workload.memory_limit)
            .map(|v| v as i64)
            .map_err(|e| Error::validation("workload memory limit", e))
    }

    /// Credential expiry in whole seconds
    pub fn token_expiry_seconds(&self) -> i64 {
        self.token_expiry.as_secs() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ProvisionerConfig::default().validate().unwrap();
    }

    #[test]
    fn port_range_accommodates_every_tenant() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.port_range_size(), 16);
        assert!(config.port_range_size() >= config.max_tenants);
    }

    #[test]
    fn namespace_is_prefixed_tenant_name() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.namespace_for("alice"), "mc-alice");
    }

    #[test]
    fn token_expires_after_five_years() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.token_expiry_seconds(), 157_680_000);
    }

    #[test]
    fn threshold_equals_workload_limit() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.capacity_threshold_mib().unwrap(), 1024);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let config = ProvisionerConfig {
            port_min: 30010,
            port_max: 30000,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port range"));
    }

    #[test]
    fn rejects_port_range_smaller_than_tenant_ceiling() {
        let config = ProvisionerConfig {
            port_min: 30000,
            port_max: 30004,
            max_tenants: 15,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_memory_limit() {
        let mut config = ProvisionerConfig::default();
        config.workload.memory_limit = "lots".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workload memory limit"));
    }

    #[test]
    fn rejects_zero_readiness_attempts() {
        let config = ProvisionerConfig {
            readiness_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
