//! Command-line and environment configuration
//!
//! Every [`ProvisionerConfig`] field is a flag with a `KUBECRAFT_*` environment
//! fallback. Defaults match [`ProvisionerConfig::default`].

use std::time::Duration;

use clap::Args;

use kubecraft_common::config::{QuotaLimits, WorkloadTemplate};
use kubecraft_common::{Error, ProvisionerConfig};

/// Parse a `KEY=VALUE` pair
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Provisioner configuration flags
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Maximum number of registered tenants
    #[arg(long, env = "KUBECRAFT_MAX_TENANTS", default_value_t = 15)]
    pub max_tenants: usize,

    /// Minimum tenant/workload name length
    #[arg(long, env = "KUBECRAFT_NAME_MIN_LEN", default_value_t = 3)]
    pub name_min_len: usize,

    /// Maximum tenant/workload name length
    #[arg(long, env = "KUBECRAFT_NAME_MAX_LEN", default_value_t = 16)]
    pub name_max_len: usize,

    /// Tenant names that can never be registered
    #[arg(
        long,
        env = "KUBECRAFT_RESERVED_NAMES",
        value_delimiter = ',',
        default_values = [
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
    )]
    pub reserved_names: Vec<String>,

    /// Prefix joined to a tenant name to form its namespace
    #[arg(long, env = "KUBECRAFT_NAMESPACE_PREFIX", default_value = "mc-")]
    pub namespace_prefix: String,

    /// Lowest external port handed to a workload
    #[arg(long, env = "KUBECRAFT_PORT_MIN", default_value_t = 30000)]
    pub port_min: u16,

    /// Highest external port handed to a workload
    #[arg(long, env = "KUBECRAFT_PORT_MAX", default_value_t = 30015)]
    pub port_max: u16,

    /// Memory available to workloads cluster-wide, in MiB
    #[arg(long, env = "KUBECRAFT_TOTAL_MEMORY_MIB", default_value_t = 8192)]
    pub total_memory_mib: i64,

    /// Workload container image
    #[arg(long, env = "KUBECRAFT_WORKLOAD_IMAGE", default_value = "itzg/minecraft-server")]
    pub workload_image: String,

    /// Fixed internal port of the workload container
    #[arg(long, env = "KUBECRAFT_WORKLOAD_PORT", default_value_t = 25565)]
    pub workload_port: u16,

    /// Workload container environment (KEY=VALUE, comma separated)
    #[arg(
        long,
        env = "KUBECRAFT_WORKLOAD_ENV",
        value_delimiter = ',',
        value_parser = parse_key_val,
        default_values = ["EULA=TRUE", "VERSION=1.21.11", "GAME_MODE=survival", "MAX_PLAYERS=5"]
    )]
    pub workload_env: Vec<(String, String)>,

    /// CPU request per workload
    #[arg(long, env = "KUBECRAFT_WORKLOAD_CPU_REQUEST", default_value = "500m")]
    pub workload_cpu_request: String,

    /// CPU limit per workload
    #[arg(long, env = "KUBECRAFT_WORKLOAD_CPU_LIMIT", default_value = "750m")]
    pub workload_cpu_limit: String,

    /// Memory request per workload
    #[arg(long, env = "KUBECRAFT_WORKLOAD_MEMORY_REQUEST", default_value = "768Mi")]
    pub workload_memory_request: String,

    /// Memory limit per workload, also the admission headroom threshold
    #[arg(long, env = "KUBECRAFT_WORKLOAD_MEMORY_LIMIT", default_value = "1Gi")]
    pub workload_memory_limit: String,

    /// Storage class of workload claims
    #[arg(long, env = "KUBECRAFT_STORAGE_CLASS", default_value = "local-path")]
    pub storage_class: String,

    /// Requested size of workload claims
    #[arg(long, env = "KUBECRAFT_STORAGE_SIZE", default_value = "5Gi")]
    pub storage_size: String,

    /// Namespace quota: aggregate CPU requests
    #[arg(long, env = "KUBECRAFT_QUOTA_REQUESTS_CPU", default_value = "1500m")]
    pub quota_requests_cpu: String,

    /// Namespace quota: aggregate memory requests
    #[arg(long, env = "KUBECRAFT_QUOTA_REQUESTS_MEMORY", default_value = "1536Mi")]
    pub quota_requests_memory: String,

    /// Namespace quota: aggregate CPU limits
    #[arg(long, env = "KUBECRAFT_QUOTA_LIMITS_CPU", default_value = "2250m")]
    pub quota_limits_cpu: String,

    /// Namespace quota: aggregate memory limits
    #[arg(long, env = "KUBECRAFT_QUOTA_LIMITS_MEMORY", default_value = "3Gi")]
    pub quota_limits_memory: String,

    /// Namespace quota: storage claims
    #[arg(long, env = "KUBECRAFT_QUOTA_PVCS", default_value_t = 1)]
    pub quota_pvcs: u32,

    /// Lifetime of issued tenant credentials, in seconds
    #[arg(long, env = "KUBECRAFT_TOKEN_EXPIRY_SECS", default_value_t = 157_680_000)]
    pub token_expiry_secs: u64,

    /// Number of readiness polls before giving up
    #[arg(long, env = "KUBECRAFT_READINESS_ATTEMPTS", default_value_t = 60)]
    pub readiness_attempts: u32,

    /// Delay between readiness polls, in seconds
    #[arg(long, env = "KUBECRAFT_READINESS_INTERVAL_SECS", default_value_t = 5)]
    pub readiness_interval_secs: u64,

    /// Name of the authorization list ClusterRoleBinding
    #[arg(long, env = "KUBECRAFT_AUTHZ_LIST", default_value = "kc-users-capacity-check")]
    pub authz_list_name: String,

    /// ClusterRole granted by the authorization list
    #[arg(long, env = "KUBECRAFT_CAPACITY_CLUSTER_ROLE", default_value = "kubecraft-capacity-checker")]
    pub capacity_cluster_role: String,

    /// Name of the per-tenant Role
    #[arg(long, env = "KUBECRAFT_TENANT_ROLE", default_value = "minecraft-manager")]
    pub tenant_role_name: String,

    /// Name of the per-tenant ResourceQuota
    #[arg(long, env = "KUBECRAFT_QUOTA_NAME", default_value = "mc-compute-resources")]
    pub quota_name: String,

    /// Attempts to rewrite the authorization list under concurrent writers
    #[arg(long, env = "KUBECRAFT_AUTHZ_UPDATE_ATTEMPTS", default_value_t = 5)]
    pub authz_update_attempts: u32,

    /// Connect timeout for API server calls, in seconds
    #[arg(long, env = "KUBECRAFT_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Read timeout for API server calls, in seconds
    #[arg(long, env = "KUBECRAFT_READ_TIMEOUT_SECS", default_value_t = 30)]
    pub read_timeout_secs: u64,

    /// Attempts for API server calls that fail transiently
    #[arg(long, env = "KUBECRAFT_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,
}

impl ConfigArgs {
    /// Build and validate the provisioner configuration
    pub fn into_config(self) -> Result<ProvisionerConfig, Error> {
        let config = ProvisionerConfig {
            max_tenants: self.max_tenants,
            name_min_len: self.name_min_len,
            name_max_len: self.name_max_len,
            reserved_names: self.reserved_names,
            namespace_prefix: self.namespace_prefix,
            port_min: self.port_min,
            port_max: self.port_max,
            total_memory_mib: self.total_memory_mib,
            workload: WorkloadTemplate {
                image: self.workload_image,
                port: self.workload_port,
                env: self.workload_env,
                cpu_request: self.workload_cpu_request,
                cpu_limit: self.workload_cpu_limit,
                memory_request: self.workload_memory_request,
                memory_limit: self.workload_memory_limit,
                storage_class: self.storage_class,
                storage_size: self.storage_size,
            },
            quota: QuotaLimits {
                requests_cpu: self.quota_requests_cpu,
                requests_memory: self.quota_requests_memory,
                limits_cpu: self.quota_limits_cpu,
                limits_memory: self.quota_limits_memory,
                persistent_volume_claims: self.quota_pvcs,
            },
            token_expiry: Duration::from_secs(self.token_expiry_secs),
            readiness_attempts: self.readiness_attempts,
            readiness_interval: Duration::from_secs(self.readiness_interval_secs),
            authz_list_name: self.authz_list_name,
            capacity_cluster_role: self.capacity_cluster_role,
            tenant_role_name: self.tenant_role_name,
            quota_name: self.quota_name,
            authz_update_attempts: self.authz_update_attempts,
            substrate_connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            substrate_read_timeout: Duration::from_secs(self.read_timeout_secs),
            substrate_retry_attempts: self.retry_attempts,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    fn parse(args: &[&str]) -> ConfigArgs {
        TestCli::parse_from(std::iter::once("kubecraft").chain(args.iter().copied())).config
    }

    #[test]
    fn defaults_match_provisioner_defaults() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config, ProvisionerConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--max-tenants",
            "4",
            "--port-min",
            "31000",
            "--port-max",
            "31009",
            "--reserved-names",
            "ops,staff",
            "--workload-env",
            "EULA=TRUE,DIFFICULTY=hard",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.max_tenants, 4);
        assert_eq!((config.port_min, config.port_max), (31000, 31009));
        assert_eq!(config.reserved_names, vec!["ops", "staff"]);
        assert_eq!(
            config.workload.env,
            vec![
                ("EULA".to_string(), "TRUE".to_string()),
                ("DIFFICULTY".to_string(), "hard".to_string()),
            ]
        );
    }

    #[test]
    fn invalid_combination_is_rejected() {
        let err = parse(&["--port-min", "30010", "--port-max", "30000"])
            .into_config()
            .unwrap_err();
        assert!(err.to_string().contains("port range"));
    }

    #[test]
    fn malformed_env_pair_is_rejected() {
        assert!(parse_key_val("NOVALUE").is_err());
        assert!(parse_key_val("=x").is_err());
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
    }
}
