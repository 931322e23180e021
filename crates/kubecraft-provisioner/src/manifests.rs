//! Builders for every object kubecraft creates
//!
//! Builders are pure: they take names and the shared configuration and return
//! typed k8s-openapi objects. Nothing here talks to the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, Probe, ResourceQuota, ResourceQuotaSpec, ResourceRequirements,
    Service, ServiceAccount, ServicePort, ServiceSpec, TCPSocketAction, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubecraft_common::{
    ProvisionerConfig, LABEL_APP, LABEL_APP_KUBECRAFT, LABEL_APP_WORKLOAD, LABEL_COMPONENT,
    LABEL_SERVER, LABEL_USER,
};

/// Kind of the identities placed on the authorization list
pub const SUBJECT_KIND_SERVICE_ACCOUNT: &str = "ServiceAccount";

/// API group of RBAC role references
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Name of the workload's volume claim template
pub const DATA_VOLUME: &str = "mc";

/// Mount path of the workload's data volume
pub const DATA_MOUNT_PATH: &str = "/data";

/// Name of the container and its port inside a workload pod
pub const CONTAINER_NAME: &str = "kubecraft-server";
const PORT_NAME: &str = "game";

const READINESS_INITIAL_DELAY_SECONDS: i32 = 30;
const READINESS_PERIOD_SECONDS: i32 = 10;

fn labels<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Tenant namespace, labeled for discovery and counting
pub fn tenant_namespace(namespace: &str, tenant: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(labels([
                (LABEL_APP, LABEL_APP_KUBECRAFT),
                (LABEL_USER, tenant),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Identity of a tenant: a ServiceAccount named after it
pub fn tenant_service_account(namespace: &str, tenant: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(tenant.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels([
                (LABEL_APP, LABEL_APP_KUBECRAFT),
                (LABEL_USER, tenant),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Namespace-scoped permissions every tenant receives
pub fn tenant_role(namespace: &str, config: &ProvisionerConfig) -> Role {
    let rule = |groups: &[&str], resources: &[&str], verbs: &[&str]| PolicyRule {
        api_groups: Some(strings(groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    };

    Role {
        metadata: ObjectMeta {
            name: Some(config.tenant_role_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels([
                (LABEL_APP, LABEL_APP_KUBECRAFT),
                (LABEL_COMPONENT, "rbac"),
            ])),
            ..Default::default()
        },
        rules: Some(vec![
            rule(
                &[""],
                &["services", "persistentvolumeclaims"],
                &["get", "list", "create", "update", "delete"],
            ),
            rule(&[""], &["pods"], &["get", "list"]),
            rule(&[""], &["pods/log"], &["get"]),
            rule(
                &["apps"],
                &["statefulsets"],
                &["create", "get", "list", "patch", "update", "delete"],
            ),
        ]),
    }
}

/// Name of a tenant's RoleBinding
pub fn role_binding_name(tenant: &str) -> String {
    format!("binding-{tenant}")
}

/// Binds the tenant identity to the tenant role
pub fn tenant_role_binding(namespace: &str, tenant: &str, config: &ProvisionerConfig) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_binding_name(tenant)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels([
                (LABEL_APP, LABEL_APP_KUBECRAFT),
                (LABEL_COMPONENT, "rbac"),
                (LABEL_USER, tenant),
            ])),
            ..Default::default()
        },
        subjects: Some(vec![tenant_subject(namespace, tenant)]),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: config.tenant_role_name.clone(),
        },
    }
}

/// The (identity, namespace) pair placed on the authorization list
pub fn tenant_subject(namespace: &str, tenant: &str) -> Subject {
    Subject {
        kind: SUBJECT_KIND_SERVICE_ACCOUNT.to_string(),
        name: tenant.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Namespace-wide compute and storage caps
pub fn tenant_resource_quota(
    namespace: &str,
    tenant: &str,
    config: &ProvisionerConfig,
) -> ResourceQuota {
    let quota = &config.quota;
    let hard = BTreeMap::from([
        (
            "requests.cpu".to_string(),
            Quantity(quota.requests_cpu.clone()),
        ),
        (
            "requests.memory".to_string(),
            Quantity(quota.requests_memory.clone()),
        ),
        ("limits.cpu".to_string(), Quantity(quota.limits_cpu.clone())),
        (
            "limits.memory".to_string(),
            Quantity(quota.limits_memory.clone()),
        ),
        (
            "persistentvolumeclaims".to_string(),
            Quantity(quota.persistent_volume_claims.to_string()),
        ),
    ]);

    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(config.quota_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels([
                (LABEL_APP, LABEL_APP_KUBECRAFT),
                (LABEL_USER, tenant),
            ])),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Labels carried by workload pods; also the endpoint's selector
pub fn workload_pod_labels(tenant: &str, workload: &str) -> BTreeMap<String, String> {
    labels([
        (LABEL_APP, LABEL_APP_WORKLOAD),
        (LABEL_SERVER, workload),
        (LABEL_USER, tenant),
    ])
}

/// Externally reachable endpoint of a workload
pub fn workload_service(
    namespace: &str,
    tenant: &str,
    workload: &str,
    node_port: u16,
    config: &ProvisionerConfig,
) -> Service {
    let port = i32::from(config.workload.port);
    Service {
        metadata: ObjectMeta {
            name: Some(workload.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels([
                (LABEL_APP, LABEL_APP_KUBECRAFT),
                (LABEL_SERVER, workload),
                (LABEL_USER, tenant),
            ])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(workload_pod_labels(tenant, workload)),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                node_port: Some(i32::from(node_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The single-replica stateful workload with its volume claim template
pub fn workload_stateful_set(
    namespace: &str,
    tenant: &str,
    workload: &str,
    config: &ProvisionerConfig,
) -> StatefulSet {
    let template = &config.workload;
    let pod_labels = workload_pod_labels(tenant, workload);
    let port = i32::from(template.port);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(template.image.clone()),
        env: Some(
            template
                .env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(vec![ContainerPort {
            name: Some(PORT_NAME.to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(template.cpu_request.clone())),
                ("memory".to_string(), Quantity(template.memory_request.clone())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(template.cpu_limit.clone())),
                ("memory".to_string(), Quantity(template.memory_limit.clone())),
            ])),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(READINESS_INITIAL_DELAY_SECONDS),
            period_seconds: Some(READINESS_PERIOD_SECONDS),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(template.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(template.storage_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(workload.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(pod_labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(workload.to_string()),
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels([
                    (LABEL_APP, LABEL_APP_WORKLOAD),
                    (LABEL_SERVER, workload),
                ])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![claim]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Name of the only pod of a workload
pub fn workload_pod_name(workload: &str) -> String {
    format!("{workload}-0")
}

/// Name of the storage claim created from the workload's template
pub fn workload_claim_name(workload: &str) -> String {
    format!("{DATA_VOLUME}-{workload}-0")
}
