//! Authorization list maintenance
//!
//! The authorization list is a single ClusterRoleBinding whose subjects are the
//! tenant identities allowed to run cluster-wide capacity queries. It is the
//! one cluster-scoped object every registration and deregistration rewrites.
//!
//! Writers inside this process take a mutex. Writers in other processes are
//! caught by optimistic concurrency: each replace carries the resourceVersion
//! of the read it was computed from, and a 409 triggers a fresh read. A lost
//! update is never silently accepted.

use std::sync::Arc;

use k8s_openapi::api::rbac::v1::Subject;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use kubecraft_common::{Error, ProvisionerConfig, Result};

use crate::kube_client::KubeClient;

fn same_identity(s: &Subject, name: &str, namespace: &str) -> bool {
    s.name == name && s.namespace.as_deref() == Some(namespace)
}

/// What a mutation decided to do with the list
enum Change {
    Write,
    Unchanged,
}

/// Serialized read-modify-write access to the authorization list
pub struct AuthorizationList {
    client: Arc<dyn KubeClient>,
    config: Arc<ProvisionerConfig>,
    writer: Mutex<()>,
}

impl AuthorizationList {
    /// Create a maintainer for the configured list
    pub fn new(client: Arc<dyn KubeClient>, config: Arc<ProvisionerConfig>) -> Self {
        Self {
            client,
            config,
            writer: Mutex::new(()),
        }
    }

    fn resource(&self) -> String {
        format!("authorization list {}", self.config.authz_list_name)
    }

    /// Current subjects of the list
    pub async fn subjects(&self) -> Result<Vec<Subject>> {
        let binding = self
            .client
            .get_cluster_role_binding(&self.config.authz_list_name)
            .await
            .map_err(|e| Error::substrate("get authorization list", e))?
            .ok_or_else(|| Error::prerequisite_missing(self.resource()))?;
        Ok(binding.subjects.unwrap_or_default())
    }

    /// Append an identity
    ///
    /// Fails with [`Error::PrerequisiteMissing`] if the list object is missing and with
    /// [`Error::Conflict`] if the identity is already present.
    #[instrument(skip(self, subject), fields(identity = %subject.name))]
    pub async fn append(&self, subject: Subject) -> Result<()> {
        let resource = self.resource();
        self.update("append to authorization list", |subjects| {
            let namespace = subject.namespace.as_deref().unwrap_or_default();
            if subjects
                .iter()
                .any(|s| s.kind == subject.kind && same_identity(s, &subject.name, namespace))
            {
                return Err(Error::conflict(
                    resource.clone(),
                    format!("{} {}/{} is already listed", subject.kind, namespace, subject.name),
                ));
            }
            subjects.push(subject.clone());
            Ok(Change::Write)
        })
        .await?;
        info!("Identity added to authorization list");
        Ok(())
    }

    /// Remove every entry matching (name, namespace)
    ///
    /// Returns whether anything was removed; absence is not an error.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str, namespace: &str) -> Result<bool> {
        let removed = self
            .update("remove from authorization list", |subjects| {
                let before = subjects.len();
                subjects.retain(|s| !same_identity(s, name, namespace));
                Ok(if subjects.len() == before {
                    Change::Unchanged
                } else {
                    Change::Write
                })
            })
            .await?;
        if removed {
            info!("Identity removed from authorization list");
        } else {
            debug!("Identity was not on the authorization list");
        }
        Ok(removed)
    }

    /// Read, mutate and conditionally replace the list; returns whether a write happened
    async fn update<F>(&self, context: &str, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut Vec<Subject>) -> Result<Change>,
    {
        let _guard = self.writer.lock().await;
        let attempts = self.config.authz_update_attempts.max(1);

        for attempt in 1..=attempts {
            let mut binding = self
                .client
                .get_cluster_role_binding(&self.config.authz_list_name)
                .await
                .map_err(|e| Error::substrate(context, e))?
                .ok_or_else(|| Error::prerequisite_missing(self.resource()))?;

            let mut subjects = binding.subjects.take().unwrap_or_default();
            if let Change::Unchanged = mutate(&mut subjects)? {
                return Ok(false);
            }
            binding.subjects = Some(subjects);

            match self.client.replace_cluster_role_binding(&binding).await {
                Ok(_) => return Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    warn!(attempt, "Authorization list changed concurrently, re-reading");
                }
                Err(e) => return Err(Error::substrate(context, e)),
            }
        }

        Err(Error::conflict(
            self.resource(),
            format!("concurrent writers prevented the update after {attempts} attempts"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::manifests::tenant_subject;
    use crate::testing::{api_error, authz_list_binding, FakeKube};
    use kubecraft_common::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> Arc<ProvisionerConfig> {
        Arc::new(ProvisionerConfig::default())
    }

    #[tokio::test]
    async fn append_then_remove_round_trips() {
        let fake = Arc::new(FakeKube::with_authz_list(&config()));
        let list = AuthorizationList::new(fake.clone(), config());

        list.append(tenant_subject("mc-alice", "alice"))
            .await
            .unwrap();
        list.append(tenant_subject("mc-bob", "bob"))
            .await
            .unwrap();
        assert_eq!(list.subjects().await.unwrap().len(), 2);

        assert!(list.remove("alice", "mc-alice").await.unwrap());
        let remaining = list.subjects().await.unwrap();
        assert_eq!(remaining, vec![tenant_subject("mc-bob", "bob")]);
    }

    #[tokio::test]
    async fn duplicate_append_is_a_conflict() {
        let fake = Arc::new(FakeKube::with_authz_list(&config()));
        let list = AuthorizationList::new(fake, config());

        list.append(tenant_subject("mc-alice", "alice"))
            .await
            .unwrap();
        let err = list
            .append(tenant_subject("mc-alice", "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(list.subjects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removing_absent_identity_is_a_no_op() {
        let fake = Arc::new(FakeKube::with_authz_list(&config()));
        let list = AuthorizationList::new(fake.clone(), config());
        list.append(tenant_subject("mc-bob", "bob"))
            .await
            .unwrap();
        let writes = fake.authz_writes();

        assert!(!list.remove("alice", "mc-alice").await.unwrap());
        assert_eq!(fake.authz_writes(), writes, "no write for a no-op removal");
    }

    #[tokio::test]
    async fn remove_matches_namespace_as_well_as_name() {
        let fake = Arc::new(FakeKube::with_authz_list(&config()));
        let list = AuthorizationList::new(fake, config());
        list.append(tenant_subject("mc-alice", "alice"))
            .await
            .unwrap();

        assert!(!list.remove("alice", "mc-other").await.unwrap());
        assert_eq!(list.subjects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_list_is_not_found() {
        let list = AuthorizationList::new(Arc::new(FakeKube::new()), config());
        let err = list
            .append(tenant_subject("mc-alice", "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err, Error::PrerequisiteMissing { .. }));
        assert!(err.to_string().contains("kc-users-capacity-check"));
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_kept() {
        let fake = Arc::new(FakeKube::with_authz_list(&config()));
        let list = Arc::new(AuthorizationList::new(fake, config()));

        let mut handles = Vec::new();
        for i in 0..10 {
            let list = list.clone();
            handles.push(tokio::spawn(async move {
                list.append(tenant_subject(&format!("mc-t{i}"), &format!("t{i}")))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(list.subjects().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn stale_write_is_retried_against_a_fresh_read() {
        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();
        let mut mock = MockKubeClient::new();
        mock.expect_get_cluster_role_binding().returning(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(Some(authz_list_binding("kc-users-capacity-check", vec![])))
        });
        let mut seq = mockall::Sequence::new();
        mock.expect_replace_cluster_role_binding()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(api_error(409, "the object has been modified")));
        mock.expect_replace_cluster_role_binding()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|b| Ok(b.clone()));

        let list = AuthorizationList::new(Arc::new(mock), config());
        list.append(tenant_subject("mc-alice", "alice"))
            .await
            .unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_update_budget_surfaces_lost_update() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_cluster_role_binding()
            .returning(|_| Ok(Some(authz_list_binding("kc-users-capacity-check", vec![]))));
        mock.expect_replace_cluster_role_binding()
            .times(5)
            .returning(|_| Err(api_error(409, "the object has been modified")));

        let list = AuthorizationList::new(Arc::new(mock), config());
        let err = list
            .append(tenant_subject("mc-alice", "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("after 5 attempts"));
    }

    #[tokio::test]
    async fn other_write_failures_are_substrate_errors() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_cluster_role_binding()
            .returning(|_| Ok(Some(authz_list_binding("kc-users-capacity-check", vec![]))));
        mock.expect_replace_cluster_role_binding()
            .times(1)
            .returning(|_| Err(api_error(403, "forbidden")));

        let list = AuthorizationList::new(Arc::new(mock), config());
        let err = list
            .append(tenant_subject("mc-alice", "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Substrate);
    }
}
