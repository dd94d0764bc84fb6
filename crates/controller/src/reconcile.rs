//! Sync of one Service key: decide whether its Ingress should exist and
//! converge the store towards that.

use std::sync::Arc;

use ingressor_core::{owner, DependentStore, Lister, ResourceKey, Result};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    ServiceBackendPort,
};
use kube::api::ObjectMeta;
use tracing::{debug, info};

/// Host of the single rule attached to every created Ingress.
pub const DEFAULT_HOST: &str = "example.com";
pub const DEFAULT_PATH: &str = "/";
pub const DEFAULT_PATH_TYPE: &str = "Prefix";
/// Backend port; deliberately not taken from the Service's ports.
pub const DEFAULT_BACKEND_PORT: i32 = 80;

/// What a successful sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The Service is gone; its Ingress is left to owner-reference GC.
    PrimaryGone,
    Created,
    Deleted,
    /// Desired and observed state already agree.
    InSync,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::PrimaryGone => "primary_gone",
            Outcome::Created => "created",
            Outcome::Deleted => "deleted",
            Outcome::InSync => "in_sync",
        }
    }
}

/// Mutation a sync would perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// No mutation; carries `PrimaryGone` or `InSync`.
    Nothing(Outcome),
    Create(Box<Ingress>),
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Nothing(outcome) => outcome.as_str(),
            Action::Create(_) => "create",
            Action::Delete => "delete",
        }
    }
}

pub struct Reconciler {
    services: Arc<dyn Lister<Service>>,
    ingresses: Arc<dyn Lister<Ingress>>,
    store: Arc<dyn DependentStore>,
    annotation: String,
}

impl Reconciler {
    pub fn new(
        services: Arc<dyn Lister<Service>>,
        ingresses: Arc<dyn Lister<Ingress>>,
        store: Arc<dyn DependentStore>,
        annotation: impl Into<String>,
    ) -> Self {
        Self { services, ingresses, store, annotation: annotation.into() }
    }

    /// Decide what a sync of `key` would do, reading only the caches.
    pub fn plan(&self, key: &ResourceKey) -> Result<Action> {
        let (namespace, name) = (key.namespace(), key.name());

        let Some(service) = self.services.get(namespace, name)? else {
            return Ok(Action::Nothing(Outcome::PrimaryGone));
        };
        let wants = wants_ingress(&service, &self.annotation);
        let existing = self.ingresses.get(namespace, name)?;

        Ok(match (wants, existing) {
            (true, None) => Action::Create(Box::new(build_ingress(&service))),
            (false, Some(_)) => Action::Delete,
            (true, Some(_)) | (false, None) => Action::Nothing(Outcome::InSync),
        })
    }

    /// Idempotent: with unchanged caches a second call performs no mutation.
    /// Store errors are returned as-is.
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<Outcome> {
        match self.plan(key)? {
            Action::Nothing(outcome) => {
                debug!(%key, outcome = outcome.as_str(), "nothing to do");
                Ok(outcome)
            }
            Action::Create(ingress) => {
                self.store.create(key.namespace(), &ingress).await?;
                info!(%key, "ingress created");
                Ok(Outcome::Created)
            }
            Action::Delete => {
                self.store.delete(key.namespace(), key.name()).await?;
                info!(%key, "ingress deleted");
                Ok(Outcome::Deleted)
            }
        }
    }
}

/// Presence of `annotation` requests an Ingress; the value is ignored.
pub fn wants_ingress(service: &Service, annotation: &str) -> bool {
    service
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(annotation))
}

/// Ingress named after `service`, controlled by it, routing `/` on the
/// default host to the service's default port.
pub fn build_ingress(service: &Service) -> Ingress {
    let name = service.metadata.name.clone().unwrap_or_default();
    let path = HTTPIngressPath {
        path: Some(DEFAULT_PATH.to_string()),
        path_type: DEFAULT_PATH_TYPE.to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: name.clone(),
                port: Some(ServiceBackendPort { number: Some(DEFAULT_BACKEND_PORT), ..Default::default() }),
            }),
            ..Default::default()
        },
    };
    Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: service.metadata.namespace.clone(),
            owner_references: Some(vec![owner::controller_ref(service)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(DEFAULT_HOST.to_string()),
                http: Some(HTTPIngressRuleValue { paths: vec![path] }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
