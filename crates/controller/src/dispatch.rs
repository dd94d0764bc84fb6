//! Turns watch callbacks into queue adds. Only decides *whether* a key needs
//! a look; the reconciler decides what to do.

use ingressor_core::{owner, EventHandler, ResourceKey};
use ingressor_queue::WorkQueue;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Resource;
use metrics::counter;
use tracing::{trace, warn};

pub struct Dispatcher {
    queue: WorkQueue<ResourceKey>,
}

impl Dispatcher {
    pub fn new(queue: WorkQueue<ResourceKey>) -> Self { Self { queue } }

    fn enqueue<K: Resource>(&self, obj: &K, event: &'static str) {
        match ResourceKey::for_resource(obj) {
            Ok(key) => {
                trace!(%key, event, "enqueue");
                counter!("dispatch_enqueued_total", 1u64, "event" => event);
                self.queue.add(key);
            }
            Err(e) => {
                warn!(error = %e, event, "dropping event for object without a usable key");
                counter!("dispatch_skipped_total", 1u64, "reason" => "malformed_key");
            }
        }
    }
}

impl EventHandler<Service> for Dispatcher {
    fn on_add(&self, obj: &Service) {
        self.enqueue(obj, "service_add");
    }

    fn on_update(&self, old: &Service, new: &Service) {
        if old == new {
            counter!("dispatch_skipped_total", 1u64, "reason" => "unchanged");
            return;
        }
        self.enqueue(new, "service_update");
    }
}

impl EventHandler<Ingress> for Dispatcher {
    fn on_delete(&self, obj: &Ingress) {
        if !owner::is_controlled_by_kind(obj, &Service::kind(&())) {
            counter!("dispatch_skipped_total", 1u64, "reason" => "not_owned");
            return;
        }
        // same key as the owning Service by naming convention
        self.enqueue(obj, "ingress_delete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingressor_queue::ItemExponentialFailureRateLimiter;
    use std::time::Duration;

    fn queue() -> WorkQueue<ResourceKey> {
        WorkQueue::new("dispatch-test", ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1)))
    }

    fn svc(annotations: serde_json::Value) -> Service {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web", "namespace": "default", "annotations": annotations }
        }))
        .unwrap()
    }

    fn ingress(owners: serde_json::Value) -> Ingress {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web", "namespace": "default", "ownerReferences": owners }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn service_add_always_enqueues() {
        let q = queue();
        let d = Dispatcher::new(q.clone());
        d.on_add(&svc(serde_json::json!({})));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.unwrap().to_string(), "default/web");
    }

    #[test]
    fn identical_update_is_skipped() {
        let q = queue();
        let d = Dispatcher::new(q.clone());
        let s = svc(serde_json::json!({ "dependent/enabled": "" }));
        d.on_update(&s, &s.clone());
        assert!(q.is_empty());

        d.on_update(&s, &svc(serde_json::json!({})));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn ingress_delete_respects_ownership() {
        let q = queue();
        let d = Dispatcher::new(q.clone());

        d.on_delete(&ingress(serde_json::json!([])));
        d.on_delete(&ingress(serde_json::json!([
            { "apiVersion": "apps/v1", "kind": "Deployment", "name": "web", "uid": "1", "controller": true }
        ])));
        d.on_delete(&ingress(serde_json::json!([
            { "apiVersion": "v1", "kind": "Service", "name": "web", "uid": "1" }
        ])));
        assert!(q.is_empty(), "foreign or non-controlling owners must not enqueue");

        d.on_delete(&ingress(serde_json::json!([
            { "apiVersion": "v1", "kind": "Service", "name": "web", "uid": "1", "controller": true }
        ])));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn ignored_callbacks_do_nothing() {
        let q = queue();
        let d = Dispatcher::new(q.clone());
        EventHandler::<Service>::on_delete(&d, &svc(serde_json::json!({})));
        EventHandler::<Ingress>::on_add(&d, &ingress(serde_json::json!([])));
        let i = ingress(serde_json::json!([]));
        EventHandler::<Ingress>::on_update(&d, &i, &i);
        assert!(q.is_empty());
    }

    #[test]
    fn unnamed_object_is_dropped() {
        let q = queue();
        let d = Dispatcher::new(q.clone());
        d.on_add(&Service::default());
        assert!(q.is_empty());
    }
}
