//! Ingressor kubehub: watcher/reflector wiring and the kube-backed Ingress
//! store. These are the collaborators the reconciliation core consumes.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use ingressor_core::{DependentStore, Error, EventHandler, Lister};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{Api, DeleteParams, PostParams},
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connect using the local kubeconfig, falling back to in-cluster config.
pub async fn connect() -> Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster)")
}

/// Keeps a reflector store current and fans watcher events out to handlers
/// as add/update/delete callbacks. The store is updated before handlers run,
/// so a handler that enqueues work sees the new state through its lister.
pub struct Reflector<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    reader: Store<K>,
    writer: Writer<K>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
    synced: watch::Sender<bool>,
}

impl<K> Reflector<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new() -> Self {
        let (reader, writer) = reflector::store();
        let (synced, _) = watch::channel(false);
        Self { reader, writer, handlers: Vec::new(), synced }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    pub fn lister(&self) -> StoreLister<K> { StoreLister { store: self.reader.clone() } }

    /// Flips to `true` once the first full list has been applied.
    pub fn synced(&self) -> watch::Receiver<bool> { self.synced.subscribe() }

    pub fn apply(&mut self, event: Event<K>) {
        match &event {
            Event::Applied(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                match old {
                    Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, obj)),
                    None => self.handlers.iter().for_each(|h| h.on_add(obj)),
                }
            }
            Event::Deleted(obj) => {
                self.writer.apply_watcher_event(&event);
                self.handlers.iter().for_each(|h| h.on_delete(obj));
            }
            Event::Restarted(list) => {
                let mut previous: HashMap<ObjectRef<K>, Arc<K>> =
                    self.reader.state().into_iter().map(|o| (ObjectRef::from_obj(o.as_ref()), o)).collect();
                self.writer.apply_watcher_event(&event);
                for obj in list {
                    match previous.remove(&ObjectRef::from_obj(obj)) {
                        Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, obj)),
                        None => self.handlers.iter().for_each(|h| h.on_add(obj)),
                    }
                }
                // vanished while the watch was down
                for gone in previous.into_values() {
                    self.handlers.iter().for_each(|h| h.on_delete(&gone));
                }
                debug!(count = list.len(), "relist applied");
                self.synced.send_replace(true);
            }
        }
    }
}

impl<K> Default for Reflector<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn default() -> Self { Self::new() }
}

/// A `Reflector` fed by a kube watcher on one collection.
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    api: Api<K>,
    reflector: Reflector<K>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new(api: Api<K>) -> Self { Self { api, reflector: Reflector::new() } }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<K>>) { self.reflector.add_handler(handler) }

    pub fn lister(&self) -> StoreLister<K> { self.reflector.lister() }

    pub fn synced(&self) -> watch::Receiver<bool> { self.reflector.synced() }

    /// List+watch until the stream ends. Watch errors are logged and retried
    /// with the watcher's default backoff.
    pub async fn run(mut self) {
        let kind = K::kind(&K::DynamicType::default()).into_owned();
        let stream = watcher::watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);
        info!(kind = %kind, "informer started");
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(ev) => {
                    metrics::counter!("informer_events_total", 1u64, "kind" => kind.clone());
                    self.reflector.apply(ev);
                }
                Err(e) => warn!(kind = %kind, error = %e, "watch error; backing off"),
            }
        }
        warn!(kind = %kind, "watcher stream ended");
    }
}

/// Wait until every receiver reports synced, or fail after `timeout`.
pub async fn wait_for_cache_sync(receivers: Vec<watch::Receiver<bool>>, timeout: Duration) -> Result<()> {
    let all = futures::future::try_join_all(receivers.into_iter().map(|mut rx| async move {
        rx.wait_for(|synced| *synced).await.map(|_| ())
    }));
    match tokio::time::timeout(timeout, all).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(anyhow!("informer stopped before its cache synced")),
        Err(_) => Err(anyhow!("timed out after {:?} waiting for caches to sync", timeout)),
    }
}

/// `Lister` over a reflector store.
pub struct StoreLister<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store: Store<K>,
}

impl<K> StoreLister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    /// Every cached object, in no particular order.
    pub fn list(&self) -> Vec<Arc<K>> { self.store.state() }
}

impl<K> Lister<K> for StoreLister<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn get(&self, namespace: &str, name: &str) -> ingressor_core::Result<Option<Arc<K>>> {
        let mut r = ObjectRef::new(name);
        if !namespace.is_empty() {
            r = r.within(namespace);
        }
        Ok(self.store.get(&r))
    }
}

/// Creates and deletes Ingresses through the API server.
pub struct KubeIngressStore {
    client: Client,
}

impl KubeIngressStore {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl DependentStore for KubeIngressStore {
    async fn create(&self, namespace: &str, ingress: &Ingress) -> ingressor_core::Result<Ingress> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        api.create(&PostParams::default(), ingress)
            .await
            .map_err(|e| map_kube_error(e, &format!("{}/{}", namespace, name)))
    }

    async fn delete(&self, namespace: &str, name: &str) -> ingressor_core::Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e, &format!("{}/{}", namespace, name)))
    }
}

/// Classify API errors: 409 AlreadyExists and 404 are distinguished, the
/// rest count as transient store failures.
pub fn map_kube_error(err: kube::Error, what: &str) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => Error::AlreadyExists(what.to_string()),
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(what.to_string()),
        other => Error::Store(format!("{}: {}", what, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use kube::core::ErrorResponse;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> { std::mem::take(&mut *self.seen.lock().unwrap()) }
    }

    impl EventHandler<Service> for Recorder {
        fn on_add(&self, obj: &Service) {
            self.seen.lock().unwrap().push(format!("add {}", obj.metadata.name.clone().unwrap()));
        }
        fn on_update(&self, old: &Service, new: &Service) {
            let same = if old == new { "same" } else { "changed" };
            self.seen.lock().unwrap().push(format!("update {} {}", new.metadata.name.clone().unwrap(), same));
        }
        fn on_delete(&self, obj: &Service) {
            self.seen.lock().unwrap().push(format!("delete {}", obj.metadata.name.clone().unwrap()));
        }
    }

    fn svc(name: &str, rv: &str) -> Service {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name, "namespace": "default", "resourceVersion": rv }
        }))
        .unwrap()
    }

    fn reflector() -> (Reflector<Service>, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let mut r = Reflector::new();
        r.add_handler(rec.clone());
        (r, rec)
    }

    #[test]
    fn applied_becomes_add_then_update() {
        let (mut r, rec) = reflector();
        r.apply(Event::Applied(svc("web", "1")));
        r.apply(Event::Applied(svc("web", "2")));
        assert_eq!(rec.take(), vec!["add web", "update web changed"]);
        let cached = r.lister().get("default", "web").unwrap().unwrap();
        assert_eq!(cached.metadata.resource_version.as_deref(), Some("2"));
    }

    #[test]
    fn deleted_removes_from_cache() {
        let (mut r, rec) = reflector();
        r.apply(Event::Applied(svc("web", "1")));
        r.apply(Event::Deleted(svc("web", "1")));
        assert_eq!(rec.take(), vec!["add web", "delete web"]);
        assert!(r.lister().get("default", "web").unwrap().is_none());
    }

    #[test]
    fn relist_diffs_against_cache_and_marks_synced() {
        let (mut r, rec) = reflector();
        let synced = r.synced();
        assert!(!*synced.borrow());

        r.apply(Event::Restarted(vec![svc("a", "1"), svc("b", "1")]));
        assert!(*synced.borrow());
        let mut first = rec.take();
        first.sort();
        assert_eq!(first, vec!["add a", "add b"]);

        // b vanished, a is unchanged, c is new
        r.apply(Event::Restarted(vec![svc("a", "1"), svc("c", "1")]));
        let mut second = rec.take();
        second.sort();
        assert_eq!(second, vec!["add c", "delete b", "update a same"]);
        assert!(r.lister().get("default", "b").unwrap().is_none());
    }

    #[test]
    fn store_lister_misses_other_namespaces() {
        let (mut r, _rec) = reflector();
        r.apply(Event::Applied(svc("web", "1")));
        assert!(r.lister().get("default", "web").unwrap().is_some());
        assert!(r.lister().get("kube-system", "web").unwrap().is_none());
        assert!(r.lister().get("", "web").unwrap().is_none());
        assert_eq!(r.lister().list().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_sync_waits_for_every_informer() {
        let (tx_a, rx_a) = watch::channel(false);
        let (tx_b, rx_b) = watch::channel(false);
        tx_a.send_replace(true);
        let err = wait_for_cache_sync(vec![rx_a.clone(), rx_b.clone()], Duration::from_secs(1)).await;
        assert!(err.is_err());

        tx_b.send_replace(true);
        wait_for_cache_sync(vec![rx_a, rx_b], Duration::from_secs(1)).await.unwrap();
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "boom".into(), reason: reason.into(), code })
    }

    #[test]
    fn kube_errors_are_classified() {
        assert_eq!(map_kube_error(api_error(409, "AlreadyExists"), "default/web"), Error::AlreadyExists("default/web".into()));
        assert_eq!(map_kube_error(api_error(404, "NotFound"), "default/web"), Error::NotFound("default/web".into()));
        assert!(matches!(map_kube_error(api_error(409, "Conflict"), "default/web"), Error::Store(_)));
        assert!(matches!(map_kube_error(api_error(500, "InternalError"), "default/web"), Error::Store(_)));
    }
}
