//! Dynamic watch multiplexer.
//!
//! Instances can manage arbitrary kinds; the reconciler registers a lazy
//! metadata-only watch for each kind the first time it shows up in a
//! managed list. Events map back to the instances referencing the changed
//! object and feed the controller's trigger queue. `start` must be called
//! before any `watch` so the queue handle exists.

use std::collections::HashSet;
use std::sync::Mutex;

use futures::channel::mpsc;
use futures::StreamExt;
use kube::api::Api;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery;
use kube::Client;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use tracing::{info, warn};

use crate::api::Instance;
use crate::error::{Error, Result};

type GvkKey = (String, String, String);
type Queue = mpsc::UnboundedSender<ObjectRef<Instance>>;

#[derive(Default)]
struct Inner {
    watched: HashSet<GvkKey>,
    queue: Option<Queue>,
}

enum Registration {
    AlreadyWatched,
    Start(Queue),
}

impl Inner {
    fn start(&mut self) -> mpsc::UnboundedReceiver<ObjectRef<Instance>> {
        let (tx, rx) = mpsc::unbounded();
        self.queue = Some(tx);
        rx
    }

    fn register(&mut self, key: GvkKey) -> Result<Registration> {
        if self.watched.contains(&key) {
            return Ok(Registration::AlreadyWatched);
        }
        let Some(queue) = self.queue.clone() else {
            return Err(Error::Other(anyhow::anyhow!(
                "dynamic sources not started yet"
            )));
        };
        self.watched.insert(key);
        Ok(Registration::Start(queue))
    }
}

pub struct DynamicSources {
    client: Client,
    store: Store<Instance>,
    inner: Mutex<Inner>,
}

impl DynamicSources {
    pub fn new(client: Client, store: Store<Instance>) -> Self {
        Self {
            client,
            store,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Capture the trigger queue. The returned stream feeds the controller.
    pub fn start(&self) -> impl futures::Stream<Item = ObjectRef<Instance>> {
        self.inner.lock().expect("watched-set lock").start()
    }

    /// Register a metadata-only watch for `gvk`; a no-op when the kind is
    /// already watched.
    pub async fn watch(&self, gvk: &GroupVersionKind) -> Result<()> {
        let key = (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone());
        let registration = self.inner.lock().expect("watched-set lock").register(key)?;
        let queue = match registration {
            Registration::AlreadyWatched => return Ok(()),
            Registration::Start(queue) => queue,
        };

        let (resource, _caps) = discovery::oneshot::pinned_kind(&self.client, gvk)
            .await
            .map_err(Error::Kube)?;
        info!(kind = %gvk.kind, group = %gvk.group, "starting dynamic watch for kind");

        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let store = self.store.clone();
        let gvk = gvk.clone();
        tokio::spawn(async move {
            let mut stream = kube_runtime::watcher::metadata_watcher(api, watcher::Config::default())
                .default_backoff()
                .applied_objects()
                .boxed();
            while let Some(event) = stream.next().await {
                let meta = match event {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(kind = %gvk.kind, "dynamic watch error: {e}");
                        continue;
                    }
                };
                let name = meta.metadata.name.clone().unwrap_or_default();
                let namespace = meta.metadata.namespace.clone().unwrap_or_default();
                for instance in store.state() {
                    let referenced = instance
                        .status
                        .as_ref()
                        .map(|s| {
                            s.resources.iter().any(|r| {
                                r.group_kind() == (gvk.group.as_str(), gvk.kind.as_str())
                                    && r.name == name
                                    && r.namespace == namespace
                            })
                        })
                        .unwrap_or(false);
                    if referenced {
                        let _ = queue.unbounded_send(ObjectRef::from_obj(&*instance));
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> GvkKey {
        ("apps".into(), "v1".into(), "Deployment".into())
    }

    #[test]
    fn register_before_start_is_an_error() {
        let mut inner = Inner::default();
        let err = inner.register(key()).err().unwrap();
        assert!(err.to_string().contains("not started"));
    }

    #[test]
    fn register_is_idempotent_per_kind() {
        let mut inner = Inner::default();
        let _rx = inner.start();
        assert!(matches!(inner.register(key()), Ok(Registration::Start(_))));
        assert!(matches!(
            inner.register(key()),
            Ok(Registration::AlreadyWatched)
        ));
    }
}
