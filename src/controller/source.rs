//! List/watch sources feeding a controller

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use kube::{
    api::ListParams,
    runtime::{watcher, WatchStreamExt},
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Change notification for one object
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    /// Object was added or updated
    Applied(K),
    /// Object was deleted
    Deleted(K),
    /// The watch re-listed; these are every object that currently exists
    Restarted(Vec<K>),
}

/// Initial listing plus an ordered stream of changes for one resource kind
#[async_trait]
pub trait ListWatch<K>: Send + Sync {
    /// List every object currently stored
    async fn list(&self) -> Result<Vec<K>>;

    /// Stream changes from now on
    ///
    /// Events may be duplicated or dropped; the controller's resync
    /// compensates for missed ones.
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// [`ListWatch`] over the Kubernetes API
pub struct KubeSource<K> {
    api: Api<K>,
    label_selector: Option<String>,
}

impl<K> KubeSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Watch the kind across all namespaces
    pub fn all(client: Client) -> Self {
        Self {
            api: Api::all(client),
            label_selector: None,
        }
    }

    /// Only list and watch objects matching a label selector
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    fn watcher_config(&self) -> watcher::Config {
        match &self.label_selector {
            Some(selector) => watcher::Config::default().labels(selector),
            None => watcher::Config::default(),
        }
    }
}

#[async_trait]
impl<K> ListWatch<K> for KubeSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Vec<K>> {
        let params = match &self.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        Ok(self.api.list(&params).await?.items)
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        watcher(self.api.clone(), self.watcher_config())
            .default_backoff()
            .scan(None::<Vec<K>>, |relist, event| {
                let event = match event {
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent::Applied(obj))),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    // A re-list sends no deletes; collect it and let the store prune
                    Ok(watcher::Event::Init) => {
                        *relist = Some(Vec::new());
                        None
                    }
                    Ok(watcher::Event::InitApply(obj)) => match relist {
                        Some(objects) => {
                            objects.push(obj);
                            None
                        }
                        None => Some(Ok(WatchEvent::Applied(obj))),
                    },
                    Ok(watcher::Event::InitDone) => relist
                        .take()
                        .map(|objects| Ok(WatchEvent::Restarted(objects))),
                    Err(e) => Some(Err(e.into())),
                };
                future::ready(Some(event))
            })
            .filter_map(future::ready)
            .boxed()
    }
}
