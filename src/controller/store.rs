//! Records known to one controller

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kube::{Resource, ResourceExt};
use parking_lot::RwLock;

/// Identity of one record within a controller: namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Key of a namespaced object
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Key of any Kubernetes object
    pub fn from_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Latest known state of every record, keyed by [`ObjectKey`]
pub struct Store<K> {
    records: RwLock<HashMap<ObjectKey, Arc<K>>>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Resource> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    ///
    /// Objects carrying a deletion timestamp are terminal and removed instead.
    pub fn apply(&self, obj: K) -> ObjectKey {
        let key = ObjectKey::from_object(&obj);
        let mut records = self.records.write();
        if obj.meta().deletion_timestamp.is_some() {
            records.remove(&key);
        } else {
            records.insert(key.clone(), Arc::new(obj));
        }
        key
    }

    /// Remove a record
    pub fn delete(&self, obj: &K) -> ObjectKey {
        let key = ObjectKey::from_object(obj);
        self.records.write().remove(&key);
        key
    }

    /// Replace every record with a complete listing
    ///
    /// Returns the keys of records that were dropped, followed by the keys of
    /// the listed records.
    pub fn replace(&self, objects: impl IntoIterator<Item = K>) -> Vec<ObjectKey> {
        let fresh: HashMap<ObjectKey, Arc<K>> = objects
            .into_iter()
            .filter(|obj| obj.meta().deletion_timestamp.is_none())
            .map(|obj| (ObjectKey::from_object(&obj), Arc::new(obj)))
            .collect();

        let mut records = self.records.write();
        let mut keys: Vec<ObjectKey> = records
            .keys()
            .filter(|key| !fresh.contains_key(*key))
            .cloned()
            .collect();
        keys.extend(fresh.keys().cloned());
        *records = fresh;
        keys
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.records.read().get(key).cloned()
    }

    /// Keys of every known record
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.records.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
