//! Reconciled local copies of server-owned collections.
//!
//! A [`DomainCache`] holds `None` until its first load, then an ordered list
//! of entities behind an `Arc`. Every effective change publishes a fresh
//! `Arc` on a watch channel, so subscribers can detect change with
//! `Arc::ptr_eq`. Mutators are local and synchronous; only
//! [`DomainCache::refresh`] and [`DomainCache::perform`] touch the network.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    llamadash_protocol::Entity,
    serde::de::DeserializeOwned,
    serde_json::{Value, json},
    tokio::sync::watch,
    tracing::debug,
};

use crate::{Error, Result, rpc::Correlator};

/// Published state: `None` until loaded.
pub type Snapshot<T> = Option<Arc<Vec<T>>>;

/// Where a collection is listed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    /// Human name used in errors and logs.
    pub family: &'static str,
    pub list_event: &'static str,
    /// Field of the list result holding the entities.
    pub list_field: &'static str,
}

/// An out-of-band update, usually decoded from a broadcast.
pub enum Change<T: Entity> {
    Upsert(T),
    Patch(T::Id, T::Patch),
    PatchWhere(Box<dyn Fn(&T) -> bool + Send + Sync>, T::Patch),
    Remove(T::Id),
    Reset(Vec<T>),
}

pub struct DomainCache<T: Entity> {
    collection: Collection,
    rpc: Arc<Correlator>,
    state: watch::Sender<Snapshot<T>>,
    stale: AtomicBool,
}

impl<T: Entity> DomainCache<T> {
    pub fn new(collection: Collection, rpc: Arc<Correlator>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            collection,
            rpc,
            state,
            stale: AtomicBool::new(false),
        }
    }

    pub fn family(&self) -> &'static str {
        self.collection.family
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.state.subscribe()
    }

    pub fn get(&self, id: &T::Id) -> Option<T> {
        self.state
            .borrow()
            .as_deref()
            .and_then(|items| items.iter().find(|e| e.id() == id).cloned())
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.state
            .borrow()
            .as_deref()
            .is_some_and(|items| items.iter().any(|e| e.id() == id))
    }

    pub fn len(&self) -> usize {
        self.state.borrow().as_deref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the collection has been loaded or mutated at least once.
    pub fn is_loaded(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    /// Flag the data as possibly outdated, e.g. after a disconnect.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Relaxed);
    }

    /// Run `f` over the current items. `Some(next)` publishes `next`; `None`
    /// publishes nothing, except that an unloaded collection becomes empty.
    fn modify(&self, f: impl FnOnce(&[T]) -> Option<Vec<T>>) -> bool {
        self.state.send_if_modified(|state| {
            let current = state.as_deref().map_or(&[][..], Vec::as_slice);
            match f(current) {
                Some(next) => {
                    *state = Some(Arc::new(next));
                    true
                },
                None if state.is_none() => {
                    *state = Some(Arc::new(Vec::new()));
                    true
                },
                None => false,
            }
        })
    }

    /// Append an entity.
    pub fn add(&self, entity: T) {
        self.modify(|items| {
            let mut next = items.to_vec();
            next.push(entity);
            Some(next)
        });
    }

    /// Shallow-merge `patch` into the entity with `id`. Returns whether it
    /// was found; a missing id changes nothing.
    pub fn update(&self, id: &T::Id, patch: &T::Patch) -> bool {
        let mut found = false;
        self.modify(|items| {
            let index = items.iter().position(|e| e.id() == id)?;
            found = true;
            let mut next = items.to_vec();
            next[index].apply(patch);
            Some(next)
        });
        found
    }

    /// Patch every entity matching `pred`. Returns how many matched.
    pub fn update_where(&self, pred: impl Fn(&T) -> bool, patch: &T::Patch) -> usize {
        let mut count = 0;
        self.modify(|items| {
            let mut next = items.to_vec();
            for entity in next.iter_mut() {
                if pred(&*entity) {
                    entity.apply(patch);
                    count += 1;
                }
            }
            (count > 0).then_some(next)
        });
        count
    }

    /// Replace the entity with the same id, or append it when unseen.
    ///
    /// When both sides carry a version, an incoming entity older than the
    /// cached one is ignored and `false` is returned.
    pub fn upsert(&self, entity: T) -> bool {
        let mut applied = false;
        self.modify(|items| {
            let mut next = items.to_vec();
            match items.iter().position(|e| e.id() == entity.id()) {
                Some(index) if is_older(&entity, &items[index]) => return None,
                Some(index) => next[index] = entity,
                None => next.push(entity),
            }
            applied = true;
            Some(next)
        });
        applied
    }

    /// Upsert at the head of the list and keep at most `capacity` items.
    pub fn upsert_front(&self, entity: T, capacity: usize) -> bool {
        let mut applied = false;
        self.modify(|items| {
            let mut next = items.to_vec();
            match items.iter().position(|e| e.id() == entity.id()) {
                Some(index) if is_older(&entity, &items[index]) => return None,
                Some(index) => next[index] = entity,
                None => next.insert(0, entity),
            }
            next.truncate(capacity);
            applied = true;
            Some(next)
        });
        applied
    }

    /// Remove the entity with `id`. Returns whether it was present.
    pub fn remove(&self, id: &T::Id) -> bool {
        let mut removed = false;
        self.modify(|items| {
            let index = items.iter().position(|e| e.id() == id)?;
            removed = true;
            let mut next = items.to_vec();
            next.remove(index);
            Some(next)
        });
        removed
    }

    /// Replace the whole collection.
    pub fn replace_all(&self, items: Vec<T>) {
        self.state.send_replace(Some(Arc::new(items)));
    }

    pub fn apply(&self, change: Change<T>) -> bool {
        match change {
            Change::Upsert(entity) => self.upsert(entity),
            Change::Patch(id, patch) => self.update(&id, &patch),
            Change::PatchWhere(pred, patch) => self.update_where(pred, &patch) > 0,
            Change::Remove(id) => self.remove(&id),
            Change::Reset(items) => {
                self.replace_all(items);
                true
            },
        }
    }

    /// Issue an entity-scoped request. Fails with `NotFound`, without
    /// sending anything, when `id` is not in the local collection.
    pub async fn perform(&self, id: &T::Id, event: &str, payload: Value) -> Result<Value> {
        if !self.contains(id) {
            return Err(Error::not_found(self.collection.family, id));
        }
        self.rpc.request(event, payload).await
    }

    pub fn rpc(&self) -> &Arc<Correlator> {
        &self.rpc
    }
}

impl<T: Entity + DeserializeOwned> DomainCache<T> {
    /// Replace the collection with the server's list.
    pub async fn refresh(&self) -> Result<Arc<Vec<T>>> {
        self.refresh_with(json!({})).await
    }

    pub async fn refresh_with(&self, payload: Value) -> Result<Arc<Vec<T>>> {
        let data = self.rpc.request(self.collection.list_event, payload).await?;
        let items: Vec<T> = match data.get(self.collection.list_field) {
            None | Some(Value::Null) => Vec::new(),
            Some(list) => serde_json::from_value(list.clone())?,
        };
        let items = Arc::new(items);
        self.state.send_replace(Some(Arc::clone(&items)));
        self.stale.store(false, Ordering::Relaxed);
        debug!(family = self.collection.family, count = items.len(), "refreshed");
        Ok(items)
    }
}

fn is_older<T: Entity>(incoming: &T, cached: &T) -> bool {
    matches!((incoming.version(), cached.version()), (Some(new), Some(old)) if new < old)
}
