//! Typed object registry with lifecycle observers.
//!
//! Every configuration type of the core lives in one [`Store`]. Observers
//! are invoked synchronously after a mutation, in registration order, on the
//! caller's task; structural mutations are expected to be funneled through
//! the `management` serializer so observers see a consistent world.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// An object which can be kept in a [`Store`].
pub trait StoreObject: Send + Sync + 'static {
    /// Primary key of the object, unique within its store.
    fn id(&self) -> &str;
}

/// Observes the lifecycle of the objects of one store.
///
/// The default implementations ignore everything, implementors override
/// what they care about.
pub trait StoreObserver<T>: Send + Sync {
    fn created(&self, _object: &Arc<T>) {}
    fn updated(&self, _object: &Arc<T>, _old: &Arc<T>) {}
    fn deleted(&self, _object: &Arc<T>) {}
    /// The whole store was (re)loaded from the persistence layer.
    fn loaded(&self) {}
}

/// Registry of one object type.
pub struct Store<T> {
    objects: RwLock<HashMap<String, Arc<T>>>,
    observers: RwLock<Vec<Arc<dyn StoreObserver<T>>>>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }
}

impl<T: StoreObject> Store<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, observer: Arc<dyn StoreObserver<T>>) {
        self.observers.write().push(observer);
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.objects.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<T>> {
        self.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// All objects satisfying `predicate`.
    pub fn find<P>(&self, predicate: P) -> Vec<Arc<T>>
    where
        P: Fn(&T) -> bool,
    {
        self.objects
            .read()
            .values()
            .filter(|o| predicate(o))
            .cloned()
            .collect()
    }

    /// Insert or replace `object`, notifying created/updated observers.
    pub fn apply(&self, object: T) -> Arc<T> {
        let object = Arc::new(object);

        let old = self
            .objects
            .write()
            .insert(object.id().to_string(), object.clone());

        let observers = self.observers.read().clone();
        match old {
            Some(old) => {
                for observer in &observers {
                    observer.updated(&object, &old);
                }
            }
            None => {
                for observer in &observers {
                    observer.created(&object);
                }
            }
        }

        object
    }

    /// Remove the object with `id`, notifying deleted observers.
    ///
    /// Deleting an id twice is a no-op; observers run exactly once per
    /// stored object.
    pub fn delete(&self, id: &str) -> Option<Arc<T>> {
        let removed = self.objects.write().remove(id)?;

        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.deleted(&removed);
        }

        Some(removed)
    }

    /// Replace the whole content, notifying the loaded observers.
    ///
    /// Used at startup when the persistence layer hands over its snapshot;
    /// no created/deleted callbacks fire for the individual objects.
    pub fn load(&self, objects: Vec<T>) {
        let mut map = HashMap::with_capacity(objects.len());
        for object in objects {
            map.insert(object.id().to_string(), Arc::new(object));
        }

        *self.objects.write() = map;

        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.loaded();
        }
    }

    /// Remove every object satisfying `predicate` without observer
    /// callbacks. Boot-time cleanup only.
    pub fn retain_silently<P>(&self, predicate: P)
    where
        P: Fn(&T) -> bool,
    {
        self.objects.write().retain(|_, o| predicate(o));
    }
}
