use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque handles injected into evaluation logic (clients, adapters, paths).
///
/// The scheduler never inspects them; their lifecycle belongs to whoever
/// built the registry.
#[derive(Clone, Default)]
pub struct Resources {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.entries.insert(key.into(), Arc::new(value));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Typed lookup. `None` if the key is missing or holds another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = Arc::clone(self.entries.get(key)?);
        entry.downcast::<T>().ok()
    }

    /// Only the keys a sensor declared; evaluations see nothing else.
    pub fn scoped(&self, keys: &[String]) -> Self {
        let entries = keys
            .iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k.clone(), Arc::clone(v))))
            .collect();
        Self { entries }
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("Resources").field("keys", &keys).finish()
    }
}
