//! Per-thread view of a cache manager: the generation snapshot taken at the
//! start of the unit of work and the values this thread may serve from it.
//!
//! Views are keyed by manager id so several managers can share a thread.
//! No borrow of the register outlives a single call here, so retrievers may
//! re-enter the cache.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// A type-erased value stamped with the generation it was computed at.
#[derive(Clone)]
pub(crate) struct CachedValue {
    pub value: Arc<dyn Any + Send + Sync>,
    pub generation: i64,
}

#[derive(Default)]
struct LocalView {
    snapshot: HashMap<String, i64>,
    values: HashMap<String, CachedValue>,
}

thread_local! {
    static VIEWS: RefCell<HashMap<u64, LocalView>> = RefCell::new(HashMap::new());
}

pub(crate) fn has_view(manager: u64) -> bool {
    VIEWS.with(|views| views.borrow().contains_key(&manager))
}

/// Freeze `snapshot` for the rest of the unit of work, seeding the local
/// copy with `values`.
pub(crate) fn install(
    manager: u64,
    snapshot: HashMap<String, i64>,
    values: HashMap<String, CachedValue>,
) {
    VIEWS.with(|views| {
        views
            .borrow_mut()
            .insert(manager, LocalView { snapshot, values });
    });
}

/// Generation of `id` in the frozen snapshot; absent ids are at 0.
pub(crate) fn snapshot_generation(manager: u64, id: &str) -> i64 {
    VIEWS.with(|views| {
        views
            .borrow()
            .get(&manager)
            .and_then(|view| view.snapshot.get(id).copied())
            .unwrap_or(0)
    })
}

/// The local value for `id` if it matches the snapshot.
pub(crate) fn lookup(manager: u64, id: &str) -> Option<CachedValue> {
    VIEWS.with(|views| {
        let views = views.borrow();
        let view = views.get(&manager)?;
        let expected = view.snapshot.get(id).copied().unwrap_or(0);
        view.values
            .get(id)
            .filter(|entry| entry.generation == expected)
            .cloned()
    })
}

/// Record `entry` as current for `id` on this thread.
pub(crate) fn store(manager: u64, id: &str, entry: CachedValue) {
    VIEWS.with(|views| {
        let mut views = views.borrow_mut();
        let view = views.entry(manager).or_default();
        view.snapshot.insert(id.to_string(), entry.generation);
        view.values.insert(id.to_string(), entry);
    });
}

pub(crate) fn forget(manager: u64, id: &str) {
    VIEWS.with(|views| {
        if let Some(view) = views.borrow_mut().get_mut(&manager) {
            view.values.remove(id);
        }
    });
}

pub(crate) fn reset(manager: u64) {
    VIEWS.with(|views| {
        views.borrow_mut().remove(&manager);
    });
}
