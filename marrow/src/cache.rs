//! Keyed stores of asset futures with bounded capacity and strict LRU
//! eviction.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use marrow_types::{hash_combine, hash_str, FastBuildHasher};
use parking_lot::{Condvar, Mutex};

use crate::deform::DeformOperationFactory;
use crate::gpu::PipelineAcceleratorPool;
use crate::renderer::SimpleModelRenderer;
use crate::scaffold::{MaterialScaffold, ModelScaffold};

/// Externally visible state of an asset future.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssetState {
    Pending,
    Ready,
    Invalid,
}

type PollingFn<T> = Box<dyn FnMut(&AssetFuture<T>) -> bool + Send>;

enum FutureState<T> {
    Pending(Option<PollingFn<T>>),
    Ready(Arc<T>),
    Invalid(String),
}

/// A single-assignment future with explicit try-actualize semantics.
///
/// The value arrives either through [`set_value`](Self::set_value) /
/// [`set_invalid`](Self::set_invalid) from a worker thread, or through a
/// polling function that a consumer drives. There is no general scheduler;
/// callers either poll or join.
pub struct AssetFuture<T> {
    state: Mutex<FutureState<T>>,
    condvar: Condvar,
    initializer: String,
}

impl<T> AssetFuture<T> {
    pub fn new(initializer: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(FutureState::Pending(None)),
            condvar: Condvar::new(),
            initializer: initializer.into(),
        }
    }

    /// The name this future was requested under; for diagnostics.
    pub fn initializer(&self) -> &str {
        &self.initializer
    }

    pub fn state(&self) -> AssetState {
        match &*self.state.lock() {
            FutureState::Pending(_) => AssetState::Pending,
            FutureState::Ready(_) => AssetState::Ready,
            FutureState::Invalid(_) => AssetState::Invalid,
        }
    }

    /// Attach the function that will complete this future when polled.
    pub fn set_polling_function(&self, polling: impl FnMut(&AssetFuture<T>) -> bool + Send + 'static) {
        let mut state = self.state.lock();
        if let FutureState::Pending(slot) = &mut *state {
            *slot = Some(Box::new(polling));
        }
    }

    pub fn set_value(&self, value: T) {
        *self.state.lock() = FutureState::Ready(Arc::new(value));
        self.condvar.notify_all();
    }

    pub fn set_invalid(&self, diagnostic: impl Into<String>) {
        *self.state.lock() = FutureState::Invalid(diagnostic.into());
        self.condvar.notify_all();
    }

    /// Drive the polling function once, if one is attached. The function is
    /// taken out of the state for the duration of the call so it can
    /// complete the future itself.
    pub fn poll(&self) {
        let polling = {
            let mut state = self.state.lock();
            match &mut *state {
                FutureState::Pending(slot) => slot.take(),
                _ => None,
            }
        };
        if let Some(mut polling) = polling {
            let complete = polling(self);
            if !complete {
                let mut state = self.state.lock();
                if let FutureState::Pending(slot) = &mut *state {
                    *slot = Some(polling);
                }
            }
        }
    }

    /// The value, if ready right now. Drives the polling function once.
    pub fn try_actualize(&self) -> Option<Arc<T>> {
        self.poll();
        match &*self.state.lock() {
            FutureState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Block until the future resolves, driving the polling function.
    pub fn actualize(&self) -> Result<Arc<T>, String> {
        loop {
            self.poll();
            let mut state = self.state.lock();
            match &*state {
                FutureState::Ready(value) => return Ok(value.clone()),
                FutureState::Invalid(diagnostic) => return Err(diagnostic.clone()),
                FutureState::Pending(slot) => {
                    if slot.is_some() {
                        // a polling function is attached; loop and drive it
                        drop(state);
                        continue;
                    }
                    // completion will come from another thread
                    self.condvar
                        .wait_for(&mut state, Duration::from_millis(50));
                }
            }
        }
    }

    pub fn actualization_log(&self) -> Option<String> {
        match &*self.state.lock() {
            FutureState::Invalid(diagnostic) => Some(diagnostic.clone()),
            _ => None,
        }
    }
}

struct LruInner<T> {
    capacity: usize,
    entries: IndexMap<u64, Arc<AssetFuture<T>>, FastBuildHasher>,
}

impl<T> LruInner<T> {
    /// Look up and mark as most recently used.
    fn touch(&mut self, key: u64) -> Option<Arc<AssetFuture<T>>> {
        let entry = self.entries.shift_remove(&key)?;
        self.entries.insert(key, entry.clone());
        Some(entry)
    }

    fn insert(&mut self, key: u64, value: Arc<AssetFuture<T>>) {
        if self.entries.len() >= self.capacity {
            // front of the insertion-ordered map is least recently used
            if let Some((&evicted, _)) = self.entries.first() {
                log::debug!("evicting asset future {:#x} from LRU heap", evicted);
                self.entries.shift_remove(&evicted);
            }
        }
        self.entries.insert(key, value);
    }
}

/// A keyed store of futures with bounded capacity.
///
/// The mutex is held only across map lookup and insertion; construction of
/// the future's value always happens outside the lock. Concurrent gets for
/// the same key return the same future.
pub struct AssetLruHeap<T> {
    lock: Mutex<LruInner<T>>,
}

impl<T> AssetLruHeap<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            lock: Mutex::new(LruInner {
                capacity,
                entries: IndexMap::default(),
            }),
        }
    }

    /// Fetch the future for `key`, creating it with `construct` when absent
    /// or invalidated. `construct` runs outside the heap lock. Returns the
    /// future and whether an invalidated entry was replaced.
    pub fn get_or_create(
        &self,
        key: u64,
        initializer: &str,
        construct: impl FnOnce(&Arc<AssetFuture<T>>),
    ) -> (Arc<AssetFuture<T>>, bool) {
        let (future, replaced_invalid) = {
            let mut inner = self.lock.lock();
            if let Some(existing) = inner.touch(key) {
                if existing.state() != AssetState::Invalid {
                    return (existing, false);
                }
                let future = Arc::new(AssetFuture::new(initializer));
                inner.insert(key, future.clone());
                (future, true)
            } else {
                let future = Arc::new(AssetFuture::new(initializer));
                inner.insert(key, future.clone());
                (future, false)
            }
        };

        construct(&future);
        (future, replaced_invalid)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.lock.lock().entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.lock.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.lock.lock().entries.clear();
    }
}

/// Configuration for [`ModelCache`] capacities.
#[derive(Debug, Clone, Copy)]
pub struct ModelCacheConfig {
    pub model_scaffold_count: usize,
    pub material_scaffold_count: usize,
    pub renderer_count: usize,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            model_scaffold_count: 2000,
            material_scaffold_count: 2000,
            renderer_count: 200,
        }
    }
}

/// Caches model and material scaffolds plus the renderers composed from
/// them, keyed by filename.
pub struct ModelCache {
    model_scaffolds: AssetLruHeap<ModelScaffold>,
    material_scaffolds: AssetLruHeap<MaterialScaffold>,
    renderers: AssetLruHeap<SimpleModelRenderer>,
    pipeline_accelerator_pool: Arc<PipelineAcceleratorPool>,
    reload_id: std::sync::atomic::AtomicU32,
}

impl ModelCache {
    pub fn new(pipeline_accelerator_pool: Arc<PipelineAcceleratorPool>, config: ModelCacheConfig) -> Self {
        Self {
            model_scaffolds: AssetLruHeap::new(config.model_scaffold_count),
            material_scaffolds: AssetLruHeap::new(config.material_scaffold_count),
            renderers: AssetLruHeap::new(config.renderer_count),
            pipeline_accelerator_pool,
            reload_id: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Monotonically increasing count of invalidated cache entries that
    /// have been replaced. Consumers watch this to drop stale references.
    pub fn reload_id(&self) -> u32 {
        self.reload_id.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_model_scaffold(&self, model_filename: &str) -> Arc<AssetFuture<ModelScaffold>> {
        let key = hash_str(model_filename);
        let filename = model_filename.to_string();
        let (future, _) = self.model_scaffolds.get_or_create(key, model_filename, |future| {
            let mut load = Some(filename);
            future.set_polling_function(move |future| {
                let filename = load.take().expect("polling after completion");
                match ModelScaffold::load(&filename) {
                    Ok(scaffold) => future.set_value(scaffold),
                    Err(error) => future.set_invalid(format!("{}: {}", filename, error)),
                }
                true
            });
        });
        future
    }

    pub fn get_material_scaffold(
        &self,
        material_filename: &str,
    ) -> Arc<AssetFuture<MaterialScaffold>> {
        let key = hash_str(material_filename);
        let filename = material_filename.to_string();
        let (future, _) =
            self.material_scaffolds
                .get_or_create(key, material_filename, |future| {
                    let mut load = Some(filename);
                    future.set_polling_function(move |future| {
                        let filename = load.take().expect("polling after completion");
                        match MaterialScaffold::load(&filename) {
                            Ok(scaffold) => future.set_value(scaffold),
                            Err(error) => {
                                future.set_invalid(format!("{}: {}", filename, error))
                            }
                        }
                        true
                    });
                });
        future
    }

    /// Fetch (or begin constructing) the renderer for a `(model, material)`
    /// pair. The returned future completes once both scaffolds have loaded
    /// and the renderer build-up has run.
    pub fn get_model_renderer(
        &self,
        model_filename: &str,
        material_filename: &str,
        deform_operations: &str,
    ) -> Arc<AssetFuture<SimpleModelRenderer>> {
        let key = hash_combine(hash_str(material_filename), hash_str(model_filename));
        let initializer = format!("{}&{}", model_filename, material_filename);

        let (future, replaced_invalid) =
            self.renderers.get_or_create(key, &initializer, |future| {
                let model_future = self.get_model_scaffold(model_filename);
                let material_future = self.get_material_scaffold(material_filename);
                let pool = self.pipeline_accelerator_pool.clone();
                let deform_operations = deform_operations.to_string();

                future.set_polling_function(move |future| {
                    // wait for both scaffolds; invalid inputs poison us
                    for state in [model_future.state(), material_future.state()] {
                        if state == AssetState::Invalid {
                            future.set_invalid(
                                model_future
                                    .actualization_log()
                                    .or_else(|| material_future.actualization_log())
                                    .unwrap_or_else(|| "scaffold invalid".to_string()),
                            );
                            return true;
                        }
                    }
                    let model = match model_future.try_actualize() {
                        Some(model) => model,
                        None => return false,
                    };
                    let material = match material_future.try_actualize() {
                        Some(material) => material,
                        None => return false,
                    };

                    let deform_ops = match DeformOperationFactory::global()
                        .create_deform_operations(&deform_operations, &model)
                    {
                        Ok(ops) => ops,
                        Err(error) => {
                            future.set_invalid(error.to_string());
                            return true;
                        }
                    };

                    match SimpleModelRenderer::new(&pool, model, material, deform_ops, Vec::new())
                    {
                        Ok(renderer) => future.set_value(renderer),
                        Err(error) => future.set_invalid(error.to_string()),
                    }
                    true
                });
            });

        if replaced_invalid {
            self.reload_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        future
    }
}

#[allow(unused)]
fn assert_traits() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<AssetFuture<ModelScaffold>>();
    is_send_sync::<AssetLruHeap<ModelScaffold>>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_least_recently_touched() {
        let heap: AssetLruHeap<u32> = AssetLruHeap::new(2);
        let key = |name: &str| hash_str(name);

        heap.get_or_create(key("a"), "a", |f| f.set_value(1));
        heap.get_or_create(key("b"), "b", |f| f.set_value(2));
        // touch A so B becomes least recently used
        heap.get_or_create(key("a"), "a", |_| panic!("A should be cached"));
        heap.get_or_create(key("c"), "c", |f| f.set_value(3));

        assert!(heap.contains(key("a")));
        assert!(!heap.contains(key("b")));
        assert!(heap.contains(key("c")));
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn same_key_returns_same_future() {
        let heap: AssetLruHeap<u32> = AssetLruHeap::new(4);
        let (first, _) = heap.get_or_create(7, "seven", |_| {});
        let (second, _) = heap.get_or_create(7, "seven", |_| panic!("should not construct"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn invalidated_entries_are_replaced() {
        let heap: AssetLruHeap<u32> = AssetLruHeap::new(4);
        let (first, replaced) = heap.get_or_create(7, "seven", |f| f.set_invalid("broken"));
        assert!(!replaced);
        assert_eq!(first.state(), AssetState::Invalid);

        let (second, replaced) = heap.get_or_create(7, "seven", |f| f.set_value(9));
        assert!(replaced);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.try_actualize().as_deref(), Some(&9));
    }

    #[test]
    fn polling_function_completes_future() {
        let future = AssetFuture::<u32>::new("poll");
        future.set_polling_function(|f| {
            f.set_value(42);
            true
        });
        assert_eq!(future.state(), AssetState::Pending);
        assert_eq!(future.try_actualize().as_deref(), Some(&42));
    }

    #[test]
    fn actualize_joins_cross_thread_completion() {
        let future = Arc::new(AssetFuture::<u32>::new("join"));
        let worker_side = future.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            worker_side.set_value(5);
        });
        assert_eq!(future.actualize().unwrap().as_ref(), &5);
        worker.join().unwrap();
    }

    #[test]
    fn model_cache_composes_scaffolds_into_a_renderer() {
        use crate::test_util::{
            empty_model_record, write_material_scaffold_file, write_model_scaffold_file, MockDevice,
        };

        let device = MockDevice::new();
        let pool = Arc::new(PipelineAcceleratorPool::new(device));
        let cache = ModelCache::new(pool, ModelCacheConfig::default());

        let model_path = write_model_scaffold_file("cache", &empty_model_record(), None, Vec::new());
        let material_path =
            write_material_scaffold_file("cache", &marrow_types::MaterialImmutableRecord::default());

        let future = cache.get_model_renderer(
            model_path.to_str().unwrap(),
            material_path.to_str().unwrap(),
            "",
        );
        let renderer = future.actualize().expect("renderer should build");
        assert_eq!(renderer.deform_operation_count(), 0);
        assert_eq!(cache.reload_id(), 0);

        // a second request returns the same cached future
        let again = cache.get_model_renderer(
            model_path.to_str().unwrap(),
            material_path.to_str().unwrap(),
            "",
        );
        assert!(Arc::ptr_eq(&future, &again));
    }

    #[test]
    fn missing_model_invalidates_the_renderer_future() {
        use crate::test_util::{write_material_scaffold_file, MockDevice};

        let device = MockDevice::new();
        let pool = Arc::new(PipelineAcceleratorPool::new(device));
        let cache = ModelCache::new(pool, ModelCacheConfig::default());
        let material_path =
            write_material_scaffold_file("missing", &marrow_types::MaterialImmutableRecord::default());

        let future = cache.get_model_renderer(
            "/nonexistent/model.scaffold",
            material_path.to_str().unwrap(),
            "",
        );
        assert!(future.actualize().is_err());
        assert_eq!(future.state(), AssetState::Invalid);
    }

    #[test]
    fn incomplete_poll_retains_polling_function() {
        let future = AssetFuture::<u32>::new("retry");
        let mut attempts = 0;
        future.set_polling_function(move |f| {
            attempts += 1;
            if attempts < 3 {
                false
            } else {
                f.set_value(attempts);
                true
            }
        });
        assert!(future.try_actualize().is_none());
        assert!(future.try_actualize().is_none());
        assert_eq!(future.try_actualize().as_deref(), Some(&3));
    }
}
