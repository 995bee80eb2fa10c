//! Request-coalescing cache for expensive change computations
//!
//! Concurrent callers asking for the same key share one computation. The
//! computation runs detached from any single caller: a caller leaving only
//! aborts it when no other caller is still waiting. Successful results stay
//! cached until every [`CacheHandle`] has been released; failures are never
//! cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::context::Context;
use crate::error::{Result, SyncError};

type Outcome<V> = std::result::Result<V, Arc<SyncError>>;
type SharedCall<V> = Shared<BoxFuture<'static, Outcome<V>>>;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    // (cache id, key) of every computation on the current call chain
    static ACTIVE_CALLS: Vec<(u64, String)>;
}

enum Slot<V> {
    Pending {
        call_id: u64,
        waiters: usize,
        ctx: Context,
        call: SharedCall<V>,
    },
    Done {
        call_id: u64,
        value: V,
        ref_count: usize,
        waiters: usize,
    },
}

struct CacheInner<V> {
    id: u64,
    next_call: AtomicU64,
    slots: Mutex<HashMap<String, Slot<V>>>,
}

impl<V> CacheInner<V> {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        // Slot bookkeeping never panics while holding the lock
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A waiter stopped waiting before the call finished
    fn leave(&self, key: &str, id: u64, cause: SyncError) {
        let mut slots = self.slots();
        let remove = match slots.get_mut(key) {
            Some(Slot::Pending {
                call_id,
                waiters,
                ctx,
                ..
            }) if *call_id == id => {
                *waiters -= 1;
                if *waiters == 0 {
                    debug!(key, cause = %cause, "Last waiter left, cancelling computation");
                    ctx.cancel_with_cause(cause.to_string());
                    true
                } else {
                    false
                }
            }
            Some(Slot::Done {
                call_id,
                ref_count,
                waiters,
                ..
            }) if *call_id == id => {
                *waiters -= 1;
                *waiters == 0 && *ref_count == 0
            }
            _ => false,
        };
        if remove {
            slots.remove(key);
        }
    }

    /// A waiter observed a successful result and now holds a reference
    fn acquire(&self, key: &str, id: u64) {
        let mut slots = self.slots();
        if let Some(Slot::Done {
            call_id,
            ref_count,
            waiters,
            ..
        }) = slots.get_mut(key)
        {
            if *call_id == id {
                *waiters -= 1;
                *ref_count += 1;
            }
        }
    }

    fn release(&self, key: &str, id: u64) {
        let mut slots = self.slots();
        let remove = match slots.get_mut(key) {
            Some(Slot::Done {
                call_id,
                ref_count,
                waiters,
                ..
            }) if *call_id == id => {
                *ref_count = ref_count.saturating_sub(1);
                *ref_count == 0 && *waiters == 0
            }
            _ => false,
        };
        if remove {
            debug!(key, "Releasing cached changes");
            slots.remove(key);
        }
    }
}

impl<V: Clone> CacheInner<V> {
    /// Called by the computation task itself once it has an outcome
    fn complete(&self, key: &str, id: u64, outcome: &Outcome<V>) {
        let mut slots = self.slots();
        let waiters = match slots.get(key) {
            Some(Slot::Pending { call_id, waiters, .. }) if *call_id == id => *waiters,
            _ => return,
        };
        match outcome {
            Ok(value) => {
                slots.insert(
                    key.to_string(),
                    Slot::Done {
                        call_id: id,
                        value: value.clone(),
                        ref_count: 0,
                        waiters,
                    },
                );
            }
            Err(e) => {
                debug!(key, error = %e, "Computation failed, not caching");
                slots.remove(key);
            }
        }
    }
}

/// Undoes a waiter registration if the waiting future is dropped or cancelled
struct WaiterGuard<'a, V> {
    inner: &'a CacheInner<V>,
    key: &'a str,
    call_id: u64,
    armed: bool,
}

impl<V> WaiterGuard<'_, V> {
    fn leave(&mut self, cause: SyncError) {
        if self.armed {
            self.armed = false;
            self.inner.leave(self.key, self.call_id, cause);
        }
    }
}

impl<V> Drop for WaiterGuard<'_, V> {
    fn drop(&mut self) {
        self.leave(SyncError::Cancelled("waiter dropped".to_string()));
    }
}

/// Deduplicates concurrent computations by key
pub struct ChangeCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for ChangeCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for ChangeCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> ChangeCache<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
                next_call: AtomicU64::new(1),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of keys currently pending or cached
    pub fn len(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the value cached for `key`, computing it with `f` if needed.
    ///
    /// `f` receives a context that is only cancelled once every caller
    /// waiting on it has gone away.
    pub async fn get_or_init<F, Fut>(&self, ctx: &Context, key: &str, f: F) -> Result<CacheHandle<V>>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if key.is_empty() {
            return Err(SyncError::CacheKey("key must not be empty".to_string()));
        }
        let recursive = ACTIVE_CALLS
            .try_with(|calls| calls.iter().any(|(id, k)| *id == self.inner.id && k == key))
            .unwrap_or(false);
        if recursive {
            return Err(SyncError::RecursiveCall { key: key.to_string() });
        }

        let (call_id, call, hit_cache) = {
            let mut slots = self.inner.slots();
            match slots.get_mut(key) {
                Some(Slot::Done {
                    call_id,
                    value,
                    ref_count,
                    ..
                }) => {
                    *ref_count += 1;
                    debug!(key, "Change cache hit");
                    return Ok(CacheHandle {
                        inner: Arc::clone(&self.inner),
                        key: key.to_string(),
                        call_id: *call_id,
                        value: value.clone(),
                        hit_cache: true,
                    });
                }
                Some(Slot::Pending {
                    call_id,
                    waiters,
                    call,
                    ..
                }) => {
                    *waiters += 1;
                    (*call_id, call.clone(), call.peek().is_some())
                }
                None => {
                    let call_id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
                    let call_ctx = Context::new();
                    let call = self.start(key, call_id, call_ctx.clone(), f);
                    slots.insert(
                        key.to_string(),
                        Slot::Pending {
                            call_id,
                            waiters: 1,
                            ctx: call_ctx,
                            call: call.clone(),
                        },
                    );
                    (call_id, call, false)
                }
            }
        };

        let mut guard = WaiterGuard {
            inner: &self.inner,
            key,
            call_id,
            armed: true,
        };
        let outcome = tokio::select! {
            outcome = call => outcome,
            _ = ctx.cancelled() => {
                guard.leave(ctx.cause());
                return Err(ctx.cause());
            }
        };
        guard.armed = false;

        match outcome {
            Ok(value) => {
                self.inner.acquire(key, call_id);
                Ok(CacheHandle {
                    inner: Arc::clone(&self.inner),
                    key: key.to_string(),
                    call_id,
                    value,
                    hit_cache,
                })
            }
            Err(e) => Err(SyncError::Shared(e)),
        }
    }

    /// Cache `value` under `key` unless a value is already present or pending
    pub async fn get_or_init_value(&self, ctx: &Context, key: &str, value: V) -> Result<CacheHandle<V>> {
        self.get_or_init(ctx, key, move |_| async move { Ok(value) }).await
    }

    fn start<F, Fut>(&self, key: &str, call_id: u64, call_ctx: Context, f: F) -> SharedCall<V>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut active = ACTIVE_CALLS.try_with(|calls| calls.clone()).unwrap_or_default();
        active.push((self.inner.id, key.to_string()));

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        debug!(key, call_id, "Starting change computation");

        let task = tokio::spawn(ACTIVE_CALLS.scope(active, async move {
            let fut = f(call_ctx.clone());
            let outcome = tokio::select! {
                result = fut => result.map_err(Arc::new),
                _ = call_ctx.cancelled() => Err(Arc::new(call_ctx.cause())),
            };
            inner.complete(&owned_key, call_id, &outcome);
            outcome
        }));

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // A panicking computation never reached `complete`
                    let outcome = Err(Arc::new(SyncError::Cancelled(format!("computation task failed: {}", e))));
                    inner.complete(&owned_key, call_id, &outcome);
                    outcome
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// A reference to a cached value. Dropping or releasing the last handle for
/// a key evicts it.
pub struct CacheHandle<V> {
    inner: Arc<CacheInner<V>>,
    key: String,
    call_id: u64,
    value: V,
    hit_cache: bool,
}

impl<V> CacheHandle<V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the value was already computed when this handle was requested
    pub fn hit_cache(&self) -> bool {
        self.hit_cache
    }

    /// Give up this reference
    pub fn release(self) {
        drop(self)
    }
}

impl<V> Drop for CacheHandle<V> {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.call_id);
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for CacheHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("hit_cache", &self.hit_cache)
            .finish()
    }
}
