// File: src/pool.rs
//
// Reusable fixed-size buffer pool for call frame locals and evaluation
// stacks. A PoolHandle is a scoped acquisition: dropping it returns the
// buffer on every exit path, including exception unwinding. Returned buffers
// are cleared so they drop their Value references.

use crate::value::Value;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Default pooled buffer capacity; also the evaluation stack size
pub const DEFAULT_MAX_SIZE: usize = 256;

/// Default bound on how many buffers the pool retains
pub const DEFAULT_MAX_POOLED: usize = 64;

/// Instrumentation counters for the pool invariants: every rented buffer is
/// returned exactly once, even under error unwinding.
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub rented: AtomicUsize,
    pub returned: AtomicUsize,
    pub reused: AtomicUsize,
    pub discarded: AtomicUsize,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub rented: usize,
    pub returned: usize,
    pub reused: usize,
    pub discarded: usize,
    pub available: usize,
}

struct PoolInner {
    free: Vec<Vec<Value>>,
}

/// Bounded pool of Value buffers. Each pool belongs to one VM; handles are
/// single-owner.
#[derive(Clone)]
pub struct ArrayPool {
    inner: Arc<Mutex<PoolInner>>,
    counters: Arc<PoolCounters>,
    max_size: usize,
    max_pooled: usize,
}

impl Default for ArrayPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_MAX_POOLED)
    }
}

impl ArrayPool {
    pub fn new(max_size: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner { free: Vec::new() })),
            counters: Arc::new(PoolCounters::default()),
            max_size,
            max_pooled,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Rent a buffer of `size` slots, each initialized to Undefined.
    /// Requests larger than the pooled capacity bypass the pool entirely.
    pub fn rent(&self, size: usize) -> PoolHandle {
        self.counters.rented.fetch_add(1, Ordering::Relaxed);

        if size > self.max_size {
            return PoolHandle {
                buf: vec![Value::Undefined; size],
                pool: None,
                counters: self.counters.clone(),
            };
        }

        let mut buf = {
            let mut inner = self.inner.lock().unwrap();
            inner.free.pop()
        };
        match buf.as_mut() {
            Some(_) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
            }
            None => buf = Some(Vec::with_capacity(self.max_size)),
        }
        let mut buf = buf.unwrap();
        buf.resize(size, Value::Undefined);

        PoolHandle { buf, pool: Some(self.clone_inner()), counters: self.counters.clone() }
    }

    /// Accept a buffer from outside the pool. Foreign buffers are permitted
    /// but discarded; only buffers with the pool's capacity are retained.
    pub fn give_back(&self, mut buf: Vec<Value>) {
        buf.clear();
        let mut inner = self.inner.lock().unwrap();
        if buf.capacity() >= self.max_size && inner.free.len() < self.max_pooled {
            inner.free.push(buf);
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.inner.lock().unwrap().free.len();
        PoolStats {
            rented: self.counters.rented.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            available,
        }
    }

    fn clone_inner(&self) -> PoolRef {
        PoolRef {
            inner: self.inner.clone(),
            max_size: self.max_size,
            max_pooled: self.max_pooled,
        }
    }
}

struct PoolRef {
    inner: Arc<Mutex<PoolInner>>,
    max_size: usize,
    max_pooled: usize,
}

/// Scoped buffer acquisition. Dereferences to the underlying Vec so frames
/// can index locals and push/pop the evaluation stack directly.
pub struct PoolHandle {
    buf: Vec<Value>,
    /// None for oversized buffers that bypass the pool
    pool: Option<PoolRef>,
    counters: Arc<PoolCounters>,
}

impl Deref for PoolHandle {
    type Target = Vec<Value>;

    fn deref(&self) -> &Vec<Value> {
        &self.buf
    }
}

impl DerefMut for PoolHandle {
    fn deref_mut(&mut self) -> &mut Vec<Value> {
        &mut self.buf
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        let buf = std::mem::take(&mut self.buf);
        if let Some(pool) = &self.pool {
            let mut buf = buf;
            // Clear before returning so embedded strings and objects can be
            // collected while the buffer sits in the pool.
            buf.clear();
            let mut inner = pool.inner.lock().unwrap();
            if buf.capacity() >= pool.max_size && inner.free.len() < pool.max_pooled {
                inner.free.push(buf);
            } else {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PoolHandle({} slots, pooled={})", self.buf.len(), self.pool.is_some())
    }
}
