//! Context pool.
//!
//! A bounded LIFO stack of idle contexts. LIFO hands out the most recently
//! used allocation, which is the one most likely to still be in cache.
//! Contexts are reset on release, so anything popped from the stack is
//! already idle.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::{Context, Shared};

pub(crate) struct ContextPool {
    idle: Mutex<Vec<Box<Context>>>,
    capacity: usize,
}

impl ContextPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { idle: Mutex::new(Vec::new()), capacity }
    }

    /// Takes an idle context, or builds one from `shared` when the pool is
    /// empty. The guard gives the context back when dropped.
    pub(crate) fn acquire(&self, shared: &Arc<Shared>) -> PooledContext<'_> {
        let reused = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let ctx = reused.unwrap_or_else(|| Box::new(Context::new(Arc::clone(shared))));
        PooledContext { ctx: Some(ctx), pool: self }
    }

    fn release(&self, mut ctx: Box<Context>) {
        ctx.release();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.capacity {
            idle.push(ctx);
        }
    }

    /// Drops every idle context. Called when the collaborators they were built
    /// with change.
    pub(crate) fn clear(&self) {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive use of one context for the duration of one request.
///
/// Dropping the guard, including during unwinding, resets the context and
/// returns it to the pool.
pub(crate) struct PooledContext<'p> {
    ctx: Option<Box<Context>>,
    pool: &'p ContextPool,
}

impl Deref for PooledContext<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        // Only `drop` takes the context out.
        self.ctx.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}
