// SPDX-FileCopyrightText: 2024 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! A bounded pool of lazily-constructed, reusable connections.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// Holds up to `capacity` items at once; checkouts beyond that wait for a
/// checkin. Items are built on demand by the opener passed to
/// [`Pool::get`], and a single opener failure poisons the pool for good:
/// every later checkout fails without trying again.
pub(crate) struct Pool<C> {
    uri: String,
    slots: Semaphore,
    idle: Mutex<Vec<C>>,
    healthy: Box<dyn Fn(&C) -> bool + Send + Sync>,
    failed: AtomicBool,
}

impl<C: Send> Pool<C> {
    pub(crate) fn new(
        capacity: usize,
        uri: impl Into<String>,
        healthy: impl Fn(&C) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            uri: uri.into(),
            slots: Semaphore::new(capacity.max(1)),
            idle: Mutex::new(Vec::new()),
            healthy: Box::new(healthy),
            failed: AtomicBool::new(false),
        }
    }

    /// Checks out an item, calling `open` when no healthy idle one exists.
    pub(crate) async fn get<F, Fut>(&self, open: F) -> Result<PoolGuard<'_, C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::PoolFailed(self.uri.clone()));
        }
        let permit = self
            .slots
            .acquire()
            .await
            .expect("pool semaphore is never closed");
        loop {
            match self.idle.lock().pop() {
                Some(item) if (self.healthy)(&item) => {
                    return Ok(PoolGuard {
                        pool: self,
                        item: Some(item),
                        _permit: permit,
                        bad: false,
                    })
                }
                Some(_) => debug!("discarding unhealthy idle connection"),
                None => break,
            }
        }
        match open().await {
            Ok(item) => Ok(PoolGuard {
                pool: self,
                item: Some(item),
                _permit: permit,
                bad: false,
            }),
            Err(err) => {
                self.failed.store(true, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Temporarily raises the capacity by one slot. Used around uploads that
    /// hold a connection for a long time without occupying the daemon.
    pub(crate) fn inc_capacity(&self) {
        self.slots.add_permits(1);
    }

    /// Takes the extra slot back, waiting for a free one if necessary.
    pub(crate) async fn dec_capacity(&self) {
        self.slots
            .acquire()
            .await
            .expect("pool semaphore is never closed")
            .forget();
    }

    /// Drops idle items that no longer pass the health check.
    pub(crate) fn flush_bad(&self) {
        let healthy = &self.healthy;
        self.idle.lock().retain(|item| healthy(item));
    }
}

/// Exclusive checkout of one pool item. Checked back in on drop, unless
/// marked bad or no longer healthy.
pub(crate) struct PoolGuard<'p, C: Send> {
    pool: &'p Pool<C>,
    item: Option<C>,
    _permit: SemaphorePermit<'p>,
    bad: bool,
}

impl<C: Send> PoolGuard<'_, C> {
    /// Prevents this item from returning to the pool.
    pub(crate) fn mark_bad(&mut self) {
        self.bad = true;
    }
}

impl<C: Send> Deref for PoolGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.item.as_ref().expect("item present until drop")
    }
}

impl<C: Send> DerefMut for PoolGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.item.as_mut().expect("item present until drop")
    }
}

impl<C: Send> Drop for PoolGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            if !self.bad && (self.pool.healthy)(&item) {
                self.pool.idle.lock().push(item);
            }
        }
        // The permit is released after the checkin, in field order.
    }
}
