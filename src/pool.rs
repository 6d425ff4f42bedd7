// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bounded pool of reusable image buffers.
//!
//! A pool is sized once with [`BufferPool::init`]: `min_count` buffers are
//! constructed immediately and the remainder (`to_alloc`) is constructed
//! later, either by the single background thread started from
//! [`BufferPool::commit`] or on demand by an [`BufferPool::acquire`] caller
//! that finds the pool empty before the background thread runs. Every entry
//! is either *available* or *in use*, and the two lists together never hold
//! more than `max_count` buffers.
//!
//! All bookkeeping, including `to_alloc`, is guarded by one mutex. The slow
//! allocation itself runs outside the lock after the slot has been reserved
//! by decrementing `to_alloc`, so on-demand and background construction can
//! never both claim the last slot.

use crate::{
    error::{Error, Result},
    image::{Image, ImageAllocator, ImageSpec},
};
use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
    ops::Deref,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, trace, warn};

#[derive(Default)]
struct Waiter {
    cond: Condvar,
}

#[derive(Default)]
struct PoolState {
    initialized: bool,
    exit_pending: bool,
    worker_running: bool,
    generation: u64,
    max_count: usize,
    to_alloc: usize,
    images: Vec<Arc<Image>>,
    available: VecDeque<usize>,
    in_use: BTreeSet<usize>,
    waiters: VecDeque<Arc<Waiter>>,
}

impl PoolState {
    fn push_image(&mut self, image: Image) -> usize {
        self.images.push(Arc::new(image));
        self.images.len() - 1
    }

    fn wake_one(&mut self) {
        if let Some(waiter) = self.waiters.pop_front() {
            waiter.cond.notify_one();
        }
    }

    fn wake_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter.cond.notify_one();
        }
    }

    fn is_registered(&self, waiter: &Arc<Waiter>) -> bool {
        self.waiters.iter().any(|w| Arc::ptr_eq(w, waiter))
    }
}

struct Shared {
    name: String,
    spec: ImageSpec,
    allocator: Arc<dyn ImageAllocator>,
    state: Mutex<PoolState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn construct(&self) -> Result<Image> {
        self.allocator.allocate(&self.spec).map_err(|e| match e {
            Error::NoMemory(_) => e,
            other => Error::no_memory(format!("pool {}: {other}", self.name)),
        })
    }

    fn release(&self, index: usize, generation: Option<u64>) -> Result<()> {
        let mut state = self.lock();
        if generation.is_some_and(|g| g != state.generation) || !state.in_use.remove(&index) {
            return Err(Error::invalid_operation(format!(
                "pool {}: buffer {index} is not in use",
                self.name
            )));
        }
        state.available.push_back(index);
        state.wake_one();
        trace!(pool = %self.name, index, "buffer released");
        Ok(())
    }

    fn construct_loop(self: Arc<Self>) {
        debug!(pool = %self.name, "background construction started");
        loop {
            let generation = {
                let mut state = self.lock();
                if state.exit_pending || state.to_alloc == 0 {
                    state.worker_running = false;
                    break;
                }
                state.to_alloc -= 1;
                state.generation
            };

            let constructed = self.construct();

            let mut state = self.lock();
            match constructed {
                Ok(image) if state.generation == generation => {
                    let index = state.push_image(image);
                    state.available.push_back(index);
                    state.wake_one();
                    trace!(pool = %self.name, index, to_alloc = state.to_alloc, "buffer constructed");
                }
                Ok(_) => {
                    state.worker_running = false;
                    break;
                }
                Err(e) => {
                    state.to_alloc += 1;
                    state.worker_running = false;
                    // waiters fall back to constructing on demand
                    state.wake_all();
                    error!(pool = %self.name, "background construction failed: {e}");
                    break;
                }
            }
        }
        debug!(pool = %self.name, "background construction finished");
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_count: usize,
    pub to_alloc: usize,
    pub available: usize,
    pub in_use: usize,
}

/// Buffer taken from the pool with [`BufferPool::acquire`]; must be given
/// back with [`BufferPool::release`] using its index.
#[derive(Clone)]
pub struct PoolBuffer {
    pub index: usize,
    pub image: Arc<Image>,
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("image", &format_args!("{}", self.image))
            .finish()
    }
}

/// Buffer that returns itself to its pool when dropped.
pub struct BufferHandle {
    shared: Arc<Shared>,
    index: usize,
    generation: u64,
    image: Arc<Image>,
}

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pool_name(&self) -> &str {
        &self.shared.name
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
}

impl Deref for BufferHandle {
    type Target = Image;

    fn deref(&self) -> &Image {
        &self.image
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferHandle({}#{})", self.shared.name, self.index)
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shared.release(self.index, Some(self.generation)) {
            // the pool was torn down while the buffer was out
            debug!("dropping stale buffer handle: {e}");
        }
    }
}

/// Concurrent pool of image buffers with a hard capacity ceiling.
///
/// # Example
///
/// ```
/// use edgefirst_isp::{
///     image::{ImageSpec, SystemAllocator, NV12},
///     pool::BufferPool,
/// };
/// use std::{sync::Arc, time::Duration};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let spec = ImageSpec::new(640, 480, NV12)?;
/// let pool = BufferPool::new("preview", spec, Arc::new(SystemAllocator));
/// pool.init(4, 2)?;
/// pool.commit()?;
///
/// let buf = pool.acquire(Duration::from_millis(10))?;
/// pool.release(buf.index)?;
/// pool.uninit();
/// # Ok(())
/// # }
/// ```
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    pub fn new(name: impl Into<String>, spec: ImageSpec, allocator: Arc<dyn ImageAllocator>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                spec,
                allocator,
                state: Mutex::new(PoolState::default()),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Sizes the pool and synchronously constructs `min_count` buffers.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if `max_count` is zero, `min_count` exceeds
    ///   `max_count`, or the pool is already initialized.
    /// - `NoMemory` if one of the initial buffers cannot be constructed; the
    ///   pool is left uninitialized.
    pub fn init(&self, max_count: usize, min_count: usize) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if state.initialized {
            return Err(Error::invalid_operation(format!(
                "pool {} is already initialized",
                shared.name
            )));
        }
        if max_count == 0 || min_count > max_count {
            return Err(Error::invalid_operation(format!(
                "pool {}: invalid counts max={max_count} min={min_count}",
                shared.name
            )));
        }

        state.generation += 1;
        state.exit_pending = false;
        state.max_count = max_count;
        state.to_alloc = max_count - min_count;
        state.images.clear();
        state.available.clear();
        state.in_use.clear();

        for _ in 0..min_count {
            match shared.construct() {
                Ok(image) => {
                    let index = state.push_image(image);
                    state.available.push_back(index);
                }
                Err(e) => {
                    state.images.clear();
                    state.available.clear();
                    state.to_alloc = 0;
                    return Err(e);
                }
            }
        }

        state.initialized = true;
        debug!(
            pool = %shared.name,
            spec = %shared.spec,
            max_count,
            min_count,
            "pool initialized"
        );
        Ok(())
    }

    /// Starts the background constructor for the buffers not built by
    /// [`init`](Self::init). Only one constructor thread ever runs per
    /// initialization; calling `commit` again is a no-op.
    pub fn commit(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.initialized {
            return Err(Error::invalid_operation(format!(
                "pool {} is not initialized",
                self.shared.name
            )));
        }
        if state.to_alloc == 0 || state.worker_running {
            return Ok(());
        }

        let mut worker = self.shared.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = worker.take() {
            // previous constructor already left its loop
            let _ = handle.join();
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("pool-{}", self.shared.name))
            .spawn(move || shared.construct_loop())?;
        state.worker_running = true;
        *worker = Some(handle);
        Ok(())
    }

    /// Takes a buffer, constructing one on the caller's thread when the pool
    /// is empty and the background constructor is not running, otherwise
    /// waiting up to `timeout` for a release. `Duration::MAX` waits
    /// without a deadline.
    ///
    /// # Errors
    ///
    /// - `TimedOut` if no buffer became available within `timeout`.
    /// - `NoMemory` if on-demand construction failed.
    /// - `InvalidOperation` if the pool is not initialized.
    pub fn acquire(&self, timeout: Duration) -> Result<PoolBuffer> {
        let (index, image, _) = self.acquire_inner(timeout)?;
        Ok(PoolBuffer { index, image })
    }

    /// Like [`acquire`](Self::acquire), but the buffer is released
    /// automatically when the returned handle is dropped.
    pub fn acquire_handle(&self, timeout: Duration) -> Result<BufferHandle> {
        let (index, image, generation) = self.acquire_inner(timeout)?;
        Ok(BufferHandle {
            shared: Arc::clone(&self.shared),
            index,
            generation,
            image,
        })
    }

    fn acquire_inner(&self, timeout: Duration) -> Result<(usize, Arc<Image>, u64)> {
        let shared = &self.shared;
        // too far out to represent means no deadline
        let deadline = Instant::now().checked_add(timeout);
        let waiter = Arc::new(Waiter::default());
        let mut queued = false;
        let mut state = shared.lock();

        loop {
            if !state.initialized {
                state.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                return Err(Error::invalid_operation(format!(
                    "pool {} is not initialized",
                    shared.name
                )));
            }

            if let Some(index) = state.available.pop_front() {
                state.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                state.in_use.insert(index);
                trace!(pool = %shared.name, index, "buffer acquired");
                return Ok((index, Arc::clone(&state.images[index]), state.generation));
            }

            if !state.worker_running && state.to_alloc > 0 {
                state.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                state.to_alloc -= 1;
                let generation = state.generation;
                drop(state);

                let constructed = shared.construct();

                state = shared.lock();
                let image = match constructed {
                    Ok(image) => image,
                    Err(e) => {
                        if state.generation == generation {
                            state.to_alloc += 1;
                        }
                        return Err(e);
                    }
                };
                if state.generation != generation {
                    return Err(Error::invalid_operation(format!(
                        "pool {} was torn down during acquire",
                        shared.name
                    )));
                }
                let index = state.push_image(image);
                state.in_use.insert(index);
                trace!(pool = %shared.name, index, to_alloc = state.to_alloc, "buffer constructed on demand");
                return Ok((index, Arc::clone(&state.images[index]), generation));
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                state.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                warn!(pool = %shared.name, ?timeout, "acquire timed out");
                return Err(Error::TimedOut(timeout));
            }

            if !state.is_registered(&waiter) {
                if queued {
                    // woken but beaten to the buffer: keep our place in line
                    state.waiters.push_front(Arc::clone(&waiter));
                } else {
                    state.waiters.push_back(Arc::clone(&waiter));
                    queued = true;
                }
            }
            state = match deadline {
                Some(d) => {
                    waiter
                        .cond
                        .wait_timeout(state, d - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => waiter.cond.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Moves buffer `index` from in-use back to available and wakes the
    /// longest waiting caller.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the buffer is not currently in use.
    pub fn release(&self, index: usize) -> Result<()> {
        self.shared.release(index, None)
    }

    /// Stops the background constructor, waiting for the buffer it is
    /// building, then drops every buffer the pool still owns. Buffers held
    /// through a [`BufferHandle`] stay valid until the handle is dropped.
    pub fn uninit(&self) {
        {
            let mut state = self.shared.lock();
            if !state.initialized {
                return;
            }
            state.exit_pending = true;
        }

        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(pool = %self.shared.name, "background constructor panicked");
            }
        }

        let mut state = self.shared.lock();
        state.initialized = false;
        state.worker_running = false;
        state.generation += 1;
        state.to_alloc = 0;
        state.max_count = 0;
        state.images.clear();
        state.available.clear();
        state.in_use.clear();
        state.wake_all();
        debug!(pool = %self.shared.name, "pool uninitialized");
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn spec(&self) -> &ImageSpec {
        &self.shared.spec
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lock().initialized
    }

    pub fn max_count(&self) -> usize {
        self.shared.lock().max_count
    }

    pub fn available(&self) -> usize {
        self.shared.lock().available.len()
    }

    pub fn in_use(&self) -> usize {
        self.shared.lock().in_use.len()
    }

    /// Buffers still to be constructed.
    pub fn to_alloc(&self) -> usize {
        self.shared.lock().to_alloc
    }

    /// Counters read under one lock.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            max_count: state.max_count,
            to_alloc: state.to_alloc,
            available: state.available.len(),
            in_use: state.in_use.len(),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.uninit();
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("BufferPool")
            .field("name", &self.shared.name)
            .field("spec", &self.shared.spec)
            .field("max_count", &state.max_count)
            .field("to_alloc", &state.to_alloc)
            .field("available", &state.available.len())
            .field("in_use", &state.in_use.len())
            .finish()
    }
}
