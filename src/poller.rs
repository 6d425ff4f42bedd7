// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Device readiness reactor.
//!
//! A [`Poller`] owns one thread that executes commands in order: `Init`
//! installs the watched devices and listener, `Poll` blocks in `poll(2)` on
//! those devices plus the read end of a cancellation pipe and reports the
//! classification to the listener, `Flush` drains the pipe and optionally
//! forgets the device set.
//!
//! The cancellation pipe is always part of the poll set. Writing one byte
//! to it is what lets [`Poller::flush`] interrupt a poll cycle that was
//! queued with an infinite timeout.

use crate::error::{Error, Result};
use kanal::{Receiver, Sender};
use std::{
    fmt, io,
    ops::BitOr,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, trace, warn};

/// A device the poller can watch, such as a V4L2 node or an event fd.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Pollable descriptor, borrowed for the duration of a cycle.
    fn raw_fd(&self) -> RawFd;
}

pub type DeviceRef = Arc<dyn Device>;

/// `poll(2)` interest mask.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EventMask(libc::c_short);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READABLE: EventMask = EventMask(libc::POLLIN);
    pub const PRIORITY: EventMask = EventMask(libc::POLLPRI);
    pub const WRITABLE: EventMask = EventMask(libc::POLLOUT);

    pub fn bits(self) -> libc::c_short {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// How a poll cycle ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollKind {
    /// At least one device is ready.
    Ready,
    /// The timeout expired with no device ready.
    Timeout,
    /// The cycle was cancelled by [`Poller::flush`].
    Flushed,
    /// `poll(2)` failed with the given errno.
    Error(i32),
}

/// Result of one poll cycle as handed to the listener.
pub struct PollOutcome {
    pub request_id: u64,
    pub kind: PollKind,
    pub active: Vec<DeviceRef>,
    pub inactive: Vec<DeviceRef>,
    /// Devices that reported `POLLERR`, `POLLHUP` or `POLLNVAL`.
    pub errored: Vec<DeviceRef>,
    /// Devices explicitly named by the request, empty when the request
    /// used the installed device set.
    pub requested: Vec<DeviceRef>,
}

impl PollOutcome {
    fn empty(request_id: u64, kind: PollKind) -> Self {
        Self {
            request_id,
            kind,
            active: Vec::new(),
            inactive: Vec::new(),
            errored: Vec::new(),
            requested: Vec::new(),
        }
    }
}

fn names(devices: &[DeviceRef]) -> Vec<&str> {
    devices.iter().map(|d| d.name()).collect()
}

impl fmt::Debug for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollOutcome")
            .field("request_id", &self.request_id)
            .field("kind", &self.kind)
            .field("active", &names(&self.active))
            .field("inactive", &names(&self.inactive))
            .field("errored", &names(&self.errored))
            .field("requested", &names(&self.requested))
            .finish()
    }
}

/// What the reactor does after the listener has seen an outcome.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollAction {
    Done,
    /// Run the same cycle again, e.g. after transient resource exhaustion.
    Retry,
}

pub trait PollListener: Send + Sync {
    fn on_poll(&self, outcome: &PollOutcome) -> PollAction;
}

impl<F> PollListener for F
where
    F: Fn(&PollOutcome) -> PollAction + Send + Sync,
{
    fn on_poll(&self, outcome: &PollOutcome) -> PollAction {
        self(outcome)
    }
}

struct CancelPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl CancelPipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds has room for the two descriptors pipe2 returns.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    fn wake(&self) -> io::Result<()> {
        let byte = [1u8];
        // SAFETY: one byte from a valid stack buffer to an fd we own.
        let ret = unsafe { libc::write(self.write.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // a full pipe already guarantees a wakeup
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        // SAFETY: buf is valid for writes of its length; the fd is non-blocking.
        while unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }
}

enum Command {
    Init {
        devices: Vec<DeviceRef>,
        listener: Arc<dyn PollListener>,
        mask: EventMask,
    },
    Poll {
        id: u64,
        timeout: Option<Duration>,
        devices: Option<Vec<DeviceRef>>,
        generation: u64,
    },
    Flush {
        clear_state: bool,
    },
    Exit,
}

struct Reactor {
    name: String,
    rx: Receiver<Command>,
    pipe: Arc<CancelPipe>,
    generation: Arc<AtomicU64>,
    devices: Vec<DeviceRef>,
    listener: Option<Arc<dyn PollListener>>,
    mask: EventMask,
}

impl Reactor {
    fn run(mut self) {
        debug!(poller = %self.name, "reactor started");
        while let Ok(command) = self.rx.recv() {
            match command {
                Command::Init {
                    devices,
                    listener,
                    mask,
                } => {
                    debug!(poller = %self.name, devices = ?names(&devices), "device set installed");
                    self.devices = devices;
                    self.listener = Some(listener);
                    self.mask = mask;
                }
                Command::Poll {
                    id,
                    timeout,
                    devices,
                    generation,
                } => self.poll_cycle(id, timeout, devices, generation),
                Command::Flush { clear_state } => {
                    self.pipe.drain();
                    if clear_state {
                        self.devices.clear();
                    }
                    debug!(poller = %self.name, clear_state, "flushed");
                }
                Command::Exit => break,
            }
        }
        debug!(poller = %self.name, "reactor exited");
    }

    fn poll_cycle(
        &mut self,
        id: u64,
        timeout: Option<Duration>,
        requested: Option<Vec<DeviceRef>>,
        generation: u64,
    ) {
        let Some(listener) = self.listener.clone() else {
            warn!(poller = %self.name, id, "poll request without a listener");
            return;
        };

        loop {
            let outcome = if generation != self.generation.load(Ordering::Acquire) {
                PollOutcome::empty(id, PollKind::Flushed)
            } else {
                match self.wait(id, timeout, requested.as_deref()) {
                    Some(outcome) => outcome,
                    None => continue,
                }
            };

            trace!(poller = %self.name, ?outcome, "poll cycle finished");
            match listener.on_poll(&outcome) {
                PollAction::Retry if outcome.kind != PollKind::Flushed => {
                    trace!(poller = %self.name, id, "listener asked to retry");
                }
                _ => return,
            }
        }
    }

    /// One blocking wait. Returns `None` when interrupted by a signal.
    fn wait(
        &self,
        id: u64,
        timeout: Option<Duration>,
        requested: Option<&[DeviceRef]>,
    ) -> Option<PollOutcome> {
        let devices = requested.unwrap_or(self.devices.as_slice());

        let mut fds = Vec::with_capacity(devices.len() + 1);
        fds.push(libc::pollfd {
            fd: self.pipe.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        fds.extend(devices.iter().map(|d| libc::pollfd {
            fd: d.raw_fd(),
            events: self.mask.bits(),
            revents: 0,
        }));

        let timeout_ms = match timeout {
            // rounded up so a short timeout still blocks
            Some(t) => t
                .as_nanos()
                .div_ceil(1_000_000)
                .min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        // SAFETY: fds is a live, initialized array of exactly fds.len() entries.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        let mut outcome = PollOutcome::empty(id, PollKind::Ready);
        outcome.requested = requested.map(<[DeviceRef]>::to_vec).unwrap_or_default();

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return None;
            }
            error!(poller = %self.name, id, "poll failed: {err}");
            outcome.kind = PollKind::Error(err.raw_os_error().unwrap_or(libc::EIO));
            outcome.inactive = devices.to_vec();
            return Some(outcome);
        }

        if fds[0].revents != 0 {
            self.pipe.drain();
            outcome.kind = PollKind::Flushed;
            return Some(outcome);
        }

        if ret == 0 {
            outcome.kind = PollKind::Timeout;
            outcome.inactive = devices.to_vec();
            return Some(outcome);
        }

        let failed = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
        for (pfd, device) in fds[1..].iter().zip(devices) {
            if pfd.revents & failed != 0 {
                outcome.errored.push(Arc::clone(device));
            } else if pfd.revents & self.mask.bits() != 0 {
                outcome.active.push(Arc::clone(device));
            } else {
                outcome.inactive.push(Arc::clone(device));
            }
        }
        Some(outcome)
    }
}

#[derive(Default)]
struct Control {
    tx: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
    pipe: Option<Arc<CancelPipe>>,
}

/// Reactor that turns blocking device readiness waits into listener
/// callbacks on a dedicated thread.
pub struct Poller {
    name: String,
    control: Mutex<Control>,
    generation: Arc<AtomicU64>,
}

impl Poller {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            control: Mutex::new(Control::default()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the watched device set and listener, starting the reactor
    /// thread if it is not running.
    ///
    /// # Errors
    ///
    /// - `BadValue` if `devices` or `mask` is empty.
    /// - `Unknown` if the cancellation pipe or thread cannot be created.
    pub fn init(
        &self,
        devices: Vec<DeviceRef>,
        listener: Arc<dyn PollListener>,
        mask: EventMask,
    ) -> Result<()> {
        if devices.is_empty() {
            return Err(Error::bad_value(format!("poller {}: no devices", self.name)));
        }
        if mask.is_empty() {
            return Err(Error::bad_value(format!("poller {}: empty event mask", self.name)));
        }

        let mut control = self.lock();
        if control.thread.is_none() {
            let pipe = CancelPipe::new().map_err(|e| {
                Error::Unknown(format!("poller {}: cancellation pipe: {e}", self.name))
            })?;
            let pipe = Arc::new(pipe);
            let (tx, rx) = kanal::unbounded();
            let reactor = Reactor {
                name: self.name.clone(),
                rx,
                pipe: Arc::clone(&pipe),
                generation: Arc::clone(&self.generation),
                devices: Vec::new(),
                listener: None,
                mask,
            };
            let thread = thread::Builder::new()
                .name(format!("poller-{}", self.name))
                .spawn(move || reactor.run())
                .map_err(|e| Error::Unknown(format!("poller {}: spawn: {e}", self.name)))?;
            control.tx = Some(tx);
            control.thread = Some(thread);
            control.pipe = Some(pipe);
        }

        Self::send(
            &control,
            Command::Init {
                devices,
                listener,
                mask,
            },
        )
    }

    fn send(control: &Control, command: Command) -> Result<()> {
        let tx = control
            .tx
            .as_ref()
            .ok_or_else(|| Error::invalid_operation("poller is not initialized"))?;
        tx.send(command)
            .map_err(|e| Error::Unknown(format!("poller command queue closed: {e}")))
    }

    /// Queues one poll cycle. `timeout` of `None` blocks until a device is
    /// ready or the poller is flushed. `devices` replaces the installed set
    /// for this cycle only; an empty list watches just the cancellation
    /// pipe.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` before [`init`](Self::init) or after a
    /// synchronous flush.
    pub fn queue_request(
        &self,
        id: u64,
        timeout: Option<Duration>,
        devices: Option<Vec<DeviceRef>>,
    ) -> Result<()> {
        let control = self.lock();
        Self::send(
            &control,
            Command::Poll {
                id,
                timeout,
                devices,
                generation: self.generation.load(Ordering::Acquire),
            },
        )
    }

    /// Cancels the in-flight poll cycle and every queued one; each is
    /// reported to the listener as [`PollKind::Flushed`]. With `sync` the
    /// call also stops the reactor thread and returns once it has exited.
    /// Safe to call before `init` and more than once.
    ///
    /// The listener may call back into the poller while a synchronous
    /// flush waits for the reactor; its requests are rejected.
    pub fn flush(&self, sync: bool, clear_state: bool) -> Result<()> {
        let thread = {
            let mut control = self.lock();
            if control.thread.is_none() {
                return Ok(());
            }

            self.generation.fetch_add(1, Ordering::AcqRel);
            if let Some(pipe) = &control.pipe {
                pipe.wake()?;
            }
            Self::send(&control, Command::Flush { clear_state })?;
            if !sync {
                return Ok(());
            }

            Self::send(&control, Command::Exit)?;
            control.tx = None;
            control.pipe = None;
            control.thread.take()
        };

        // joined without the control lock so the listener can still reach it
        if let Some(thread) = thread {
            if thread.join().is_err() {
                return Err(Error::Unknown(format!(
                    "poller {}: reactor panicked",
                    self.name
                )));
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock().thread.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Err(e) = self.flush(true, true) {
            warn!(poller = %self.name, "flush on drop failed: {e}");
        }
    }
}
