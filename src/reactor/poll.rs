//! `mio`-Backed Reactor
//!
//! [`PollReactor`] runs one event thread around a [`mio::Poll`]
//! (epoll/kqueue, edge-triggered). Every connection event is handed to the
//! [`Dispatcher`] on that thread, which gives the one-thread-per-descriptor
//! guarantee for free. A [`Waker`] interrupts the poll on shutdown.

use crate::connection::Connection;
use crate::reactor::{Dispatcher, Reactor};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io::{self, ErrorKind};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Token reserved for the shutdown waker; never a valid descriptor.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Default number of events fetched per poll
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// The running event thread.
struct Driver {
    waker: Waker,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// A single-threaded reactor on `mio`.
pub struct PollReactor {
    event_capacity: usize,
    worker_hint: usize,
    registry: RwLock<Option<Registry>>,
    driver: Mutex<Option<Driver>>,
}

impl std::fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollReactor")
            .field("event_capacity", &self.event_capacity)
            .field("worker_hint", &self.worker_hint)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Default for PollReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl PollReactor {
    pub fn new() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            worker_hint: 1,
            registry: RwLock::new(None),
            driver: Mutex::new(None),
        }
    }

    /// Records the configured worker count. Events are still handled on
    /// the single event thread.
    pub fn with_worker_hint(mut self, workers: usize) -> Self {
        self.worker_hint = workers;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn with_registry<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&Registry) -> io::Result<()>,
    {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        match registry.as_ref() {
            Some(registry) => f(registry),
            None => Err(io::Error::new(
                ErrorKind::NotConnected,
                "reactor is not initialized",
            )),
        }
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

impl Reactor for PollReactor {
    fn initialize(&self, dispatcher: Arc<Dispatcher>) -> io::Result<()> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                "reactor already initialized",
            ));
        }

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let stop = Arc::new(AtomicBool::new(false));

        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = Some(registry);

        let spawned = thread::Builder::new()
            .name("socketcore-reactor".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                let capacity = self.event_capacity;
                move || event_loop(poll, capacity, stop, dispatcher)
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                *self.registry.write().unwrap_or_else(PoisonError::into_inner) = None;
                return Err(e);
            }
        };

        *driver = Some(Driver {
            waker,
            stop,
            thread,
        });
        info!(worker_hint = self.worker_hint, "Reactor initialized");
        Ok(())
    }

    fn uninitialize(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(driver) = driver else {
            return;
        };

        driver.stop.store(true, Ordering::Release);
        if let Err(e) = driver.waker.wake() {
            warn!(error = %e, "Failed to wake reactor thread");
        }
        if driver.thread.join().is_err() {
            error!("Reactor thread panicked");
        }

        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!("Reactor stopped");
    }

    fn register(&self, conn: &mut Connection) -> io::Result<()> {
        let fd = conn.fd();
        self.with_registry(|registry| {
            registry.register(conn.stream_mut(), token(fd), Interest::READABLE)
        })
    }

    fn rearm(&self, conn: &mut Connection, interest: Interest) -> io::Result<()> {
        let fd = conn.fd();
        self.with_registry(|registry| registry.reregister(conn.stream_mut(), token(fd), interest))
    }

    fn deregister(&self, conn: &mut Connection) -> io::Result<()> {
        match self.with_registry(|registry| registry.deregister(conn.stream_mut())) {
            // Nothing is watched once the reactor is down
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }
}

fn event_loop(mut poll: Poll, capacity: usize, stop: Arc<AtomicBool>, dispatcher: Arc<Dispatcher>) {
    let mut events = Events::with_capacity(capacity);

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "Reactor poll failed");
            return;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            dispatcher.on_ready(event.token().0 as RawFd);
        }

        if stop.load(Ordering::Acquire) {
            break;
        }
    }

    debug!("Reactor event loop stopped");
}
