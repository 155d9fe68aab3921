//! Test doubles shared by the unit tests.

use crate::hit::{AppInfo, Hit};
use crate::store::HitStore;
use crate::transport::{Address, Scheme, Transport, DEFAULT_HOST, HTTP_PORT};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn app() -> AppInfo {
    AppInfo::new("UA-12345-1", "test-client", "hitrelay-tests", "1.0")
}

/// `count` distinct screen views
pub fn hits(count: usize) -> Vec<Hit> {
    (0..count)
        .map(|i| Hit::screen_view(app(), format!("screen-{i}")))
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    FailFirst(usize),
    AlwaysFail,
    Stall,
    Panic,
}

/// Transport that records every attempt and answers per its behavior
pub struct RecordingTransport {
    behavior: Behavior,
    address: Mutex<Address>,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn with_behavior(behavior: Behavior) -> Self {
        RecordingTransport {
            behavior,
            address: Mutex::new(Address::new(Scheme::Http, DEFAULT_HOST, HTTP_PORT)),
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }

    pub fn failing_first(failures: usize) -> Self {
        Self::with_behavior(Behavior::FailFirst(failures))
    }

    pub fn failing() -> Self {
        Self::with_behavior(Behavior::AlwaysFail)
    }

    /// Every send hangs until aborted
    pub fn stalled() -> Self {
        Self::with_behavior(Behavior::Stall)
    }

    /// Every send task panics
    pub fn panicking() -> Self {
        Self::with_behavior(Behavior::Panic)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn delivered_payloads(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn set_address(&self, address: Address) {
        *self.address.lock().unwrap() = address;
    }

    fn address(&self) -> Address {
        self.address.lock().unwrap().clone()
    }

    async fn post(&self, _path: &str, body: String) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => {}
            Behavior::FailFirst(failures) if attempt < failures => {
                return Err(anyhow!("scripted failure {attempt}"));
            }
            Behavior::FailFirst(_) => {}
            Behavior::AlwaysFail => return Err(anyhow!("endpoint unreachable")),
            Behavior::Stall => std::future::pending::<()>().await,
            Behavior::Panic => panic!("send {attempt} panicked"),
        }
        self.delivered.lock().unwrap().push(body);
        Ok(())
    }

    fn user_agent(&self) -> String {
        "hitrelay-tests/1.0".to_string()
    }
}

type FetchHook = Box<dyn Fn(usize) + Send + Sync>;

/// Store wrapper that counts fetches and can run a hook before each one
pub struct HookedStore<S> {
    inner: Arc<S>,
    fetches: AtomicUsize,
    hook: Mutex<Option<FetchHook>>,
}

impl<S: HitStore> HookedStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        HookedStore {
            inner,
            fetches: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Run `hook` with the zero-based fetch index before every fetch
    pub fn on_fetch(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl<S: HitStore> HitStore for HookedStore<S> {
    fn open(&self) -> Result<()> {
        self.inner.open()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn add_hit(&self, hit: &Hit) -> Result<()> {
        self.inner.add_hit(hit)
    }

    fn add_hits(&self, hits: Vec<Hit>) -> Result<()> {
        self.inner.add_hits(hits)
    }

    fn fetch_hits(&self, max_count: usize, remove: bool) -> Result<Vec<Hit>> {
        let index = self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(index);
        }
        self.inner.fetch_hits(max_count, remove)
    }

    fn len(&self) -> Result<usize> {
        self.inner.len()
    }
}
