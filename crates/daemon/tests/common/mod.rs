// Test doubles shared by the integration tests
#![allow(dead_code)]

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dtn_control::broadcast::{Broadcast, BroadcastSink};
use dtn_control::control::Collaborators;
use dtn_control::controller::{DaemonController, DaemonEvent, DaemonHandler, Node};
use dtn_control::dispatcher::StartId;
use dtn_control::lifecycle::{ProcessHost, StaticPreference};
use dtn_control::presenter::StatusSurface;
use dtn_control::registry::{Registration, RemoteSession, SessionBinder, SessionHandle};
use dtn_control::state::{DaemonState, StateMachine};
use dtn_control::store::{PersistedRegistration, RegistrationStore};

/// Ordered log of everything the doubles observed, across threads.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// Controller driving a real [`StateMachine`] without any process behind it.
pub struct FakeController {
    pub machine: StateMachine,
    pub neighbors: Mutex<Vec<Node>>,
    pub journal: Journal,
    pub fail_start: AtomicBool,
    pub fail_initialize: AtomicBool,
    pub destroyed: AtomicBool,
}

impl FakeController {
    pub fn new(journal: Journal) -> Self {
        Self {
            machine: StateMachine::new(),
            neighbors: Mutex::new(Vec::new()),
            journal,
            fail_start: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn set_neighbors(&self, count: usize) {
        *self.neighbors.lock().unwrap() = (0..count)
            .map(|i| Node::new(format!("dtn://node-{}", i), "discovered"))
            .collect();
        if let Some(handler) = self.machine.handler() {
            handler.on_neighborhood_changed();
        }
    }

    pub fn emit(&self, event: DaemonEvent) {
        if let Some(handler) = self.machine.handler() {
            handler.on_event(event);
        }
    }
}

impl DaemonController for FakeController {
    fn get_state(&self) -> DaemonState {
        self.machine.current()
    }

    fn get_neighbors(&self) -> Result<Vec<Node>> {
        self.journal.push("neighbors");
        Ok(self.neighbors.lock().unwrap().clone())
    }

    fn get_version(&self) -> Result<Vec<String>> {
        Ok(vec!["1.0.1".to_string(), "fake dtnd 1.0.1".to_string()])
    }

    fn clear_storage(&self) -> Result<()> {
        self.journal.push("clear_storage");
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.journal.push("start");
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("daemon refused to start");
        }
        self.machine.transition(DaemonState::Pending)?;
        self.machine.transition(DaemonState::Online)?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.journal.push("stop");
        if self.machine.current() != DaemonState::Offline {
            self.machine.transition(DaemonState::Offline)?;
        }
        Ok(())
    }

    fn restart(&self, level: i32) -> Result<()> {
        self.journal.push(format!("restart:{}", level));
        self.machine.transition(DaemonState::Pending)?;
        self.machine.transition(DaemonState::Online)?;
        Ok(())
    }

    fn initialize(&self, handler: Arc<dyn DaemonHandler>) -> Result<()> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            anyhow::bail!("daemon storage unavailable");
        }
        self.machine.set_handler(handler);
        Ok(())
    }

    fn destroy(&self) {
        self.journal.push("destroy");
        self.machine.clear_handler();
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

pub struct RecordingSurface {
    pub journal: Journal,
}

impl StatusSurface for RecordingSurface {
    fn show(&self, _icon: &str, text: &str) -> Result<()> {
        self.journal.push(format!("show:{}", text));
        Ok(())
    }

    fn hide(&self) -> Result<()> {
        self.journal.push("hide");
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHost {
    pub privileged: AtomicBool,
    pub terminations: AtomicUsize,
    pub releases: Mutex<Vec<Option<StartId>>>,
}

impl RecordingHost {
    pub fn releases(&self) -> Vec<Option<StartId>> {
        self.releases.lock().unwrap().clone()
    }
}

impl ProcessHost for RecordingHost {
    fn enter_privileged_mode(&self) {
        self.privileged.store(true, Ordering::SeqCst);
    }

    fn exit_privileged_mode(&self) {
        self.privileged.store(false, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, start_id: Option<StartId>) {
        self.releases.lock().unwrap().push(start_id);
    }
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    pub sent: Mutex<Vec<Broadcast>>,
}

impl RecordingBroadcaster {
    pub fn states(&self) -> Vec<DaemonState> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|b| match b {
                Broadcast::StateChanged { state } => Some(*state),
                Broadcast::Event(_) => None,
            })
            .collect()
    }
}

impl BroadcastSink for RecordingBroadcaster {
    fn state_changed(&self, state: DaemonState) {
        self.sent
            .lock()
            .unwrap()
            .push(Broadcast::StateChanged { state });
    }

    fn forward_event(&self, event: DaemonEvent) {
        self.sent.lock().unwrap().push(Broadcast::Event(event));
    }
}

pub struct TestSession {
    pub id: String,
    pub releases: AtomicUsize,
    pub fail_release: bool,
}

impl RemoteSession for TestSession {
    fn handle_id(&self) -> &str {
        &self.id
    }

    fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            anyhow::bail!("handle {} is stuck", self.id);
        }
        Ok(())
    }
}

/// Binder that remembers every handle it issued.
#[derive(Default)]
pub struct TestBinder {
    pub issued: Mutex<Vec<Arc<TestSession>>>,
    pub refuse: Mutex<HashSet<String>>,
    pub stuck: Mutex<HashSet<String>>,
}

impl TestBinder {
    pub fn refuse(&self, caller_id: &str) {
        self.refuse.lock().unwrap().insert(caller_id.to_string());
    }

    pub fn make_stuck(&self, caller_id: &str) {
        self.stuck.lock().unwrap().insert(caller_id.to_string());
    }

    pub fn issued(&self) -> Vec<Arc<TestSession>> {
        self.issued.lock().unwrap().clone()
    }
}

impl SessionBinder for TestBinder {
    fn bind(&self, caller_id: &str, registration: &Registration) -> Result<SessionHandle> {
        if self.refuse.lock().unwrap().contains(caller_id) {
            anyhow::bail!("binding refused for {}", caller_id);
        }
        let mut issued = self.issued.lock().unwrap();
        let session = Arc::new(TestSession {
            id: format!("{}#{}:{}", caller_id, issued.len(), registration.endpoint),
            releases: AtomicUsize::new(0),
            fail_release: self.stuck.lock().unwrap().contains(caller_id),
        });
        issued.push(Arc::clone(&session));
        Ok(session)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub records: Mutex<BTreeMap<String, Registration>>,
}

impl MemoryStore {
    pub fn with(records: &[(&str, Registration)]) -> Self {
        let store = Self::default();
        for (caller_id, registration) in records {
            store
                .records
                .lock()
                .unwrap()
                .insert(caller_id.to_string(), registration.clone());
        }
        store
    }

    pub fn caller_ids(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }
}

impl RegistrationStore for MemoryStore {
    fn load_persisted_registrations(&self) -> Result<Vec<PersistedRegistration>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|(caller_id, registration)| PersistedRegistration {
                caller_id: caller_id.clone(),
                registration: registration.clone(),
                saved_at: Utc::now(),
            })
            .collect())
    }

    fn save(&self, caller_id: &str, registration: &Registration) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(caller_id.to_string(), registration.clone());
        Ok(())
    }

    fn remove(&self, caller_id: &str) -> Result<()> {
        self.records.lock().unwrap().remove(caller_id);
        Ok(())
    }
}

pub fn registration(endpoint: &str) -> Registration {
    Registration {
        endpoint: endpoint.to_string(),
        groups: vec![],
    }
}

/// Everything a test needs to drive and inspect a control plane.
pub struct Harness {
    pub journal: Journal,
    pub controller: Arc<FakeController>,
    pub host: Arc<RecordingHost>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub binder: Arc<TestBinder>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::default())
    }

    pub fn with_store(store: MemoryStore) -> Self {
        let journal = Journal::default();
        Self {
            controller: Arc::new(FakeController::new(journal.clone())),
            journal,
            host: Arc::new(RecordingHost::default()),
            broadcaster: Arc::new(RecordingBroadcaster::default()),
            binder: Arc::new(TestBinder::default()),
            store: Arc::new(store),
        }
    }

    pub fn collaborators(&self, auto_start: bool) -> Collaborators {
        Collaborators {
            controller: self.controller.clone(),
            surface: Arc::new(RecordingSurface {
                journal: self.journal.clone(),
            }),
            host: self.host.clone(),
            preference: Arc::new(StaticPreference(auto_start)),
            broadcaster: self.broadcaster.clone(),
            binder: self.binder.clone(),
            store: self.store.clone(),
        }
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
