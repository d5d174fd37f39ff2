//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Semaphore, mpsc};

use crate::backend::{
    Backend, BackendFuture, Credentials, InstanceRecord, MetricsFeed, MetricsRecord, RegionRecord,
    SpawnedInstance, VpnStatusRecord,
};
use crate::command::{CommandError, CommandOutput, CommandRunner};

/// Error returned by [`ScriptedBackend`] for scripted failures.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct ScriptedFailure(pub String);

/// Backend call recorded by [`ScriptedBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendCall {
    /// `list_regions`.
    ListRegions,
    /// `list_instances` for a region.
    ListInstances(String),
    /// `spawn_instance` in a region.
    Spawn(String),
    /// `terminate_instance`.
    Terminate {
        /// Target instance.
        instance_id: String,
        /// Region passed along.
        region: String,
    },
    /// `connect`.
    Connect {
        /// Target instance.
        instance_id: String,
        /// Region passed along.
        region: String,
    },
    /// `disconnect`.
    Disconnect,
    /// `vpn_status`.
    Status,
    /// `subscribe_metrics`.
    Subscribe,
    /// `unsubscribe_metrics` with the feed id.
    Unsubscribe(String),
    /// `save_credentials` for a provider.
    SaveCredentials(String),
}

/// Operations that can be held in flight with [`ScriptedBackend::hold`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum GatedCall {
    /// `list_regions`.
    ListRegions,
    /// `list_instances`.
    ListInstances,
    /// `spawn_instance`.
    Spawn,
    /// `terminate_instance`.
    Terminate,
    /// `connect`.
    Connect,
    /// `vpn_status`.
    Status,
    /// `subscribe_metrics`.
    Subscribe,
}

/// Releases calls held by [`ScriptedBackend::hold`].
#[derive(Clone, Debug)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    /// Lets one waiting (or future) call through.
    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    /// Lets every current and future call through.
    pub fn open(&self) {
        self.permits.add_permits(OPEN_GATE_PERMITS);
    }
}

const OPEN_GATE_PERMITS: usize = 1 << 20;

#[derive(Debug, Default)]
struct Script {
    regions: Option<Result<Vec<RegionRecord>, String>>,
    instances: HashMap<String, Result<Vec<InstanceRecord>, String>>,
    spawns: VecDeque<Result<SpawnedInstance, String>>,
    terminate_failures: HashMap<String, String>,
    connect_failure: Option<String>,
    disconnect_failure: Option<String>,
    statuses: VecDeque<Result<VpnStatusRecord, String>>,
    status: VpnStatusRecord,
    subscribe_failure: Option<String>,
    unsubscribe_failure: Option<String>,
    credentials_failure: Option<String>,
    saved_credentials: Vec<Credentials>,
    feeds: Vec<(String, mpsc::Sender<MetricsRecord>)>,
    feed_counter: u64,
    calls: Vec<BackendCall>,
    gates: HashMap<GatedCall, Arc<Semaphore>>,
}

/// In-memory [`Backend`] with programmable answers.
///
/// Unscripted listings answer with empty collections, status answers with the
/// last known tunnel state, and mutations succeed. A successful `connect`
/// makes later status calls report that instance; `disconnect` clears it.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

/// Builds an instance listing record.
#[must_use]
pub fn instance_record(id: &str, state: &str, public_ip_v4: &str) -> InstanceRecord {
    InstanceRecord {
        id: id.to_owned(),
        name: None,
        state: state.to_owned(),
        public_ip_v4: public_ip_v4.to_owned(),
        public_ip_v6: String::new(),
        region: None,
    }
}

/// Builds a connected status record for `instance_id`.
#[must_use]
pub fn connected_status(instance_id: &str) -> VpnStatusRecord {
    VpnStatusRecord {
        connected: true,
        instance_id: Some(instance_id.to_owned()),
        public_ip_v4: None,
        public_ip_v6: None,
    }
}

/// Builds a metrics record with the given byte counters and rates.
#[must_use]
pub fn metrics_record(bytes_sent: u64, bytes_received: u64, upload_rate: f64) -> MetricsRecord {
    MetricsRecord {
        bytes_sent,
        bytes_received,
        packets_sent: bytes_sent.checked_div(100).unwrap_or_default(),
        packets_received: bytes_received.checked_div(100).unwrap_or_default(),
        upload_rate,
        download_rate: upload_rate,
    }
}

impl ScriptedBackend {
    /// Creates a backend with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: BackendCall) {
        self.lock().calls.push(call);
    }

    async fn pass_gate(&self, call: GatedCall) {
        let gate = self.lock().gates.get(&call).cloned();
        if let Some(permits) = gate {
            if let Ok(permit) = permits.acquire().await {
                permit.forget();
            }
        }
    }

    /// Holds every later call of `call` until the returned gate releases it.
    #[must_use]
    pub fn hold(&self, call: GatedCall) -> Gate {
        let permits = Arc::new(Semaphore::new(0));
        self.lock().gates.insert(call, Arc::clone(&permits));
        Gate { permits }
    }

    /// Scripts the region listing from `(code, country)` pairs.
    pub fn with_regions(&self, regions: &[(&str, &str)]) {
        let records = regions
            .iter()
            .map(|(name, country)| RegionRecord {
                name: (*name).to_owned(),
                country: (*country).to_owned(),
            })
            .collect();
        self.lock().regions = Some(Ok(records));
    }

    /// Makes the region listing fail.
    pub fn fail_regions(&self, message: &str) {
        self.lock().regions = Some(Err(message.to_owned()));
    }

    /// Scripts the listing for one region.
    pub fn set_instances(&self, region: &str, instances: &[InstanceRecord]) {
        self.lock()
            .instances
            .insert(region.to_owned(), Ok(instances.to_vec()));
    }

    /// Makes the listing for one region fail.
    pub fn fail_instances(&self, region: &str, message: &str) {
        self.lock()
            .instances
            .insert(region.to_owned(), Err(message.to_owned()));
    }

    /// Queues a successful spawn answer.
    pub fn push_spawn(&self, region: &str, instance_id: &str, public_ip_v4: &str) {
        self.lock().spawns.push_back(Ok(SpawnedInstance {
            instance_id: instance_id.to_owned(),
            public_ip_v4: public_ip_v4.to_owned(),
            public_ip_v6: None,
            region: region.to_owned(),
        }));
    }

    /// Queues a failed spawn answer.
    pub fn push_spawn_failure(&self, message: &str) {
        self.lock().spawns.push_back(Err(message.to_owned()));
    }

    /// Makes terminating `instance_id` fail.
    pub fn fail_terminate(&self, instance_id: &str, message: &str) {
        self.lock()
            .terminate_failures
            .insert(instance_id.to_owned(), message.to_owned());
    }

    /// Makes every later `connect` fail, or succeed again with `None`.
    pub fn fail_connect(&self, message: Option<&str>) {
        self.lock().connect_failure = message.map(str::to_owned);
    }

    /// Makes every later `disconnect` fail.
    pub fn fail_disconnect(&self, message: &str) {
        self.lock().disconnect_failure = Some(message.to_owned());
    }

    /// Sets the tunnel state reported once queued statuses run out.
    pub fn set_status(&self, status: VpnStatusRecord) {
        self.lock().status = status;
    }

    /// Queues a one-off status answer.
    pub fn push_status(&self, status: Result<VpnStatusRecord, &str>) {
        self.lock()
            .statuses
            .push_back(status.map_err(str::to_owned));
    }

    /// Makes every later `subscribe_metrics` fail, or succeed again with
    /// `None`.
    pub fn fail_subscribe(&self, message: Option<&str>) {
        self.lock().subscribe_failure = message.map(str::to_owned);
    }

    /// Makes every later `unsubscribe_metrics` fail.
    pub fn fail_unsubscribe(&self, message: &str) {
        self.lock().unsubscribe_failure = Some(message.to_owned());
    }

    /// Makes every later `save_credentials` fail.
    pub fn fail_credentials(&self, message: &str) {
        self.lock().credentials_failure = Some(message.to_owned());
    }

    /// Pushes a record into the newest open metrics feed.
    ///
    /// Returns `false` when no feed accepted it.
    #[must_use]
    pub fn push_metrics(&self, record: MetricsRecord) -> bool {
        self.lock()
            .feeds
            .last()
            .is_some_and(|(_, sender)| sender.try_send(record).is_ok())
    }

    /// Pushes a record into every feed the backend still considers open,
    /// returning how many accepted it.
    #[must_use]
    pub fn push_metrics_to_all(&self, record: &MetricsRecord) -> usize {
        self.lock()
            .feeds
            .iter()
            .filter(|(_, sender)| sender.try_send(record.clone()).is_ok())
            .count()
    }

    /// Ends the newest open metrics feed as if the backend dropped it.
    ///
    /// Returns `false` when no feed was open.
    #[must_use]
    pub fn close_latest_feed(&self) -> bool {
        self.lock().feeds.pop().is_some()
    }

    /// Identifiers of feeds the backend still considers open.
    #[must_use]
    pub fn open_feeds(&self) -> Vec<String> {
        self.lock().feeds.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Credentials stored through `save_credentials`.
    #[must_use]
    pub fn saved_credentials(&self) -> Vec<Credentials> {
        self.lock().saved_credentials.clone()
    }

    /// All calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    #[must_use]
    pub fn count_calls(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }
}

impl Backend for ScriptedBackend {
    type Error = ScriptedFailure;

    fn list_regions(&self) -> BackendFuture<'_, Vec<RegionRecord>, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::ListRegions);
            self.pass_gate(GatedCall::ListRegions).await;
            let scripted = self.lock().regions.clone();
            scripted.unwrap_or_else(|| Ok(Vec::new())).map_err(ScriptedFailure)
        })
    }

    fn list_instances<'a>(
        &'a self,
        region: &'a str,
    ) -> BackendFuture<'a, Vec<InstanceRecord>, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::ListInstances(region.to_owned()));
            self.pass_gate(GatedCall::ListInstances).await;
            let scripted = self.lock().instances.get(region).cloned();
            scripted.unwrap_or_else(|| Ok(Vec::new())).map_err(ScriptedFailure)
        })
    }

    fn spawn_instance<'a>(
        &'a self,
        region: &'a str,
    ) -> BackendFuture<'a, SpawnedInstance, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Spawn(region.to_owned()));
            self.pass_gate(GatedCall::Spawn).await;
            let scripted = self.lock().spawns.pop_front();
            scripted
                .unwrap_or_else(|| Err(String::from("no scripted spawn")))
                .map_err(ScriptedFailure)
        })
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
        region: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Terminate {
                instance_id: instance_id.to_owned(),
                region: region.to_owned(),
            });
            self.pass_gate(GatedCall::Terminate).await;
            let failure = self.lock().terminate_failures.get(instance_id).cloned();
            failure.map_or(Ok(()), |message| Err(ScriptedFailure(message)))
        })
    }

    fn connect<'a>(
        &'a self,
        instance_id: &'a str,
        region: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Connect {
                instance_id: instance_id.to_owned(),
                region: region.to_owned(),
            });
            self.pass_gate(GatedCall::Connect).await;
            let mut script = self.lock();
            if let Some(message) = script.connect_failure.clone() {
                return Err(ScriptedFailure(message));
            }
            script.status = connected_status(instance_id);
            Ok(())
        })
    }

    fn disconnect(&self) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Disconnect);
            let mut script = self.lock();
            if let Some(message) = script.disconnect_failure.clone() {
                return Err(ScriptedFailure(message));
            }
            script.status = VpnStatusRecord::default();
            Ok(())
        })
    }

    fn vpn_status(&self) -> BackendFuture<'_, VpnStatusRecord, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Status);
            self.pass_gate(GatedCall::Status).await;
            let mut script = self.lock();
            match script.statuses.pop_front() {
                Some(answer) => answer.map_err(ScriptedFailure),
                None => Ok(script.status.clone()),
            }
        })
    }

    fn subscribe_metrics(&self) -> BackendFuture<'_, MetricsFeed, Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Subscribe);
            self.pass_gate(GatedCall::Subscribe).await;
            let mut script = self.lock();
            if let Some(message) = script.subscribe_failure.clone() {
                return Err(ScriptedFailure(message));
            }
            script.feed_counter += 1;
            let id = format!("feed-{}", script.feed_counter);
            let (sender, updates) = mpsc::channel(16);
            script.feeds.push((id.clone(), sender));
            Ok(MetricsFeed { id, updates })
        })
    }

    fn unsubscribe_metrics<'a>(&'a self, feed_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::Unsubscribe(feed_id.to_owned()));
            let mut script = self.lock();
            if let Some(message) = script.unsubscribe_failure.clone() {
                return Err(ScriptedFailure(message));
            }
            script.feeds.retain(|(id, _)| id != feed_id);
            Ok(())
        })
    }

    fn save_credentials<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.record(BackendCall::SaveCredentials(credentials.provider.clone()));
            let mut script = self.lock();
            if let Some(message) = script.credentials_failure.clone() {
                return Err(ScriptedFailure(message));
            }
            script.saved_credentials.push(credentials.clone());
            Ok(())
        })
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Text written to stdin, if any.
    pub stdin: Option<String>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with `stdout`.
    pub fn push_json(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a str>,
    ) -> BackendFuture<'a, CommandOutput, CommandError> {
        Box::pin(async move {
            self.invocations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(CommandInvocation {
                    program: program.to_owned(),
                    args: args.to_vec(),
                    stdin: stdin.map(str::to_owned),
                });
            self.responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .ok_or_else(|| CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
