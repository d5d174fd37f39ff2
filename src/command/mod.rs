//! Backend transport that shells out to the `byocvpn` helper binary.
//!
//! Every operation maps to one helper invocation. Listings and status calls
//! pass `-o json` and parse stdout; mutations only check the exit status.
//! Metrics subscriptions are served by a background task that samples
//! `vpn metrics` on an interval and pushes each sample into the feed.

mod error;
mod types;

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::backend::{
    Backend, BackendFuture, Credentials, InstanceRecord, MetricsFeed, MetricsRecord, RegionRecord,
    SpawnedInstance, VpnStatusRecord,
};
use crate::config::ClientConfig;

pub use error::CommandError;
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner};

fn argv(parts: &[&str]) -> Vec<OsString> {
    parts.iter().map(OsString::from).collect()
}

fn with_json_output(mut args: Vec<OsString>) -> Vec<OsString> {
    args.push(OsString::from("-o"));
    args.push(OsString::from("json"));
    args
}

/// Checks command output and converts failure to [`CommandError::Failure`].
fn check_output(
    program: &str,
    output: CommandOutput,
    resource: &str,
) -> Result<CommandOutput, CommandError> {
    if output.is_success() {
        return Ok(output);
    }
    Err(CommandError::Failure {
        program: program.to_owned(),
        status: output.code,
        status_text: output.status_text(),
        stderr: format!("{resource}: {}", output.stderr.trim()),
    })
}

async fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[OsString],
    stdin: Option<&str>,
    resource: &str,
) -> Result<CommandOutput, CommandError> {
    let output = runner.run(program, args, stdin).await?;
    check_output(program, output, resource)
}

async fn run_json<R, T>(
    runner: &R,
    program: &str,
    args: &[OsString],
    resource: &str,
) -> Result<T, CommandError>
where
    R: CommandRunner + ?Sized,
    T: DeserializeOwned,
{
    let output = run_checked(runner, program, args, None, resource).await?;
    serde_json::from_str::<T>(&output.stdout).map_err(|err| CommandError::Parse {
        resource: resource.to_owned(),
        message: err.to_string(),
    })
}

async fn sample_metrics<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
) -> Result<MetricsRecord, CommandError> {
    let args = with_json_output(argv(&["vpn", "metrics"]));
    run_json(runner, program, &args, "metrics").await
}

/// [`Backend`] implementation that drives the helper binary.
#[derive(Debug)]
pub struct CommandBackend<R = ProcessCommandRunner> {
    runner: Arc<R>,
    program: String,
    metrics_interval: Duration,
    metrics_buffer: usize,
    feeds: Mutex<HashMap<String, JoinHandle<()>>>,
    next_feed: AtomicU64,
}

impl CommandBackend<ProcessCommandRunner> {
    /// Creates a backend wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(config: &ClientConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> CommandBackend<R> {
    /// Creates a backend using the configured helper and the given runner.
    #[must_use]
    pub fn new(config: &ClientConfig, runner: R) -> Self {
        Self {
            runner: Arc::new(runner),
            program: config.backend_bin.clone(),
            metrics_interval: config.metrics_poll_interval(),
            metrics_buffer: config.metrics_buffer.max(1),
            feeds: Mutex::new(HashMap::new()),
            next_feed: AtomicU64::new(1),
        }
    }

    /// Number of open metrics feeds.
    #[must_use]
    pub fn open_feeds(&self) -> usize {
        self.feeds_lock().len()
    }

    fn feeds_lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn execute(&self, args: Vec<OsString>, resource: &str) -> Result<(), CommandError> {
        run_checked(self.runner.as_ref(), &self.program, &args, None, resource).await?;
        Ok(())
    }

    async fn query<T: DeserializeOwned>(
        &self,
        args: Vec<OsString>,
        resource: &str,
    ) -> Result<T, CommandError> {
        run_json(
            self.runner.as_ref(),
            &self.program,
            &with_json_output(args),
            resource,
        )
        .await
    }
}

impl<R> Drop for CommandBackend<R> {
    fn drop(&mut self) {
        let feeds = self.feeds.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in feeds.drain() {
            handle.abort();
        }
    }
}

impl<R: CommandRunner + 'static> Backend for CommandBackend<R> {
    type Error = CommandError;

    fn list_regions(&self) -> BackendFuture<'_, Vec<RegionRecord>, Self::Error> {
        Box::pin(self.query(argv(&["regions", "list"]), "regions"))
    }

    fn list_instances<'a>(
        &'a self,
        region: &'a str,
    ) -> BackendFuture<'a, Vec<InstanceRecord>, Self::Error> {
        Box::pin(self.query(
            argv(&["instances", "list", "--region", region]),
            "instances",
        ))
    }

    fn spawn_instance<'a>(
        &'a self,
        region: &'a str,
    ) -> BackendFuture<'a, SpawnedInstance, Self::Error> {
        Box::pin(self.query(
            argv(&["instances", "spawn", "--region", region]),
            "instance spawn",
        ))
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
        region: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.execute(
            argv(&["instances", "terminate", instance_id, "--region", region]),
            "instance terminate",
        ))
    }

    fn connect<'a>(
        &'a self,
        instance_id: &'a str,
        region: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.execute(
            argv(&["vpn", "connect", instance_id, "--region", region]),
            "vpn connect",
        ))
    }

    fn disconnect(&self) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(self.execute(argv(&["vpn", "disconnect"]), "vpn disconnect"))
    }

    fn vpn_status(&self) -> BackendFuture<'_, VpnStatusRecord, Self::Error> {
        Box::pin(self.query(argv(&["vpn", "status"]), "vpn status"))
    }

    fn subscribe_metrics(&self) -> BackendFuture<'_, MetricsFeed, Self::Error> {
        Box::pin(async move {
            // A failing first sample fails the subscription.
            let first = sample_metrics(self.runner.as_ref(), &self.program).await?;
            let (sender, updates) = mpsc::channel(self.metrics_buffer);
            if sender.try_send(first).is_err() {
                debug!("metrics channel refused the first sample");
            }

            let id = format!(
                "metrics-{}",
                self.next_feed.fetch_add(1, Ordering::Relaxed)
            );
            let runner = Arc::clone(&self.runner);
            let program = self.program.clone();
            let interval = self.metrics_interval;
            let feed_id = id.clone();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match sample_metrics(runner.as_ref(), &program).await {
                        Ok(record) => {
                            if sender.send(record).await.is_err() {
                                debug!(feed = %feed_id, "metrics receiver closed");
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(feed = %feed_id, error = %err, "metrics sample failed");
                        }
                    }
                }
            });

            self.feeds_lock().insert(id.clone(), handle);
            debug!(feed = %id, "metrics feed opened");
            Ok(MetricsFeed { id, updates })
        })
    }

    fn unsubscribe_metrics<'a>(&'a self, feed_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let handle = self.feeds_lock().remove(feed_id);
            match handle {
                Some(task) => {
                    task.abort();
                    debug!(feed = %feed_id, "metrics feed closed");
                }
                None => debug!(feed = %feed_id, "metrics feed already closed"),
            }
            Ok(())
        })
    }

    fn save_credentials<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let payload =
                serde_json::to_string(credentials).map_err(|err| CommandError::Parse {
                    resource: String::from("credentials"),
                    message: err.to_string(),
                })?;
            let args = argv(&["credentials", "save", "--provider", credentials.provider.as_str()]);
            run_checked(
                self.runner.as_ref(),
                &self.program,
                &args,
                Some(&payload),
                "credentials save",
            )
            .await?;
            Ok(())
        })
    }
}
