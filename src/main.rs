//! Binary entry point for the `byocvpn-sync` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use byocvpn_sync::{
    ClientConfig, CommandBackend, Credentials, DashboardView, Instance, RegionGroup,
    SessionPhase, Synchronizer, SynchronizerError, SynchronizerOptions, VpnSession,
};

mod cli;

use cli::{Cli, CredentialsCommand, WatchCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Sync(#[from] SynchronizerError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

type Client = Synchronizer<CommandBackend>;

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config() -> Result<ClientConfig, CliError> {
    let config =
        ClientConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = load_config()?;
    let backend = Arc::new(CommandBackend::with_process_runner(&config));
    let client = Synchronizer::new(backend, SynchronizerOptions::from(&config));
    let mut out = io::stdout();

    match cli {
        Cli::Regions => {
            client.reload_regions().await?;
            write_regions(&mut out, &client.catalog().groups())?;
        }
        Cli::Instances => {
            client.bootstrap().await?;
            let view = client.view();
            write_instances(&mut out, &view.instances)?;
            if !view.failed_regions.is_empty() {
                writeln!(out, "unreachable regions: {}", view.failed_regions.join(", "))?;
            }
        }
        Cli::Spawn(arg) => {
            client.reload_regions().await?;
            let instance = client.spawn(&arg.region).await?;
            write_instances(&mut out, &[instance])?;
        }
        Cli::Terminate(arg) => {
            client.bootstrap().await?;
            client.terminate(&arg.instance_id).await?;
            writeln!(out, "terminated {}", arg.instance_id)?;
        }
        Cli::Connect(arg) => {
            client.bootstrap().await?;
            let session = client.connect(&arg.instance_id).await?;
            write_session(&mut out, &session, client.session().phase())?;
        }
        Cli::Disconnect => {
            client.disconnect().await?;
            writeln!(out, "disconnected")?;
        }
        Cli::Status => {
            client.bootstrap().await?;
            write_session(&mut out, &client.session().session(), client.session().phase())?;
        }
        Cli::Watch(command) => watch(&client, &config, &command, &mut out).await?,
        Cli::Credentials(command) => save_credentials(&client, command, &mut out).await?,
    }
    Ok(())
}

async fn watch(
    client: &Client,
    config: &ClientConfig,
    command: &WatchCommand,
    out: &mut impl Write,
) -> Result<(), CliError> {
    client.bootstrap().await?;
    client.start();
    let outcome = async {
        for _ in 0..command.ticks {
            tokio::time::sleep(config.status_poll_interval()).await;
            write_view(out, &client.view())?;
        }
        Ok::<(), CliError>(())
    }
    .await;
    client.shutdown().await;
    outcome
}

async fn save_credentials(
    client: &Client,
    command: CredentialsCommand,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let credentials = Credentials::new(
        command.provider,
        command.access_key_id,
        command.secret_access_key,
    );
    let report = client.save_credentials(&credentials).await?;
    writeln!(
        out,
        "saved {} credentials: {} regions, {} instances",
        credentials.provider, report.regions, report.instances
    )?;
    Ok(())
}

fn write_regions(out: &mut impl Write, groups: &[RegionGroup]) -> io::Result<()> {
    for group in groups {
        writeln!(out, "{}", group.continent)?;
        for region in &group.regions {
            writeln!(out, "  {}\t{}", region.code, region.display_country)?;
        }
    }
    Ok(())
}

fn write_instances(out: &mut impl Write, instances: &[Instance]) -> io::Result<()> {
    if instances.is_empty() {
        return writeln!(out, "no instances");
    }
    for instance in instances {
        let address = if instance.public_ip_v4.is_empty() {
            "-"
        } else {
            instance.public_ip_v4.as_str()
        };
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            instance.id,
            instance.display_name,
            instance.region,
            instance.lifecycle_state.label(),
            address
        )?;
    }
    Ok(())
}

fn write_session(out: &mut impl Write, session: &VpnSession, phase: SessionPhase) -> io::Result<()> {
    match session {
        VpnSession::Disconnected => writeln!(out, "{}", phase_label(phase)),
        VpnSession::Connected { instance, resolved } => {
            let origin = if *resolved { "" } else { " (not in inventory)" };
            writeln!(
                out,
                "connected to {} in {} at {}{origin}",
                instance.id,
                if instance.region.is_empty() {
                    "unknown region"
                } else {
                    instance.region.as_str()
                },
                instance.public_ip_v4
            )
        }
    }
}

fn write_view(out: &mut impl Write, view: &DashboardView) -> io::Result<()> {
    write_session(out, &view.session, view.phase)?;
    if let Some(metrics) = &view.metrics {
        writeln!(
            out,
            "  sent {} B ({:.1} B/s)  received {} B ({:.1} B/s)",
            metrics.bytes_sent, metrics.upload_rate, metrics.bytes_received, metrics.download_rate
        )?;
    }
    for notice in &view.notices {
        writeln!(out, "  [{}] {}", notice.kind, notice.message)?;
    }
    Ok(())
}

const fn phase_label(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Disconnected => "disconnected",
        SessionPhase::Connecting => "connecting",
        SessionPhase::Connected => "connected",
        SessionPhase::Error => "error",
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
