//! Command-line interface definitions for the `byocvpn-sync` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `byocvpn-sync` binary.
#[derive(Debug, Parser)]
#[command(
    name = "byocvpn-sync",
    about = "Inspect and drive your self-hosted VPN servers through the byocvpn helper",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// List deployable regions grouped by continent.
    #[command(name = "regions", about = "List deployable regions grouped by continent")]
    Regions,
    /// List VPN server instances across every region.
    #[command(name = "instances", about = "List VPN server instances across every region")]
    Instances,
    /// Launch a VPN server in a region.
    #[command(name = "spawn", about = "Launch a VPN server in a region")]
    Spawn(RegionArg),
    /// Terminate a VPN server.
    #[command(name = "terminate", about = "Terminate a VPN server")]
    Terminate(InstanceArg),
    /// Open a tunnel to a VPN server.
    #[command(name = "connect", about = "Open a tunnel to a VPN server")]
    Connect(InstanceArg),
    /// Close the active tunnel.
    #[command(name = "disconnect", about = "Close the active tunnel")]
    Disconnect,
    /// Show the tunnel state.
    #[command(name = "status", about = "Show the tunnel state")]
    Status,
    /// Follow the tunnel state and metrics.
    #[command(name = "watch", about = "Follow the tunnel state and metrics")]
    Watch(WatchCommand),
    /// Store cloud provider credentials.
    #[command(name = "credentials", about = "Store cloud provider credentials")]
    Credentials(CredentialsCommand),
}

/// Region argument shared by region-scoped subcommands.
#[derive(Debug, Parser)]
pub(crate) struct RegionArg {
    /// Region code, for example `us-east-1`.
    #[arg(value_name = "REGION")]
    pub(crate) region: String,
}

/// Instance argument shared by instance-scoped subcommands.
#[derive(Debug, Parser)]
pub(crate) struct InstanceArg {
    /// Backend instance identifier.
    #[arg(value_name = "ID")]
    pub(crate) instance_id: String,
}

/// Arguments for `byocvpn-sync watch`.
#[derive(Debug, Parser)]
pub(crate) struct WatchCommand {
    /// Number of refreshes to print before exiting.
    ///
    /// Each refresh waits one status poll interval.
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub(crate) ticks: u32,
}

/// Arguments for `byocvpn-sync credentials`.
#[derive(Debug, Parser)]
pub(crate) struct CredentialsCommand {
    /// Cloud provider the credentials belong to.
    #[arg(long, value_name = "PROVIDER", default_value = "aws")]
    pub(crate) provider: String,
    /// Access key identifier.
    #[arg(long, value_name = "KEY_ID")]
    pub(crate) access_key_id: String,
    /// Secret access key; read from the environment so it stays out of shell
    /// history.
    #[arg(
        long,
        value_name = "SECRET",
        env = "BYOCVPN_SECRET_ACCESS_KEY",
        hide_env_values = true
    )]
    pub(crate) secret_access_key: String,
}
