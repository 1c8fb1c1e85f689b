//! devbox-ssh - Entry point
//!
//! Parses CLI arguments, validates configuration and runs one subcommand.
//! Logs go to stderr; stdout carries only command output (key lines, config
//! blocks, status) so it can be piped.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use devbox_ssh::ca::CertificateAuthority;
use devbox_ssh::config::{Args, Command, Config};
use devbox_ssh::error::DevboxError;
use devbox_ssh::provision::{ContainerEndpoint, DirectoryInstaller, Provisioner};
use devbox_ssh::ssh::{RemoteHost, SshProfile, TrustMode, TrustStore};
use devbox_ssh::status::Status;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize tracing/logging to stderr (stdout is for command output)
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            if let Some(hint) = e.downcast_ref::<DevboxError>().and_then(DevboxError::hint) {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Validate and create config
    let config = Config::from_args(&args)?;
    let paths = &config.paths;
    let ca = CertificateAuthority::new(&paths.ca_dir);

    match args.command {
        Command::Init => {
            let public_key = ca.generate()?;
            info!("CA private key: {}", ca.private_key_path().display());
            println!("{}", public_key);
        }

        Command::Status { json } => {
            let status = Status::collect(paths, &config.alias_pattern)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", status);
            }
        }

        Command::PublicKey => {
            ca.ensure_ready()?;
            println!("{}", ca.public_key()?);
        }

        Command::Sign {
            host_key,
            alias,
            remote,
        } => {
            let cert_path = ca
                .sign_host_key(&host_key, &alias, &remote)
                .with_context(|| format!("failed to sign {}", host_key.display()))?;
            println!("{}", cert_path.display());
        }

        Command::Trust { remote } => {
            ca.ensure_ready()?;
            let remote: RemoteHost = remote.parse()?;
            let store = TrustStore::new(&paths.known_hosts)
                .with_alias_pattern(config.alias_pattern.clone());
            if store.write_entry(&ca.public_key()?, &remote)? {
                println!("Trusted CA for {}", remote.known_hosts_pattern());
            } else {
                println!("CA already trusted for {}", remote.known_hosts_pattern());
            }
        }

        Command::Render {
            alias,
            address,
            port,
            user,
            insecure_no_host_check,
        } => {
            let trust = if insecure_no_host_check {
                warn!("Host key checking disabled for {}: any host key will be accepted", alias);
                TrustMode::Disabled
            } else {
                TrustMode::CertAuthority(paths.known_hosts.clone())
            };
            let block = SshProfile::new(alias, address, trust)
                .with_port(port)
                .with_user(user)
                .with_control_dir(paths.control_dir.to_string_lossy())
                .render()?;
            print!("{}", block);
        }

        Command::Provision {
            alias,
            remote_host,
            ssh_port,
            user,
        } => {
            let provisioner =
                Provisioner::from_config(&config, DirectoryInstaller::new(&paths.hosts_dir));
            let endpoint = ContainerEndpoint::new(alias, remote_host, user, ssh_port);

            let cancel = CancellationToken::new();
            let shutdown_handle = spawn_shutdown_handler(cancel.clone());

            let result = provisioner.provision(&endpoint, &cancel).await;
            shutdown_handle.abort();

            let outcome = result.with_context(|| format!("failed to provision {}", endpoint.alias))?;
            info!(
                "Host key {} signed for {}",
                outcome.host_key_fingerprint,
                outcome.principals.join(", ")
            );
            println!(
                "{}",
                provisioner.installer().dir_for(&outcome.alias)?.display()
            );
        }

        Command::Deprovision { alias } => {
            let provisioner =
                Provisioner::from_config(&config, DirectoryInstaller::new(&paths.hosts_dir));
            if !provisioner.deprovision(&alias).await? {
                info!("No SSH config block for {}", alias);
            }
        }
    }

    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM
fn spawn_shutdown_handler(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), cancelling...");
            }
            _ = terminate() => {
                info!("Received SIGTERM, cancelling...");
            }
        }
        token.cancel();
    })
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
