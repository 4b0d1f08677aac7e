//! kubetoken - short-lived Kubernetes client certificates
//!
//! `kubetoken serve` runs the issuing server; the other subcommands are the
//! client side and CA tooling.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rcgen::ExtendedKeyUsagePurpose;
use tracing::{error, info};

use kubetoken::{
    cli::{ClientArgs, Cli, Command, LeafUsage, TlsCommand},
    client::{IssuanceClient, filter_roles, plan_contexts, write_bundle},
    config::Config,
    pki,
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Serve { config, port, host } => return run_server(config, port, host).await,
        Command::Roles { client, filter } => run_roles(&client, &filter).await,
        Command::Login {
            client,
            role,
            filter,
            namespace,
            out,
            json,
            max_step_up_rounds,
        } => {
            run_login(
                &client,
                role,
                &filter,
                namespace.as_deref(),
                out,
                json,
                max_step_up_rounds,
            )
            .await
        }
        Command::Version { host } => run_version(host.as_deref()).await,
        Command::Tls(cmd) => run_tls(cmd),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the issuing server
async fn run_server(config: Option<PathBuf>, port: Option<u16>, host: Option<String>) -> ExitCode {
    let config = match Config::load(config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        environments = config.environments.len(),
        step_up = config.step_up.enabled,
        "Starting kubetoken server"
    );

    let server = match Server::new(&config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

fn client(args: &ClientArgs) -> kubetoken::Result<IssuanceClient> {
    IssuanceClient::new(&args.host, &args.user, &args.password)
}

/// List available roles
async fn run_roles(args: &ClientArgs, filter: &str) -> kubetoken::Result<()> {
    let roles = filter_roles(client(args)?.fetch_roles().await?, filter)?;
    for role in roles {
        println!("{role}");
    }
    Ok(())
}

/// Request a certificate and write the credentials
async fn run_login(
    args: &ClientArgs,
    role: Option<String>,
    filter: &str,
    namespace: Option<&str>,
    out: Option<PathBuf>,
    json: bool,
    max_step_up_rounds: u32,
) -> kubetoken::Result<()> {
    let client = client(args)?
        .with_max_step_up_rounds(max_step_up_rounds)
        .with_step_up_notice(|_| println!("Awaiting step-up approval."));

    // Fetching roles first also checks the password.
    let roles = filter_roles(client.fetch_roles().await?, filter)?;
    let role = match role {
        Some(role) => role,
        None => match roles.as_slice() {
            [] => {
                return Err(kubetoken::Error::Config(
                    "no matching role found".to_string(),
                ));
            }
            [role] => {
                println!("Auto selecting matching role: {role}");
                role.clone()
            }
            many => {
                println!("Available roles to choose from:");
                for role in many {
                    println!("\t{role}");
                }
                return Err(kubetoken::Error::Config(
                    "several roles match; pick one with --role or narrow --filter".to_string(),
                ));
            }
        },
    };

    let result = client.request_certificate(&role).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    let out = out.unwrap_or_else(default_kube_dir);
    let paths = write_bundle(&out, &result)?;
    let plan = plan_contexts(&result, namespace)?;

    println!("Certificate: {}", paths.cert.display());
    println!("Key:         {}", paths.key.display());
    println!("CA:          {}", paths.ca.display());
    for ctx in &plan.contexts {
        let marker = if ctx.id == plan.default_context { "*" } else { " " };
        println!(
            "{marker} {}  cluster={} server={} namespace={}",
            ctx.id, ctx.cluster, ctx.server, ctx.namespace
        );
    }
    Ok(())
}

fn default_kube_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(".kube")
}

/// Print the version, warning when the server runs a different one
async fn run_version(host: Option<&str>) -> kubetoken::Result<()> {
    let local = env!("CARGO_PKG_VERSION");
    println!("{local}");

    if let Some(host) = host {
        let remote = IssuanceClient::new(host, "", "")?.remote_version().await?;
        if remote != local {
            eprintln!(
                "Remote kubetoken version, {remote}, does not match local version, {local}. Perhaps an upgrade is in order."
            );
        }
    }
    Ok(())
}

/// CA tooling
fn run_tls(cmd: TlsCommand) -> kubetoken::Result<()> {
    match cmd {
        TlsCommand::InitCa { cn, days, out, stem } => {
            let ca = pki::new_ca(&cn, pki::expiry_in_days(days)?)?;
            ca.write_to_dir(&out, &stem)?;
            println!("CA written to {}", out.join(format!("{stem}.pem")).display());
        }
        TlsCommand::Issue {
            ca_cert,
            ca_key,
            cn,
            usage,
            days,
            out,
            stem,
        } => {
            let ca_cert = std::fs::read_to_string(&ca_cert)?;
            let ca_key = std::fs::read_to_string(&ca_key)?;
            let usages = match usage {
                LeafUsage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
                LeafUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
                LeafUsage::Both => vec![
                    ExtendedKeyUsagePurpose::ServerAuth,
                    ExtendedKeyUsagePurpose::ClientAuth,
                ],
            };
            let leaf = pki::new_leaf(
                &ca_cert,
                &ca_key,
                pki::expiry_in_days(days)?,
                &cn,
                &usages,
            )?;
            let stem = stem.unwrap_or_else(|| cn.clone());
            leaf.write_to_dir(&out, &stem)?;
            println!("Certificate written to {}", out.join(format!("{stem}.pem")).display());
        }
    }
    Ok(())
}
