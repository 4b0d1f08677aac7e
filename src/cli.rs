//! Command-line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Short-lived Kubernetes client certificates
#[derive(Parser, Debug)]
#[command(name = "kubetoken")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "KUBETOKEN_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KUBETOKEN_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the issuing server
    Serve {
        /// Path to configuration file (YAML)
        #[arg(short, long, env = "KUBETOKEN_CONFIG")]
        config: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
    },

    /// List the roles available to the user
    Roles {
        /// Server and credentials
        #[command(flatten)]
        client: ClientArgs,

        /// Only show roles matching this regular expression
        #[arg(short, long, default_value = "")]
        filter: String,
    },

    /// Obtain a certificate for a role and write it to disk
    Login {
        /// Server and credentials
        #[command(flatten)]
        client: ClientArgs,

        /// Role to request; when omitted the filter must match exactly one role
        #[arg(short, long)]
        role: Option<String>,

        /// Only consider roles matching this regular expression
        #[arg(short, long, default_value = "")]
        filter: String,

        /// Override the namespace carried by the role
        #[arg(short, long)]
        namespace: Option<String>,

        /// Directory receiving `certs/<role>/` (default: ~/.kube)
        #[arg(short, long, env = "KUBETOKEN_DIR")]
        out: Option<PathBuf>,

        /// Print the server response as JSON
        #[arg(short, long)]
        json: bool,

        /// Maximum step-up redirects to follow
        #[arg(long, default_value_t = 3)]
        max_step_up_rounds: u32,
    },

    /// Print the local version and compare it with the server's
    Version {
        /// Issuing server URL
        #[arg(long, env = "KUBETOKEN_HOST")]
        host: Option<String>,
    },

    /// Certificate authority tooling
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// Connection settings shared by client subcommands
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Issuing server URL
    #[arg(long, env = "KUBETOKEN_HOST", default_value = "https://kubetoken.example.com")]
    pub host: String,

    /// Directory username
    #[arg(short, long, env = "USER")]
    pub user: String,

    /// Directory password
    #[arg(short = 'P', long, env = "KUBETOKEN_PW", hide_env_values = true)]
    pub password: String,
}

/// Certificate authority subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Create a self-signed CA for an environment
    InitCa {
        /// Common Name of the CA
        #[arg(long, default_value = "kubetoken CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: i64,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// File stem (`<stem>.pem`, `<stem>-key.pem`)
        #[arg(long, default_value = "ca")]
        stem: String,
    },

    /// Issue a leaf certificate signed by an existing CA
    Issue {
        /// CA certificate (PEM)
        #[arg(long)]
        ca_cert: PathBuf,

        /// CA private key (PEM)
        #[arg(long)]
        ca_key: PathBuf,

        /// Common Name of the leaf
        #[arg(long)]
        cn: String,

        /// Intended use
        #[arg(long, value_enum, default_value_t = LeafUsage::Server)]
        usage: LeafUsage,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: i64,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// File stem (defaults to the Common Name)
        #[arg(long)]
        stem: Option<String>,
    },
}

/// Extended key usage of an issued leaf
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafUsage {
    /// TLS server authentication
    Server,
    /// TLS client authentication
    Client,
    /// Both
    Both,
}
