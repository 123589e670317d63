//! Command-line interface definitions for rashomon.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::audit::ExportFormat;

/// Local interception proxy for AI-agent network traffic.
///
/// rashomon sits between coding agents and the network. Every request is
/// attributed to an agent, checked against policy (domains, rate limits,
/// secrets, intent) and recorded in a tamper-evident audit ledger.
#[derive(Parser, Debug)]
#[command(name = "rashomon")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (defaults to `serve`).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to additional config file.
    ///
    /// Merged on top of system and user configs; only CLI flags take
    /// precedence over it.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the database and the local CA.
    #[arg(long = "data-dir", value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory of policy documents.
    #[arg(long = "policy-dir", value_name = "DIR", global = true)]
    pub policy_dir: Option<PathBuf>,

    /// Proxy listen address (loopback only).
    #[arg(short = 'l', long = "listen", value_name = "ADDR", global = true)]
    pub listen: Option<String>,

    /// Tunnel every CONNECT opaquely instead of decrypting it.
    #[arg(long = "no-tls-intercept", global = true)]
    pub no_tls_intercept: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit diagnostic logs as JSON lines.
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,
}

/// Subcommands for rashomon.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the proxy until interrupted.
    Serve,

    /// Recompute the audit hash chain and report tampering.
    #[command(name = "verify-audit")]
    VerifyAudit,

    /// Write the audit log to stdout.
    #[command(name = "export-audit")]
    ExportAudit {
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
    },

    /// Check a policy document without loading it.
    #[command(name = "validate-policy")]
    ValidatePolicy {
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Mark a domain as approved.
    #[command(name = "approve-domain")]
    ApproveDomain { domain: String },

    /// Mark a domain as denied.
    #[command(name = "deny-domain")]
    DenyDomain { domain: String },

    /// List known domains.
    Domains {
        /// Only domains still waiting for a decision.
        #[arg(long)]
        unknown: bool,
    },

    /// List detected agents.
    Agents,

    /// Block every further request from an agent.
    #[command(name = "kill-agent")]
    KillAgent { id: String },

    /// Lift a kill.
    #[command(name = "resume-agent")]
    ResumeAgent { id: String },

    /// List loaded policy documents.
    Policies,

    /// Print the path of the local CA certificate.
    #[command(name = "ca-path")]
    CaPath,
}

impl Cli {
    /// The subcommand to run; no subcommand means `serve`.
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}
