//! Subcommand handling for rashomon.
//!
//! Everything except `serve` is a short operator action against the data
//! directory: it opens the database, does one thing and prints the result.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::cli::Commands;
use crate::config::Settings;
use crate::interceptor::RequestInterceptor;
use crate::orchestrator::{self, open_services};
use crate::policy::{PolicyEngine, PolicyFormat};
use crate::proxy::CertificateAuthority;
use crate::views::{AgentView, PolicyView};

/// Run a subcommand, writing its output to stdout.
pub fn handle_command(command: Commands, settings: &Settings) -> Result<()> {
    if command == Commands::Serve {
        return orchestrator::run_daemon(settings);
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_command(command, settings, &mut out)
}

/// Run an operator subcommand against `out`.
pub fn run_command(command: Commands, settings: &Settings, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Serve => orchestrator::run_daemon(settings),
        Commands::ValidatePolicy { file } => validate_policy(&file, out),
        Commands::CaPath => {
            let ca = CertificateAuthority::load_or_create(&settings.data_dir)
                .context("Failed to load or create the local CA")?;
            writeln!(out, "{}", ca.cert_path().display())?;
            Ok(())
        }
        Commands::VerifyAudit => {
            let interceptor = open(settings)?;
            let report = interceptor
                .services()
                .audit
                .verify()
                .context("Failed to read the audit log")?;
            print_json(out, &report)?;
            if !report.is_valid() {
                bail!(
                    "Audit chain broken at {} ({} entries affected)",
                    report.first_broken.as_deref().unwrap_or("?"),
                    report.broken.len()
                );
            }
            Ok(())
        }
        Commands::ExportAudit { format } => {
            let interceptor = open(settings)?;
            let rendered = interceptor
                .services()
                .audit
                .export(format)
                .context("Failed to export the audit log")?;
            out.write_all(rendered.as_bytes())?;
            if !rendered.ends_with('\n') {
                writeln!(out)?;
            }
            Ok(())
        }
        Commands::ApproveDomain { domain } => {
            let record = open(settings)?
                .approve_domain(&domain)
                .with_context(|| format!("Failed to approve {domain}"))?;
            print_json(out, &record)
        }
        Commands::DenyDomain { domain } => {
            let record = open(settings)?
                .deny_domain(&domain)
                .with_context(|| format!("Failed to deny {domain}"))?;
            print_json(out, &record)
        }
        Commands::Domains { unknown } => {
            let interceptor = open(settings)?;
            let domains = &interceptor.services().domains;
            let records = if unknown {
                domains.get_unknown_domains()
            } else {
                domains.get_domain_stats()
            }
            .context("Failed to read domains")?;
            print_json(out, &records)
        }
        Commands::Agents => {
            let agents: Vec<AgentView> = open(settings)?
                .services()
                .registry
                .list()
                .context("Failed to read agents")?
                .into_iter()
                .map(AgentView::from)
                .collect();
            print_json(out, &agents)
        }
        Commands::KillAgent { id } => match open(settings)?.kill_agent(&id)? {
            Some(record) => print_json(out, &AgentView::from(record)),
            None => bail!("Unknown agent '{id}'"),
        },
        Commands::ResumeAgent { id } => match open(settings)?.resume_agent(&id)? {
            Some(record) => print_json(out, &AgentView::from(record)),
            None => bail!("Unknown agent '{id}'"),
        },
        Commands::Policies => {
            let views: Vec<PolicyView> = open(settings)?
                .services()
                .policy
                .policies()
                .iter()
                .map(PolicyView::from)
                .collect();
            print_json(out, &views)
        }
    }
}

fn open(settings: &Settings) -> Result<RequestInterceptor> {
    let (services, _) = open_services(settings)?;
    Ok(RequestInterceptor::new(services))
}

fn validate_policy(path: &Path, out: &mut impl Write) -> Result<()> {
    let Some(format) = PolicyFormat::from_path(path) else {
        bail!("{}: expected a .yaml, .yml or .toml file", path.display());
    };
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match PolicyEngine::validate_source(&source, format) {
        Ok(document) => {
            writeln!(
                out,
                "{}: ok ({} rules)",
                path.display(),
                document.rule_count()
            )?;
            Ok(())
        }
        Err(e) => bail!("{}: {}: {}", path.display(), e.field, e.message),
    }
}

fn print_json(out: &mut impl Write, value: &impl Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ExportFormat;
    use crate::config::Config;
    use serde_json::Value;

    fn settings(dir: &Path) -> Settings {
        let mut config: Config = toml::from_str(include_str!("config/defaults.toml")).unwrap();
        config.storage.data_dir = Some(dir.to_path_buf());
        config.resolve().unwrap()
    }

    fn run(command: Commands, settings: &Settings) -> Result<String> {
        let mut out = Vec::new();
        run_command(command, settings, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_validate_policy() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let good = dir.path().join("corp.yaml");
        std::fs::write(
            &good,
            "name: corp\nglobal:\n  default_action: allow\ndomains:\n  denied: [\"*.paste.test\"]\n",
        )
        .unwrap();
        let output = run(Commands::ValidatePolicy { file: good }, &settings).unwrap();
        assert!(output.contains("ok (1 rules)"));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "name = \"bad\"\n").unwrap();
        let err = run(Commands::ValidatePolicy { file: bad }, &settings).unwrap_err();
        assert!(err.to_string().contains("global.default_action"));

        let unknown = dir.path().join("notes.txt");
        std::fs::write(&unknown, "").unwrap();
        assert!(run(Commands::ValidatePolicy { file: unknown }, &settings).is_err());
    }

    #[test]
    fn test_domain_commands_are_audited() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        let output = run(
            Commands::ApproveDomain {
                domain: "api.example.com".into(),
            },
            &settings,
        )
        .unwrap();
        let record: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(record["status"], "allowed");
        assert_eq!(record["addedBy"], "user");

        run(
            Commands::DenyDomain {
                domain: "paste.example.test".into(),
            },
            &settings,
        )
        .unwrap();

        let output = run(Commands::Domains { unknown: false }, &settings).unwrap();
        let domains: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(domains.as_array().unwrap().len(), 2);

        let output = run(Commands::VerifyAudit, &settings).unwrap();
        let report: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(report["totalEntries"], 2);

        let csv = run(
            Commands::ExportAudit {
                format: ExportFormat::Csv,
            },
            &settings,
        )
        .unwrap();
        assert!(csv.starts_with("id,timestamp,event_type"));
        assert!(csv.contains("domain_approved"));
    }

    #[test]
    fn test_kill_unknown_agent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let err = run(Commands::KillAgent { id: "ghost".into() }, &settings).unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert_eq!(run(Commands::Agents, &settings).unwrap().trim(), "[]");
    }

    #[test]
    fn test_ca_path() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let output = run(Commands::CaPath, &settings).unwrap();
        let path = std::path::PathBuf::from(output.trim());
        assert!(path.exists());
        assert!(path.ends_with(crate::proxy::ca::CA_CERT_FILE));
    }
}
