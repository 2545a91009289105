//! CLI entry point for build-inspector.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use build_inspector::cli::Cli;
use build_inspector::config::load_config;
use build_inspector::inspector::{process_only, BuildInspector, RunOptions};
use build_inspector::processor::{Classification, ProcessingReport, Verdict};
use build_inspector::sandbox::VagrantHypervisor;
use build_inspector::utils::init_logging;

const EXIT_FATAL: u8 = 1;
const EXIT_UNAUTHORIZED: u8 = 2;

fn print_header() {
    println!("****************************** [:] ******************************");
    println!("* Build Inspector                                               *");
    println!("* Audit what your build talks to.                               *");
    println!("****************************** [:] ******************************");
    println!();
}

fn print_verdict(report: &ProcessingReport, report_path: &std::path::Path) -> ExitCode {
    match report.verdict() {
        Verdict::Clean => println!("[:] No unauthorized network access."),
        Verdict::Inconclusive => println!(
            "[:] No unauthorized network access recorded, but the evidence is incomplete ({} unresolvable).",
            report.counts.unresolvable
        ),
        Verdict::UnauthorizedAccess => {
            println!("[!] Unauthorized network access:");
            for host in report
                .hosts
                .iter()
                .filter(|h| h.classification == Classification::Unauthorized)
            {
                println!("    {} ({} connections)", host.host, host.connections);
            }
        }
    }
    println!("[:] Report: {}", report_path.display());

    if report.has_unauthorized() {
        ExitCode::from(EXIT_UNAUTHORIZED)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let verbosity = init_logging(cli.verbose);

    let settings = cli.settings_path();
    let config = load_config(&settings)
        .with_context(|| format!("cannot load settings from {}", settings.display()))?;

    if let Some(evidence) = &cli.only_process {
        print_header();
        let config = config.with_overrides(cli.package.as_deref());
        let outcome = process_only(
            &config,
            evidence,
            cli.script,
            &cli.package_manager,
            Some(settings.as_path()),
        )?;
        return Ok(print_verdict(&outcome.report, &outcome.report_paths.html));
    }

    let config = config.for_package(cli.package.as_deref())?;
    let target = cli.build_target()?;
    print_header();

    let vagrant_dir = match &config.vagrant.directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine working directory")?,
    };
    let hypervisor = Arc::new(VagrantHypervisor::new(vagrant_dir, verbosity));
    let inspector = BuildInspector::new(config, hypervisor, verbosity)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping the build and collecting partial evidence");
            on_signal.cancel();
        }
    });

    let options = RunOptions {
        target,
        package: cli.package.clone(),
        package_manager: cli.package_manager.clone(),
        rollback: cli.rollback,
        keep_vm: cli.keep_vm,
        output_dir: cli.output.clone(),
        config_path: Some(settings.clone()),
    };
    let outcome = inspector.collect_and_analyze(&options, &cancel).await?;

    println!("[:] Build {}", outcome.transcript.status());
    Ok(print_verdict(&outcome.report, &outcome.report_paths.html))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
