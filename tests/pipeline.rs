//! End-to-end runs against the in-memory hypervisor.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use build_inspector::build::{BuildStatus, BuildTarget, CommandStatus};
use build_inspector::capture::Completeness;
use build_inspector::config::{CommandSpec, InspectorConfig};
use build_inspector::error::{CollectionError, InspectorError};
use build_inspector::evidence::BundleManifest;
use build_inspector::inspector::{process_only, BuildInspector, RunOptions, RunOutcome};
use build_inspector::policy::WhitelistPolicy;
use build_inspector::processor::{Classification, NetworkEvidenceProcessor, Verdict};
use build_inspector::sandbox::FakeHypervisor;
use build_inspector::utils::Verbosity;

fn config(commands: &[&str]) -> InspectorConfig {
    InspectorConfig {
        commands: commands.iter().map(|c| CommandSpec::from(*c)).collect(),
        host_whitelist: vec!["registry.example.com".to_string()],
        ..Default::default()
    }
}

fn options(output_dir: &Path) -> RunOptions {
    RunOptions {
        target: BuildTarget::Package {
            name: "left-pad".to_string(),
        },
        package: None,
        package_manager: "npm".to_string(),
        rollback: false,
        keep_vm: false,
        output_dir: output_dir.to_path_buf(),
        config_path: None,
    }
}

fn inspector(config: InspectorConfig, fake: &FakeHypervisor) -> BuildInspector {
    BuildInspector::new(config, Arc::new(fake.clone()), Verbosity::quiet())
        .unwrap()
        .with_drain_timeout(Duration::from_secs(2))
}

async fn run(config: InspectorConfig, fake: &FakeHypervisor, options: &RunOptions) -> RunOutcome {
    inspector(config, fake)
        .collect_and_analyze(options, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_whitelisted_and_unauthorized_hosts() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();

    let outcome = run(
        config(&["fetch registry.example.com", "fetch evil.example 443 900"]),
        &fake,
        &options(out.path()),
    )
    .await;

    let report = &outcome.report;
    // Each fetch is a lookup, a SYN and a data segment.
    assert_eq!(report.counts.whitelisted, 3);
    assert_eq!(report.counts.unauthorized, 3);
    assert_eq!(report.counts.unresolvable, 0);
    assert_eq!(report.verdict(), Verdict::UnauthorizedAccess);
    assert!(report.completeness.is_complete());
    assert!(report.unauthorized().all(|f| f.event.host == "evil.example"));

    let evil = report
        .hosts
        .iter()
        .find(|h| h.host == "evil.example")
        .unwrap();
    assert_eq!(evil.classification, Classification::Unauthorized);
    assert!(evil.bytes >= 900);

    assert!(outcome.bundle.archive.is_file());
    assert!(outcome.report_paths.html.is_file());
    assert!(outcome.report_paths.json.is_file());
    assert_eq!(outcome.transcript.status(), BuildStatus::Succeeded);
    assert_eq!(fake.calls_matching("shutdown"), 1);
    assert!(!fake.capture_live());
}

#[tokio::test]
async fn test_no_build_command_runs_outside_the_capture() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();

    run(config(&["echo hi"]), &fake, &options(out.path())).await;

    let calls = fake.calls();
    let capture = calls.iter().position(|c| c.starts_with("capture ")).unwrap();
    let first_exec = calls.iter().position(|c| c.starts_with("exec ")).unwrap();
    let snapshot = calls.iter().position(|c| c.starts_with("snapshot ")).unwrap();
    assert!(snapshot < capture);
    assert!(capture < first_exec);
}

#[tokio::test]
async fn test_failed_step_skips_the_rest_but_still_reports() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();

    let outcome = run(
        config(&["fetch registry.example.com", "exit 2", "fetch evil.example"]),
        &fake,
        &options(out.path()),
    )
    .await;

    let statuses: Vec<&CommandStatus> = outcome.transcript.commands.iter().map(|c| &c.status).collect();
    assert_eq!(
        statuses,
        vec![
            &CommandStatus::Succeeded,
            &CommandStatus::Failed { exit_code: Some(2) },
            &CommandStatus::Skipped,
        ]
    );
    assert!(matches!(
        outcome.transcript.status(),
        BuildStatus::Failed { step: 2, .. }
    ));
    assert_eq!(fake.calls_matching("exec cd"), 2);

    // A broken build says nothing about the network.
    assert_eq!(outcome.report.verdict(), Verdict::Clean);
    assert!(outcome.report.build.is_some());

    let manifest = BundleManifest::load(&outcome.bundle.root).unwrap();
    assert_eq!(manifest.steps.len(), 4);
    for step in &manifest.steps {
        assert!(outcome.bundle.root.join(&step.transcript).is_file());
    }
}

#[tokio::test]
async fn test_failed_flush_is_inconclusive() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new().failing_capture_flush();

    let outcome = run(config(&["fetch registry.example.com"]), &fake, &options(out.path())).await;

    assert!(matches!(
        outcome.report.completeness,
        Completeness::Incomplete { .. }
    ));
    assert_eq!(outcome.report.verdict(), Verdict::Inconclusive);
    assert!(!outcome.bundle.manifest.warnings.is_empty());

    let html = std::fs::read_to_string(&outcome.report_paths.html).unwrap();
    assert!(html.contains("Capture incomplete"));
}

#[tokio::test]
async fn test_capture_that_never_starts_still_runs_the_build() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new().failing_capture_start();

    let outcome = run(config(&["fetch evil.example"]), &fake, &options(out.path())).await;

    assert_eq!(outcome.transcript.status(), BuildStatus::Succeeded);
    assert!(!outcome.report.completeness.is_complete());
    assert_eq!(outcome.report.counts.total(), 0);
    assert_eq!(outcome.report.verdict(), Verdict::Inconclusive);
}

#[tokio::test]
async fn test_capture_dying_mid_run_is_incomplete() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();

    let outcome = run(
        config(&["crash-capture", "sleep 100", "fetch evil.example"]),
        &fake,
        &options(out.path()),
    )
    .await;

    assert!(!outcome.report.completeness.is_complete());
    assert_eq!(outcome.report.counts.unauthorized, 0);
    assert_eq!(outcome.report.verdict(), Verdict::Inconclusive);
}

#[tokio::test]
async fn test_unparsed_and_stale_traffic_is_never_dropped() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();

    let outcome = run(
        config(&[
            "garbage ??? not a packet",
            "stale old.example",
            "resolve-fail nowhere.invalid",
        ]),
        &fake,
        &options(out.path()),
    )
    .await;

    let report = &outcome.report;
    assert!(report.out_of_window > 0);
    assert!(report.counts.unresolvable >= 2);
    assert!(report
        .findings
        .iter()
        .any(|f| f.event.host == "nowhere.invalid" && f.classification == Classification::Unresolvable));
    assert_eq!(report.verdict(), Verdict::Inconclusive);
}

#[tokio::test]
async fn test_cancellation_collects_partial_evidence() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let outcome = inspector(
        config(&["fetch registry.example.com", "sleep 10000", "fetch evil.example"]),
        &fake,
    )
    .collect_and_analyze(&options(out.path()), &cancel)
    .await
    .unwrap();

    assert!(outcome.transcript.interrupted());
    assert_eq!(outcome.transcript.status(), BuildStatus::Interrupted);
    assert!(!outcome.report.completeness.is_complete());
    assert_eq!(outcome.report.counts.whitelisted, 3);
    assert_eq!(outcome.report.counts.unauthorized, 0);
    assert!(outcome.bundle.archive.is_file());
}

#[tokio::test]
async fn test_failed_provision_creates_no_bundle() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new().failing_provision();

    let result = inspector(config(&["make"]), &fake)
        .collect_and_analyze(&options(out.path()), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(InspectorError::Provision(_))));
    assert_eq!(fake.calls_matching("exec"), 0);
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_rollback_removes_persisted_changes() {
    let fake = FakeHypervisor::new();

    let first = tempfile::tempdir().unwrap();
    let mut opts = options(first.path());
    opts.rollback = true;
    run(config(&["install-beacon evil.example"]), &fake, &opts).await;
    assert_eq!(fake.calls_matching("rollback"), 1);
    assert!(fake.disk_paths().is_empty());

    let second = tempfile::tempdir().unwrap();
    let outcome = run(config(&["echo clean"]), &fake, &options(second.path())).await;
    assert_eq!(outcome.report.counts.total(), 0);
    assert_eq!(outcome.report.verdict(), Verdict::Clean);
}

#[tokio::test]
async fn test_without_rollback_the_next_run_sees_the_beacon() {
    let fake = FakeHypervisor::new();

    let first = tempfile::tempdir().unwrap();
    run(config(&["install-beacon evil.example"]), &fake, &options(first.path())).await;
    assert_eq!(fake.calls_matching("rollback"), 0);

    let second = tempfile::tempdir().unwrap();
    let outcome = run(config(&["echo clean"]), &fake, &options(second.path())).await;
    assert!(outcome.report.counts.unauthorized > 0);
    assert_eq!(outcome.report.verdict(), Verdict::UnauthorizedAccess);
}

#[tokio::test]
async fn test_reprocessing_is_deterministic() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let cfg = config(&["fetch registry.example.com", "fetch evil.example"]);

    let outcome = run(cfg.clone(), &fake, &options(out.path())).await;

    let processor = NetworkEvidenceProcessor::new(WhitelistPolicy::from_config(&cfg).unwrap());
    let strict = processor.process(&outcome.bundle.root).unwrap();
    let lenient = processor.process_evidence(&outcome.bundle.root).unwrap();
    assert_eq!(strict, lenient);
    assert_eq!(strict, outcome.report);
    assert_eq!(processor.process(&outcome.bundle.root).unwrap(), strict);

    // A wider policy reclassifies the same evidence.
    let wider = InspectorConfig {
        host_whitelist: vec!["registry.example.com".to_string(), "evil.example".to_string()],
        ..cfg
    };
    let relaxed = NetworkEvidenceProcessor::new(WhitelistPolicy::from_config(&wider).unwrap())
        .process(&outcome.bundle.root)
        .unwrap();
    assert_ne!(relaxed.policy_version, strict.policy_version);
    assert_eq!(relaxed.verdict(), Verdict::Clean);
}

#[tokio::test]
async fn test_process_only_from_archive() {
    let out = tempfile::tempdir().unwrap();
    let fake = FakeHypervisor::new();
    let cfg = config(&["fetch evil.example"]);

    let outcome = run(cfg.clone(), &fake, &options(out.path())).await;

    let elsewhere = tempfile::tempdir().unwrap();
    let archive = elsewhere.path().join(format!("{}.zip", outcome.bundle.name));
    std::fs::copy(&outcome.bundle.archive, &archive).unwrap();

    let offline = process_only(&cfg, &archive, false, "npm", None).unwrap();
    assert_eq!(offline.bundle_root, elsewhere.path().join(&outcome.bundle.name));
    assert_eq!(offline.report.findings, outcome.report.findings);
    assert!(offline.report_paths.html.is_file());

    // The extraction directory now exists and is never overwritten.
    assert!(matches!(
        process_only(&cfg, &archive, false, "npm", None),
        Err(InspectorError::Collection(CollectionError::BundleExists(_)))
    ));
}

#[test]
fn test_process_only_rejects_traversal() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("evidence-npm-evil-20240101000000.zip");
    let mut zip = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
    zip.start_file("capture.jsonl", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(b"").unwrap();
    zip.start_file("../../outside.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(b"pwned").unwrap();
    zip.finish().unwrap();

    let result = process_only(&config(&["make"]), &archive, true, "npm", None);
    assert!(matches!(
        result,
        Err(InspectorError::Collection(CollectionError::UnsafeMember { .. }))
    ));
    assert!(!dir.path().join("evidence-npm-evil-20240101000000").exists());
}
