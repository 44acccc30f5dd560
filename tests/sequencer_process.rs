//! Integration tests for the sequencer driving real local processes.
//!
//! Services are `sh` commands that coordinate through marker files in a
//! temporary directory.

use flightdeck::compose::Deployment;
use flightdeck::runtime::ProcessRuntime;
use flightdeck::sequencer::{
    EventKind, SequenceEvent, Sequencer, SequencerConfig, ServiceFailure, ServiceState,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> SequencerConfig {
    SequencerConfig::default()
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .with_stop_timeout(Duration::from_secs(2))
}

fn deployment_in(dir: &Path, manifest: &str) -> Deployment {
    let mut vars = BTreeMap::new();
    vars.insert("DIR".to_string(), dir.display().to_string());
    Deployment::from_yaml(manifest, &vars).expect("manifest should parse")
}

fn first_transition(events: &[SequenceEvent], service: &str, state: ServiceState) -> Option<u64> {
    events
        .iter()
        .find(|e| {
            e.service == service && matches!(e.kind, EventKind::StateChanged { to, .. } if to == state)
        })
        .map(|e| e.seq)
}

const CHAIN: &str = r#"
name: itest
services:
  store:
    command: ["sh", "-c", "sleep 0.3 && touch ${DIR}/store.ready && exec sleep 30"]
    healthcheck:
      test: ["CMD-SHELL", "test -f ${DIR}/store.ready"]
      interval: 100ms
      timeout: 2s
      retries: 30
  init:
    x-lifecycle: one-shot
    restart: on-failure
    command: ["sh", "-c", "test -f ${DIR}/store.ready && echo done >> ${DIR}/init.log"]
    depends_on:
      store:
        condition: service_healthy
  web:
    command: ["sh", "-c", "touch ${DIR}/web.started && exec sleep 30"]
    depends_on:
      init:
        condition: service_completed_successfully
"#;

#[tokio::test]
async fn test_chain_starts_after_probe_passes() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = deployment_in(dir.path(), CHAIN);
    let runtime = Arc::new(ProcessRuntime::new().with_base_dir(dir.path()));
    let sequencer = Sequencer::new(deployment, runtime, test_config()).unwrap();

    let report = sequencer.run().await.unwrap();
    assert!(report.succeeded(), "{}", report.summary());

    let healthy = first_transition(&report.events, "store", ServiceState::Healthy).unwrap();
    let init_running = first_transition(&report.events, "init", ServiceState::Running).unwrap();
    let init_done = first_transition(&report.events, "init", ServiceState::Completed).unwrap();
    let web_running = first_transition(&report.events, "web", ServiceState::Running).unwrap();
    assert!(healthy < init_running);
    assert!(init_done < web_running);

    // The job ran exactly once because its first attempt succeeded.
    let log = std::fs::read_to_string(dir.path().join("init.log")).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert_eq!(report.outcome("init").unwrap().attempts, 1);
    assert!(dir.path().join("web.started").exists());

    sequencer.shutdown().await.unwrap();
}

const FAILING_JOB: &str = r#"
name: itest
services:
  init:
    x-lifecycle: one-shot
    restart: on-failure:2
    command: ["sh", "-c", "echo attempt >> ${DIR}/attempts.log; exit 3"]
  web:
    command: ["sh", "-c", "touch ${DIR}/web.started && exec sleep 30"]
    depends_on:
      init:
        condition: service_completed_successfully
"#;

#[tokio::test]
async fn test_failing_job_is_retried_and_blocks_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = deployment_in(dir.path(), FAILING_JOB);
    let runtime = Arc::new(ProcessRuntime::new().with_base_dir(dir.path()));
    let sequencer = Sequencer::new(deployment, runtime, test_config()).unwrap();

    let report = sequencer.run().await.unwrap();
    assert!(!report.succeeded());

    let init = report.outcome("init").unwrap();
    assert_eq!(init.state, ServiceState::Failed);
    assert_eq!(init.attempts, 3);
    assert_eq!(init.exit_code, Some(3));

    let attempts = std::fs::read_to_string(dir.path().join("attempts.log")).unwrap();
    assert_eq!(attempts.lines().count(), 3);

    let web = report.outcome("web").unwrap();
    assert_eq!(web.state, ServiceState::Failed);
    assert!(matches!(
        web.failure,
        Some(ServiceFailure::DependencyFailed { ref dependency, .. }) if dependency == "init"
    ));
    assert!(!dir.path().join("web.started").exists());

    sequencer.shutdown().await.unwrap();
}

const NEVER_HEALTHY: &str = r#"
name: itest
services:
  store:
    command: ["sh", "-c", "exec sleep 30"]
    healthcheck:
      test: ["CMD-SHELL", "test -f ${DIR}/never"]
      interval: 50ms
      timeout: 1s
      retries: 3
  web:
    command: ["sh", "-c", "touch ${DIR}/web.started && exec sleep 30"]
    depends_on:
      store:
        condition: service_healthy
"#;

#[tokio::test]
async fn test_unhealthy_store_keeps_dependents_down() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = deployment_in(dir.path(), NEVER_HEALTHY);
    let runtime = Arc::new(ProcessRuntime::new().with_base_dir(dir.path()));
    let sequencer = Sequencer::new(deployment, runtime, test_config()).unwrap();

    let report = sequencer.run().await.unwrap();

    assert_eq!(report.outcome("store").unwrap().state, ServiceState::Unhealthy);
    assert_eq!(report.outcome("web").unwrap().state, ServiceState::Failed);
    assert!(first_transition(&report.events, "web", ServiceState::Running).is_none());
    assert!(!dir.path().join("web.started").exists());

    sequencer.shutdown().await.unwrap();
}
