//! Integration tests for manifest linting and forced-success probes.

use flightdeck::compose::{has_errors, lint, reference_deployment, Deployment, FindingKind};
use flightdeck::config::DeploymentConfig;
use flightdeck::probe::{has_forced_success, strip_forced_success, LocalProbeExecutor, ProbeExecutor};
use std::collections::BTreeMap;
use std::time::Duration;

const LEGACY: &str = r#"
services:
  postgres:
    image: postgres:13
    environment:
      POSTGRES_USER: ${POSTGRES_USER:-airflow}
    healthcheck:
      test: ["CMD-SHELL", "test -e /nonexistent/postgres.sock || exit 0"]
      interval: 5s
      retries: 5
  airflow-init:
    image: apache/airflow:2.8.1
    x-lifecycle: one-shot
    restart: always
    command: ["bash", "-c", "sleep 10 && airflow db migrate"]
    depends_on:
      postgres:
        condition: service_healthy
"#;

#[tokio::test]
async fn test_forced_success_probe_lies_until_stripped() {
    let deployment = Deployment::from_yaml(LEGACY, &BTreeMap::new()).unwrap();
    let probe = deployment.service("postgres").unwrap().probe().unwrap().clone();
    assert!(has_forced_success(&probe.test));

    let executor = LocalProbeExecutor::new();
    let forced = executor
        .execute("postgres", &probe.test, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(forced.is_success(), "forced probe should report success");

    let stripped = strip_forced_success(&probe.test);
    assert!(!has_forced_success(&stripped));
    let real = executor
        .execute("postgres", &stripped, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!real.is_success(), "stripped probe should report the real status");
}

#[test]
fn test_lint_reports_legacy_defects() {
    let deployment = Deployment::from_yaml(LEGACY, &BTreeMap::new()).unwrap();
    let findings = lint(&deployment);
    let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();

    assert!(has_errors(&findings));
    assert!(kinds.contains(&FindingKind::ForcedSuccessProbe));
    assert!(kinds.contains(&FindingKind::AlwaysRestartOnJob));
    assert!(kinds.contains(&FindingKind::FixedDelay));
}

#[test]
fn test_reference_deployment_renders_and_reloads() {
    let config = DeploymentConfig::default();
    let deployment = reference_deployment(&config);
    assert!(lint(&deployment).is_empty(), "{:?}", lint(&deployment));

    let yaml = deployment.to_yaml().unwrap();
    let mut vars = BTreeMap::new();
    vars.insert("POSTGRES_USER".to_string(), "airflow".to_string());
    let reloaded = Deployment::from_yaml(&yaml, &vars).unwrap();

    let names: Vec<&String> = reloaded.services.keys().collect();
    let expected: Vec<&String> = deployment.services.keys().collect();
    assert_eq!(names, expected);
    for (name, spec) in &deployment.services {
        assert_eq!(reloaded.services[name].depends_on, spec.depends_on, "{}", name);
        assert_eq!(reloaded.services[name].lifecycle, spec.lifecycle, "{}", name);
    }

    let probe = reloaded.service("postgres").unwrap().probe().unwrap();
    assert_eq!(probe.test.argv(), vec!["pg_isready", "-U", "airflow"]);
    assert!(lint(&reloaded).is_empty());
}
