//! Static checks for deployment manifests.
//!
//! `lint` reports problems that make startup ordering unreliable: probes that
//! can never fail, one-shot jobs restarted forever, fixed sleeps used as
//! synchronisation, and broken dependency graphs.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use crate::probe::has_forced_success;
use crate::sequencer::graph::layer;

use super::model::{DependencyCondition, Deployment, RestartPolicy};

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Kind of problem found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    ForcedSuccessProbe,
    AlwaysRestartOnJob,
    FixedDelay,
    UnknownDependency,
    HealthConditionWithoutProbe,
    DependencyCycle,
}

/// A single lint finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub service: String,
    pub kind: FindingKind,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}] {}", self.severity, self.service, self.message)
    }
}

fn sleep_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(^|[;&|\s(])sleep\s+\d+").expect("sleep pattern is valid")
    })
}

/// Returns every finding for the deployment, errors first.
pub fn lint(deployment: &Deployment) -> Vec<Finding> {
    let mut findings = Vec::new();

    for (name, spec) in &deployment.services {
        if let Some(hc) = spec.probe() {
            if has_forced_success(&hc.test) {
                findings.push(Finding {
                    severity: Severity::Error,
                    service: name.clone(),
                    kind: FindingKind::ForcedSuccessProbe,
                    message: format!(
                        "health check '{}' always exits 0, so dependents start before the service is ready",
                        hc.test.display()
                    ),
                });
            }
        }

        if spec.is_one_shot() {
            if matches!(spec.restart, RestartPolicy::Always | RestartPolicy::UnlessStopped) {
                findings.push(Finding {
                    severity: Severity::Warning,
                    service: name.clone(),
                    kind: FindingKind::AlwaysRestartOnJob,
                    message: format!(
                        "one-shot job uses 'restart: {}', it will be treated as on-failure",
                        spec.restart
                    ),
                });
            }

            let command = spec.command.as_ref().map(|c| c.display()).unwrap_or_default();
            if sleep_pattern().is_match(&command) {
                findings.push(Finding {
                    severity: Severity::Warning,
                    service: name.clone(),
                    kind: FindingKind::FixedDelay,
                    message: "command waits with a fixed sleep instead of polling for readiness"
                        .to_string(),
                });
            }
        }

        for (dependency, edge) in &spec.depends_on {
            match deployment.services.get(dependency) {
                None => findings.push(Finding {
                    severity: Severity::Error,
                    service: name.clone(),
                    kind: FindingKind::UnknownDependency,
                    message: format!("depends on unknown service '{}'", dependency),
                }),
                Some(dep) => {
                    if edge.condition == DependencyCondition::ServiceHealthy && dep.probe().is_none()
                    {
                        findings.push(Finding {
                            severity: Severity::Error,
                            service: name.clone(),
                            kind: FindingKind::HealthConditionWithoutProbe,
                            message: format!(
                                "waits for '{}' to be healthy but it has no health check",
                                dependency
                            ),
                        });
                    }
                }
            }
        }
    }

    let edges: BTreeMap<String, BTreeSet<String>> = deployment
        .services
        .iter()
        .map(|(name, spec)| {
            let deps = spec
                .depends_on
                .keys()
                .filter(|d| deployment.services.contains_key(*d))
                .cloned()
                .collect();
            (name.clone(), deps)
        })
        .collect();

    if let Err(cycle) = layer(&edges) {
        findings.push(Finding {
            severity: Severity::Error,
            service: cycle.first().cloned().unwrap_or_default(),
            kind: FindingKind::DependencyCycle,
            message: format!("dependency cycle between: {}", cycle.join(", ")),
        });
    }

    findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.service.cmp(&b.service)));
    findings
}

/// Returns true when any finding is an error.
pub fn has_errors(findings: &[Finding]) -> bool {
    findings.iter().any(|f| f.severity == Severity::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::reference_deployment;
    use crate::config::DeploymentConfig;

    const DEFECTIVE: &str = r#"
services:
  postgres:
    image: postgres:13
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U airflow || exit 0"]
  cache:
    image: redis
  init:
    image: apache/airflow:2.8.1
    command: bash -c "sleep 15 && airflow dags unpause health_check_dag"
    restart: always
    x-lifecycle: one-shot
    depends_on:
      postgres:
        condition: service_healthy
      cache:
        condition: service_healthy
      ghost:
        condition: service_started
"#;

    fn kinds(findings: &[Finding]) -> Vec<FindingKind> {
        findings.iter().map(|f| f.kind).collect()
    }

    #[test]
    fn test_lint_flags_defects() {
        let deployment = Deployment::from_yaml(DEFECTIVE, &BTreeMap::new()).unwrap();
        let findings = lint(&deployment);
        let kinds = kinds(&findings);

        assert!(kinds.contains(&FindingKind::ForcedSuccessProbe));
        assert!(kinds.contains(&FindingKind::AlwaysRestartOnJob));
        assert!(kinds.contains(&FindingKind::FixedDelay));
        assert!(kinds.contains(&FindingKind::UnknownDependency));
        assert!(kinds.contains(&FindingKind::HealthConditionWithoutProbe));
        assert!(has_errors(&findings));
        assert_eq!(findings[0].severity, Severity::Error);
    }

    #[test]
    fn test_lint_detects_cycle() {
        let yaml = r#"
services:
  a:
    image: x
    depends_on: [b]
  b:
    image: x
    depends_on: [a]
  c:
    image: x
"#;
        let deployment = Deployment::from_yaml(yaml, &BTreeMap::new()).unwrap();
        let findings = lint(&deployment);
        assert_eq!(kinds(&findings), vec![FindingKind::DependencyCycle]);
        assert!(findings[0].message.contains("a, b"));
    }

    #[test]
    fn test_reference_deployment_is_clean() {
        let config = DeploymentConfig::from_lookup(|key| match key {
            "POSTGRES_USER" | "POSTGRES_PASSWORD" | "POSTGRES_DB" => Some("airflow".to_string()),
            "_AIRFLOW_DB_UPGRADE" | "_AIRFLOW_WWW_USER_CREATE" => Some("false".to_string()),
            _ => None,
        })
        .unwrap();
        let findings = lint(&reference_deployment(&config));
        assert!(findings.is_empty(), "unexpected findings: {:?}", findings);
    }

    #[test]
    fn test_sleep_pattern() {
        assert!(sleep_pattern().is_match("sleep 15"));
        assert!(sleep_pattern().is_match("bash -c 'x; sleep 5'"));
        assert!(!sleep_pattern().is_match("airflow sleepy 5"));
        assert!(!sleep_pattern().is_match("sleep $DELAY"));
    }
}
