//! Deployment manifest types.
//!
//! The manifest is a compose-compatible YAML document. Only the keys that
//! matter for sequencing are modelled; anything else is ignored on load.
//! One-shot jobs are marked with the `x-lifecycle: one-shot` extension key,
//! which compose itself ignores.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ManifestError;

use super::interpolate::interpolate_value;

/// A complete deployment: services plus named volumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Project name, used to prefix containers, networks and volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services keyed by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    /// Named volumes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<VolumeSpec>>,
    /// Directory the manifest was loaded from, for resolving relative paths.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl Deployment {
    /// Parses a manifest, applying YAML merge keys and variable interpolation.
    pub fn from_yaml(content: &str, vars: &BTreeMap<String, String>) -> Result<Self, ManifestError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(content)?;
        value.apply_merge()?;
        interpolate_value(&mut value, vars)?;

        let deployment: Deployment = serde_yaml::from_value(value)?;
        if deployment.services.is_empty() {
            return Err(ManifestError::Empty);
        }
        Ok(deployment)
    }

    /// Loads a manifest from disk.
    pub fn load(path: &Path, vars: &BTreeMap<String, String>) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut deployment = Self::from_yaml(&content, vars)?;
        deployment.base_dir = path.parent().map(Path::to_path_buf);
        Ok(deployment)
    }

    /// Renders the manifest as YAML.
    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Returns the project name, defaulting to `flightdeck`.
    pub fn project(&self) -> &str {
        self.name.as_deref().unwrap_or("flightdeck")
    }

    /// Looks up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Names of all one-shot jobs.
    pub fn one_shot_jobs(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, spec)| spec.is_one_shot())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Named volume options. Empty in practice; kept so round-trips are lossless.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

/// A single service or one-shot job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Image to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Container name override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Entrypoint override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandSpec>,
    /// Command to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
    /// Environment variables.
    #[serde(
        default,
        deserialize_with = "deserialize_environment",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub environment: BTreeMap<String, String>,
    /// Env files, relative to the manifest directory.
    #[serde(
        default,
        deserialize_with = "deserialize_string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub env_file: Vec<String>,
    /// Volume mounts in short syntax (`source:target[:mode]`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// Port mappings in short syntax (`host:container`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Dependencies and the condition each must reach.
    #[serde(
        default,
        deserialize_with = "deserialize_depends_on",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub depends_on: BTreeMap<String, DependencySpec>,
    /// Liveness probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
    /// Restart policy.
    #[serde(default, skip_serializing_if = "RestartPolicy::is_no")]
    pub restart: RestartPolicy,
    /// Whether this is a long-running service or a one-shot job.
    #[serde(rename = "x-lifecycle", default, skip_serializing_if = "Lifecycle::is_service")]
    pub lifecycle: Lifecycle,
}

impl ServiceSpec {
    /// Returns true for one-shot jobs.
    pub fn is_one_shot(&self) -> bool {
        self.lifecycle == Lifecycle::OneShot
    }

    /// Returns the health check if one is defined and not disabled.
    pub fn probe(&self) -> Option<&HealthCheck> {
        self.healthcheck
            .as_ref()
            .filter(|hc| !hc.disable && hc.test != ProbeTest::None)
    }

    /// Full argv: entrypoint followed by command.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.entrypoint.as_ref().map(CommandSpec::argv).unwrap_or_default();
        if let Some(ref command) = self.command {
            argv.extend(command.argv());
        }
        argv
    }
}

/// Whether a service runs until stopped or runs once to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    #[default]
    Service,
    OneShot,
}

impl Lifecycle {
    fn is_service(&self) -> bool {
        *self == Lifecycle::Service
    }
}

/// A dependency edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Condition the dependency must reach before the dependent starts.
    #[serde(default)]
    pub condition: DependencyCondition,
}

impl DependencySpec {
    pub fn new(condition: DependencyCondition) -> Self {
        Self { condition }
    }
}

/// Condition attached to a dependency edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// The dependency has been started.
    #[default]
    ServiceStarted,
    /// The dependency's probe has succeeded.
    ServiceHealthy,
    /// The dependency ran to completion with exit code 0.
    ServiceCompletedSuccessfully,
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyCondition::ServiceStarted => write!(f, "service_started"),
            DependencyCondition::ServiceHealthy => write!(f, "service_healthy"),
            DependencyCondition::ServiceCompletedSuccessfully => {
                write!(f, "service_completed_successfully")
            }
        }
    }
}

/// A command in either string or list form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Shell-like string, split into words.
    Shell(String),
    /// Exec form.
    Exec(Vec<String>),
}

impl CommandSpec {
    /// Returns the command as argv.
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(s) => split_words(s),
            CommandSpec::Exec(args) => args.clone(),
        }
    }

    /// Returns the command as a single display string.
    pub fn display(&self) -> String {
        match self {
            CommandSpec::Shell(s) => s.clone(),
            CommandSpec::Exec(args) => args.join(" "),
        }
    }
}

/// Liveness probe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Probe command.
    pub test: ProbeTest,
    /// Delay between probes.
    #[serde(default = "default_interval", with = "duration_str")]
    pub interval: Duration,
    /// Time allowed for one probe.
    #[serde(default = "default_interval", with = "duration_str")]
    pub timeout: Duration,
    /// Consecutive failures before the service is unhealthy.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Grace period before probing begins.
    #[serde(default, with = "duration_str")]
    pub start_period: Duration,
    /// Disables the probe.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_retries() -> u32 {
    3
}

impl HealthCheck {
    /// Creates a probe with compose defaults.
    pub fn new(test: ProbeTest) -> Self {
        Self {
            test,
            interval: default_interval(),
            timeout: default_interval(),
            retries: default_retries(),
            start_period: Duration::ZERO,
            disable: false,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }

    /// Longest time a dependent can wait before the probe budget is spent.
    pub fn budget(&self) -> Duration {
        self.start_period + (self.interval + self.timeout) * self.retries
    }
}

/// Probe command in compose's `test` forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTest {
    /// `["NONE"]`: probe disabled.
    None,
    /// `["CMD", arg...]`: run argv directly.
    Exec(Vec<String>),
    /// `["CMD-SHELL", cmd]` or a bare string: run through the shell.
    Shell(String),
}

impl ProbeTest {
    /// Convenience constructor for exec-form probes.
    pub fn exec<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProbeTest::Exec(args.into_iter().map(Into::into).collect())
    }

    /// Convenience constructor for shell-form probes.
    pub fn shell(cmd: impl Into<String>) -> Self {
        ProbeTest::Shell(cmd.into())
    }

    /// Returns the probe as a single display string.
    pub fn display(&self) -> String {
        match self {
            ProbeTest::None => "NONE".to_string(),
            ProbeTest::Exec(args) => args.join(" "),
            ProbeTest::Shell(cmd) => cmd.clone(),
        }
    }

    /// Returns argv suitable for direct execution.
    pub fn argv(&self) -> Vec<String> {
        match self {
            ProbeTest::None => Vec::new(),
            ProbeTest::Exec(args) => args.clone(),
            ProbeTest::Shell(cmd) => vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()],
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ProbeTestRepr {
    Shell(String),
    List(Vec<String>),
}

impl Serialize for ProbeTest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            ProbeTest::None => ProbeTestRepr::List(vec!["NONE".to_string()]),
            ProbeTest::Exec(args) => {
                let mut list = vec!["CMD".to_string()];
                list.extend(args.iter().cloned());
                ProbeTestRepr::List(list)
            }
            ProbeTest::Shell(cmd) => ProbeTestRepr::List(vec!["CMD-SHELL".to_string(), cmd.clone()]),
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ProbeTest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        match ProbeTestRepr::deserialize(deserializer)? {
            ProbeTestRepr::Shell(cmd) => Ok(ProbeTest::Shell(cmd)),
            ProbeTestRepr::List(list) => {
                let (head, rest) = list
                    .split_first()
                    .ok_or_else(|| D::Error::custom("health check test cannot be empty"))?;
                match head.as_str() {
                    "NONE" => Ok(ProbeTest::None),
                    "CMD" if !rest.is_empty() => Ok(ProbeTest::Exec(rest.to_vec())),
                    "CMD-SHELL" if !rest.is_empty() => Ok(ProbeTest::Shell(rest.join(" "))),
                    other => Err(D::Error::custom(format!(
                        "health check test must start with NONE, CMD or CMD-SHELL, got '{}'",
                        other
                    ))),
                }
            }
        }
    }
}

/// Restart policy for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure {
        /// `None` retries until success.
        max_attempts: Option<u32>,
    },
    UnlessStopped,
}

impl RestartPolicy {
    fn is_no(&self) -> bool {
        *self == RestartPolicy::No
    }

    /// Parses compose syntax: `no`, `always`, `on-failure[:N]`, `unless-stopped`.
    pub fn parse(value: &str) -> Result<Self, ManifestError> {
        let value = value.trim();
        match value {
            "no" | "" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure { max_attempts: None }),
            _ => match value.strip_prefix("on-failure:") {
                Some(n) => n
                    .trim()
                    .parse()
                    .map(|n| RestartPolicy::OnFailure {
                        max_attempts: Some(n),
                    })
                    .map_err(|_| ManifestError::InvalidRestartPolicy(value.to_string())),
                None => Err(ManifestError::InvalidRestartPolicy(value.to_string())),
            },
        }
    }

    /// Whether a long-running service should be restarted after failing.
    pub fn restarts_on_failure(&self) -> bool {
        !matches!(self, RestartPolicy::No)
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure { max_attempts: None } => write!(f, "on-failure"),
            RestartPolicy::OnFailure {
                max_attempts: Some(n),
            } => write!(f, "on-failure:{}", n),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

impl Serialize for RestartPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RestartPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        // `restart: no` may arrive as a YAML boolean from older tooling.
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::Bool(false) | serde_yaml::Value::Null => Ok(RestartPolicy::No),
            serde_yaml::Value::String(s) => RestartPolicy::parse(&s).map_err(D::Error::custom),
            other => Err(D::Error::custom(format!("invalid restart policy: {:?}", other))),
        }
    }
}

fn scalar_to_string(value: serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn deserialize_environment<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Map(BTreeMap<String, serde_yaml::Value>),
        List(Vec<String>),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Map(map) => map
            .into_iter()
            .map(|(k, v)| (k, scalar_to_string(v)))
            .collect(),
        Repr::List(list) => list
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry, String::new()),
            })
            .collect(),
    })
}

fn deserialize_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::One(s) => vec![s],
        Repr::Many(v) => v,
    })
}

fn deserialize_depends_on<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, DependencySpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<String>),
        Map(BTreeMap<String, DependencySpec>),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::List(list) => list
            .into_iter()
            .map(|name| (name, DependencySpec::default()))
            .collect(),
        Repr::Map(map) => map,
    })
}

/// Splits a command string into words, honouring single and double quotes
/// and backslash escapes.
pub fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if in_word {
        words.push(current);
    }
    words
}

/// Parses compose duration syntax (`1h`, `1m30s`, `10s`, `500ms`, `250us`).
pub fn parse_duration(input: &str) -> Result<Duration, ManifestError> {
    let invalid = || ManifestError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if digits_end == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..digits_end].parse().map_err(|_| invalid())?;
        let after = &rest[digits_end..];
        let unit_end = after
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(after.len());
        let unit = &after[..unit_end];

        let seconds = match unit {
            "h" => number * 3600.0,
            "m" => number * 60.0,
            "s" => number,
            "ms" => number / 1_000.0,
            "us" | "µs" => number / 1_000_000.0,
            _ => return Err(invalid()),
        };
        total += Duration::from_secs_f64(seconds);
        rest = &after[unit_end..];
    }

    Ok(total)
}

/// Formats a duration in compose syntax.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }

    let mut secs = duration.as_secs();
    let mut out = String::new();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if secs > 0 {
        out.push_str(&format!("{}s", secs));
    }
    out
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        use serde::de::Error;

        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: demo
x-common: &common
  image: apache/airflow:2.8.1
  env_file: .env
  environment:
    AIRFLOW__CORE__LOAD_EXAMPLES: false
    AIRFLOW_UID: 50000
services:
  postgres:
    image: postgres:13
    healthcheck:
      test: ["CMD", "pg_isready", "-U", "airflow"]
      interval: 10s
      timeout: 5s
      retries: 5
      start_period: 5s
    restart: always
  init:
    <<: *common
    command: ["flightdeck", "init"]
    depends_on:
      postgres:
        condition: service_healthy
    restart: on-failure
    x-lifecycle: one-shot
  web:
    <<: *common
    command: webserver
    depends_on: [init]
volumes:
  pgdata:
"#;

    #[test]
    fn test_parse_manifest() {
        let deployment = Deployment::from_yaml(MANIFEST, &BTreeMap::new()).expect("should parse");

        assert_eq!(deployment.project(), "demo");
        assert_eq!(deployment.services.len(), 3);
        assert!(deployment.volumes.contains_key("pgdata"));

        let postgres = deployment.service("postgres").expect("postgres");
        let hc = postgres.probe().expect("probe");
        assert_eq!(hc.test, ProbeTest::exec(["pg_isready", "-U", "airflow"]));
        assert_eq!(hc.interval, Duration::from_secs(10));
        assert_eq!(hc.timeout, Duration::from_secs(5));
        assert_eq!(hc.retries, 5);
        assert_eq!(hc.start_period, Duration::from_secs(5));
        assert_eq!(postgres.restart, RestartPolicy::Always);
    }

    #[test]
    fn test_merge_keys_and_one_shot() {
        let deployment = Deployment::from_yaml(MANIFEST, &BTreeMap::new()).expect("should parse");
        let init = deployment.service("init").expect("init");

        assert!(init.is_one_shot());
        assert_eq!(init.image.as_deref(), Some("apache/airflow:2.8.1"));
        assert_eq!(init.env_file, vec![".env".to_string()]);
        assert_eq!(
            init.environment.get("AIRFLOW__CORE__LOAD_EXAMPLES").map(String::as_str),
            Some("false")
        );
        assert_eq!(init.environment.get("AIRFLOW_UID").map(String::as_str), Some("50000"));
        assert_eq!(init.restart, RestartPolicy::OnFailure { max_attempts: None });
        assert_eq!(
            init.depends_on.get("postgres").map(|d| d.condition),
            Some(DependencyCondition::ServiceHealthy)
        );
        assert_eq!(deployment.one_shot_jobs(), vec!["init"]);
    }

    #[test]
    fn test_depends_on_list_defaults_to_started() {
        let deployment = Deployment::from_yaml(MANIFEST, &BTreeMap::new()).expect("should parse");
        let web = deployment.service("web").expect("web");

        assert_eq!(
            web.depends_on.get("init").map(|d| d.condition),
            Some(DependencyCondition::ServiceStarted)
        );
        assert_eq!(web.argv(), vec!["webserver".to_string()]);
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let result = Deployment::from_yaml("services: {}\n", &BTreeMap::new());
        assert!(matches!(result, Err(ManifestError::Empty)));
    }

    #[test]
    fn test_render_and_reparse() {
        let deployment = Deployment::from_yaml(MANIFEST, &BTreeMap::new()).expect("should parse");
        let yaml = deployment.to_yaml().expect("render");
        let reparsed = Deployment::from_yaml(&yaml, &BTreeMap::new()).expect("reparse");

        assert_eq!(reparsed.services, deployment.services);
        assert!(yaml.contains("x-lifecycle: one-shot"));
        assert!(yaml.contains("service_healthy"));
    }

    #[test]
    fn test_probe_test_forms() {
        let shell: ProbeTest = serde_yaml::from_str(r#""curl -f localhost""#).expect("string");
        assert_eq!(shell, ProbeTest::shell("curl -f localhost"));

        let cmd_shell: ProbeTest =
            serde_yaml::from_str(r#"["CMD-SHELL", "pg_isready || exit 1"]"#).expect("cmd-shell");
        assert_eq!(cmd_shell, ProbeTest::shell("pg_isready || exit 1"));

        let none: ProbeTest = serde_yaml::from_str(r#"["NONE"]"#).expect("none");
        assert_eq!(none, ProbeTest::None);

        assert!(serde_yaml::from_str::<ProbeTest>(r#"["RUN", "x"]"#).is_err());
        assert!(serde_yaml::from_str::<ProbeTest>("[]").is_err());
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!(RestartPolicy::parse("no").unwrap(), RestartPolicy::No);
        assert_eq!(
            RestartPolicy::parse("on-failure:5").unwrap(),
            RestartPolicy::OnFailure {
                max_attempts: Some(5)
            }
        );
        assert_eq!(
            RestartPolicy::parse("unless-stopped").unwrap(),
            RestartPolicy::UnlessStopped
        );
        assert!(RestartPolicy::parse("sometimes").is_err());
        assert!(RestartPolicy::parse("on-failure:x").is_err());
        assert_eq!(RestartPolicy::OnFailure { max_attempts: Some(3) }.to_string(), "on-failure:3");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(3605)), "1h5s");
    }

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words(r#"airflow users create --firstname "Ada L" --role 'Admin'"#),
            vec!["airflow", "users", "create", "--firstname", "Ada L", "--role", "Admin"]
        );
        assert_eq!(split_words("  a\\ b  c "), vec!["a b", "c"]);
        assert_eq!(split_words(r#""""#), vec![""]);
        assert!(split_words("   ").is_empty());
    }

    #[test]
    fn test_probe_budget() {
        let hc = HealthCheck::new(ProbeTest::shell("true"))
            .with_interval(Duration::from_secs(10))
            .with_timeout(Duration::from_secs(5))
            .with_retries(5)
            .with_start_period(Duration::from_secs(5));
        assert_eq!(hc.budget(), Duration::from_secs(80));
    }
}
