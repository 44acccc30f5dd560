//! The `airflow` command line.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{AirflowError, CommandError};

use super::AdminUser;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and captures its output. A non-zero exit is
    /// reported in the output, not as an error.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        (**self).run(program, args).await
    }
}

/// Runs commands as local child processes with a timeout.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
        }
    }
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        debug!(program = %program, args = ?args, "Running command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::Timeout {
                program: program.to_string(),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Outcome of `ensure_user`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserProvision {
    Created,
    AlreadyExists,
}

#[derive(Debug, Deserialize)]
struct ListedUser {
    username: String,
}

/// Wrapper around the `airflow` executable.
pub struct AirflowCli<R: CommandRunner> {
    runner: R,
    program: String,
}

impl AirflowCli<ShellRunner> {
    /// Uses `airflow` from `PATH`.
    pub fn local() -> Self {
        Self::new(ShellRunner::default())
    }
}

impl<R: CommandRunner> AirflowCli<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            program: "airflow".to_string(),
        }
    }

    /// Builder method to use another executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String, CommandError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.runner.run(&self.program, &args).await?;
        if output.code != 0 {
            return Err(CommandError::NonZeroExit {
                program: format!("{} {}", self.program, args.first().cloned().unwrap_or_default()),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Returns the platform version.
    pub async fn version(&self) -> Result<String, AirflowError> {
        let stdout = self.run(&["version"]).await?;
        Ok(stdout.trim().to_string())
    }

    /// Applies pending metadata migrations.
    pub async fn db_migrate(&self) -> Result<(), AirflowError> {
        info!("Migrating metadata database");
        self.run(&["db", "migrate"]).await?;
        Ok(())
    }

    /// Returns true if a user with this name exists.
    pub async fn user_exists(&self, username: &str) -> Result<bool, AirflowError> {
        let stdout = self.run(&["users", "list", "--output", "json"]).await?;
        let users = parse_user_list(&stdout)?;
        Ok(users.iter().any(|u| u.username == username))
    }

    /// Creates a user. Fails if it already exists.
    pub async fn create_user(&self, user: &AdminUser) -> Result<(), AirflowError> {
        self.run(&[
            "users",
            "create",
            "--username",
            user.username.as_str(),
            "--password",
            user.password.as_str(),
            "--firstname",
            user.first_name.as_str(),
            "--lastname",
            user.last_name.as_str(),
            "--role",
            user.role.as_str(),
            "--email",
            user.email.as_str(),
        ])
        .await?;
        Ok(())
    }

    /// Creates the user unless it exists.
    ///
    /// A concurrent creation that wins the race is reported as
    /// `AlreadyExists`.
    pub async fn ensure_user(&self, user: &AdminUser) -> Result<UserProvision, AirflowError> {
        if self.user_exists(&user.username).await? {
            info!(username = %user.username, "User already exists");
            return Ok(UserProvision::AlreadyExists);
        }

        match self.create_user(user).await {
            Ok(()) => {
                info!(username = %user.username, role = %user.role, "User created");
                Ok(UserProvision::Created)
            }
            Err(AirflowError::Command(CommandError::NonZeroExit { ref stderr, .. }))
                if stderr.to_lowercase().contains("already exist") =>
            {
                info!(username = %user.username, "User created concurrently");
                Ok(UserProvision::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }
}

/// Finds the user list in `airflow users list` output.
///
/// Log lines such as `[2024-03-01T00:00:00.000+0000] {cli.py:42} WARNING - ...`
/// also open with `[`, so each bracket is tried until one starts a JSON array
/// of users. Output with no bracket at all means no users.
fn parse_user_list(stdout: &str) -> Result<Vec<ListedUser>, AirflowError> {
    let mut last_error = None;
    for (start, _) in stdout.match_indices('[') {
        let mut stream = serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<Vec<ListedUser>>();
        match stream.next() {
            Some(Ok(users)) => return Ok(users),
            Some(Err(e)) => last_error = Some(e),
            None => {}
        }
    }
    match last_error {
        Some(e) => Err(AirflowError::ParseError(format!("users list: {}", e))),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns scripted outputs in order and records every call.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        outputs: Mutex<VecDeque<CommandOutput>>,
        pub(crate) calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn subcommands(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|args| args.iter().take(2).cloned().collect::<Vec<_>>().join(" "))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| CommandOutput::success("")))
        }
    }

    fn admin() -> AdminUser {
        AdminUser::new("admin", "admin")
    }

    #[tokio::test]
    async fn test_ensure_user_twice() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            CommandOutput::success("[]"),
            CommandOutput::success("User \"admin\" created with role \"Admin\""),
            CommandOutput::success(r#"[{"id": "1", "username": "admin", "role": "Admin"}]"#),
        ]));
        let cli = AirflowCli::new(runner.clone());

        assert_eq!(cli.ensure_user(&admin()).await.unwrap(), UserProvision::Created);
        assert_eq!(cli.ensure_user(&admin()).await.unwrap(), UserProvision::AlreadyExists);
        assert_eq!(
            runner.subcommands(),
            vec!["users list", "users create", "users list"]
        );
    }

    #[tokio::test]
    async fn test_ensure_user_lost_race() {
        let cli = AirflowCli::new(ScriptedRunner::new(vec![
            CommandOutput::success("[]"),
            CommandOutput::failure(1, "admin already exist in the db"),
        ]));
        assert_eq!(cli.ensure_user(&admin()).await.unwrap(), UserProvision::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_user_failure_propagates() {
        let cli = AirflowCli::new(ScriptedRunner::new(vec![
            CommandOutput::success("[]"),
            CommandOutput::failure(1, "database is locked"),
        ]));
        let err = cli.ensure_user(&admin()).await.unwrap_err();
        assert!(matches!(
            err,
            AirflowError::Command(CommandError::NonZeroExit { code: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_user_list_with_leading_warnings() {
        let cli = AirflowCli::new(ScriptedRunner::new(vec![CommandOutput::success(
            "WARNING: something deprecated\n[{\"username\": \"ops\"}]\n",
        )]));
        assert!(cli.user_exists("ops").await.unwrap());
    }

    #[tokio::test]
    async fn test_user_list_after_timestamped_log_lines() {
        let stdout = "[2024-03-01T00:00:00.000+0000] {providers_manager.py:254} WARNING - x\n\
                      [2024-03-01T00:00:01.000+0000] {cli.py:42} INFO - listing users\n\
                      [\n  {\"id\": 1, \"username\": \"admin\"}\n]\n";
        let cli = AirflowCli::new(ScriptedRunner::new(vec![
            CommandOutput::success(stdout),
            CommandOutput::success(stdout),
        ]));
        assert!(cli.user_exists("admin").await.unwrap());
        assert!(!cli.user_exists("ops").await.unwrap());
    }

    #[tokio::test]
    async fn test_timestamped_log_before_missing_user_creates_it() {
        let cli = AirflowCli::new(ScriptedRunner::new(vec![
            CommandOutput::success("[2024-03-01T00:00:00.000+0000] {cli.py:42} WARNING - deprecated\n[]\n"),
            CommandOutput::success("User created\n"),
        ]));
        assert_eq!(cli.ensure_user(&admin()).await.unwrap(), UserProvision::Created);
    }

    #[test]
    fn test_user_list_without_json_is_a_parse_error() {
        assert!(parse_user_list("No data found\n").unwrap().is_empty());
        assert!(matches!(
            parse_user_list("[2024-03-01T00:00:00.000+0000] {cli.py:42} ERROR - boom\n"),
            Err(AirflowError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_version_trimmed() {
        let cli = AirflowCli::new(ScriptedRunner::new(vec![CommandOutput::success("2.8.1\n")]));
        assert_eq!(cli.version().await.unwrap(), "2.8.1");
    }

    #[tokio::test]
    async fn test_shell_runner_reports_exit_code() {
        let runner = ShellRunner::new(Duration::from_secs(5));
        let output = runner
            .run("sh", &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()])
            .await
            .unwrap();
        assert_eq!(output.code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let runner = ShellRunner::new(Duration::from_millis(50));
        let err = runner.run("sleep", &["5".to_string()]).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }
}
