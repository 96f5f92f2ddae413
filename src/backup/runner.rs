use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

use crate::errors::Result;
use crate::models::Credential;
use crate::utils::find_pg_executable;
use crate::utils::identifier::{validate_artifact_path, validate_database_name};

/// Result of one engine command. Runners never fail past this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Backs up or restores a single database.
#[async_trait]
pub trait BackupRunner: Send + Sync {
    async fn backup(&self, database: &str, destination: &Path, credential: &Credential) -> Outcome;

    async fn restore(&self, database: &str, source: &Path, credential: &Credential) -> Outcome;
}

/// Runs `pg_dump` / `pg_restore` as child processes.
#[derive(Debug, Clone)]
pub struct PgToolsRunner {
    engine_url: Url,
    pg_dump: PathBuf,
    pg_restore: PathBuf,
    timeout: Duration,
}

impl PgToolsRunner {
    /// Locates the client tools on PATH.
    pub fn locate(engine_url: Url, timeout: Duration) -> Result<Self> {
        let pg_dump = find_pg_executable("pg_dump")?;
        let pg_restore = find_pg_executable("pg_restore")?;
        debug!(pg_dump = %pg_dump.display(), pg_restore = %pg_restore.display(), "Found PostgreSQL client tools");
        Ok(Self::with_executables(engine_url, pg_dump, pg_restore, timeout))
    }

    pub fn with_executables(
        engine_url: Url,
        pg_dump: PathBuf,
        pg_restore: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            engine_url,
            pg_dump,
            pg_restore,
            timeout,
        }
    }

    /// Connection URL for `database` as `credential`. The password is never embedded.
    fn database_url(&self, database: &str, credential: &Credential) -> std::result::Result<Url, String> {
        let mut url = self.engine_url.clone();
        url.set_username(&credential.username)
            .map_err(|_| format!("engine URL {} cannot carry a username", self.engine_url))?;
        url.set_password(None)
            .map_err(|_| format!("engine URL {} cannot carry a password", self.engine_url))?;
        url.set_path(database);
        Ok(url)
    }

    async fn execute(
        &self,
        program: &Path,
        args: Vec<OsString>,
        credential: &Credential,
        label: &str,
    ) -> Outcome {
        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &credential.password {
            Some(password) => {
                command.env("PGPASSWORD", password);
            }
            None => {
                command.env_remove("PGPASSWORD");
            }
        }

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                warn!(label, timeout_secs = self.timeout.as_secs_f64(), "Engine command timed out");
                return Outcome::failure(format!(
                    "{} timed out after {:.1}s",
                    label,
                    self.timeout.as_secs_f64()
                ));
            }
            Ok(Err(e)) => {
                return Outcome::failure(format!(
                    "failed to launch {} for {}: {}",
                    program.display(),
                    label,
                    e
                ));
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Outcome::Success;
        }
        Outcome::failure(describe_exit(label, output.status, output.stderr))
    }
}

fn describe_exit(label: &str, status: ExitStatus, stderr: Vec<u8>) -> String {
    match String::from_utf8(stderr) {
        Ok(text) => {
            let tail: Vec<&str> = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            let start = tail.len().saturating_sub(3);
            if tail.is_empty() {
                format!("{} exited with {}", label, status)
            } else {
                format!("{} exited with {}: {}", label, status, tail[start..].join(" | "))
            }
        }
        Err(_) => format!("{} exited with {} (stderr was not valid UTF-8)", label, status),
    }
}

#[async_trait]
impl BackupRunner for PgToolsRunner {
    async fn backup(&self, database: &str, destination: &Path, credential: &Credential) -> Outcome {
        if let Err(e) = validate_database_name(database).and(validate_artifact_path(destination)) {
            return Outcome::failure(e.to_string());
        }
        let url = match self.database_url(database, credential) {
            Ok(url) => url,
            Err(reason) => return Outcome::failure(reason),
        };
        let label = format!("pg_dump of {}", database);
        debug!(database, destination = %destination.display(), "Running pg_dump");
        let args: Vec<OsString> = vec![
            "--format=custom".into(),
            "--no-owner".into(),
            "--file".into(),
            destination.as_os_str().to_owned(),
            "--dbname".into(),
            url.as_str().into(),
        ];
        self.execute(&self.pg_dump, args, credential, &label).await
    }

    async fn restore(&self, database: &str, source: &Path, credential: &Credential) -> Outcome {
        if let Err(e) = validate_database_name(database).and(validate_artifact_path(source)) {
            return Outcome::failure(e.to_string());
        }
        if !source.is_file() {
            return Outcome::failure(format!("backup file not found: {}", source.display()));
        }
        let url = match self.database_url(database, credential) {
            Ok(url) => url,
            Err(reason) => return Outcome::failure(reason),
        };
        let label = format!("pg_restore of {}", database);
        debug!(database, source = %source.display(), "Running pg_restore");
        let args: Vec<OsString> = vec![
            "--clean".into(),
            "--if-exists".into(),
            "--no-owner".into(),
            "--exit-on-error".into(),
            "--dbname".into(),
            url.as_str().into(),
            source.as_os_str().to_owned(),
        ];
        self.execute(&self.pg_restore, args, credential, &label).await
    }
}
