//! External command invocation

use crate::error::{ClusterError, Result};
use crate::log::log_node_operation;
use std::fmt;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Prefix that runs a command as another account, keeping the environment
pub fn run_as_prefix(user: &str) -> Vec<String> {
    vec![
        "sudo".to_string(),
        "-u".to_string(),
        user.to_string(),
        "-EH".to_string(),
        "--".to_string(),
    ]
}

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    argv: Vec<String>,
    stdin_null: bool,
}

impl CommandLine {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![program.to_string()];
        argv.extend(args.into_iter().map(Into::into));
        Self {
            argv,
            stdin_null: false,
        }
    }

    /// Run through `sudo` as `user`
    pub fn as_user(mut self, user: &str) -> Self {
        let mut argv = run_as_prefix(user);
        argv.append(&mut self.argv);
        self.argv = argv;
        self
    }

    /// Close standard input
    pub fn stdin_null(mut self) -> Self {
        self.stdin_null = true;
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Run to completion and return the exit code (`None` if killed by a signal)
    pub async fn status(&self, node: &str) -> Result<Option<i32>> {
        let (program, args) = match self.argv.split_first() {
            Some(split) => split,
            None => return Err(ClusterError::configuration("empty command line")),
        };

        tracing::info!("Running {}", self);
        let started = Instant::now();
        let mut command = Command::new(program);
        command.args(args);
        if self.stdin_null {
            command.stdin(Stdio::null());
        }

        let status = command.status().await?;
        log_node_operation(
            &self.to_string(),
            node,
            status.success(),
            started.elapsed(),
            status.code().map(|code| vec![("exit_code", code.to_string())]),
        );
        Ok(status.code())
    }

    /// Run to completion; any unsuccessful exit becomes `ClusterError::Command`
    pub async fn run(&self, node: &str, retryable: bool) -> Result<()> {
        match self.status(node).await? {
            Some(0) => Ok(()),
            code => Err(ClusterError::Command {
                command: self.to_string(),
                code,
                retryable,
            }),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_as_user() {
        let cmd = CommandLine::new("repmgr", ["-f", "/srv/pgconf/repmgr.conf", "cluster", "show"])
            .as_user("postgres");
        assert_eq!(
            cmd.to_string(),
            "sudo -u postgres -EH -- repmgr -f /srv/pgconf/repmgr.conf cluster show"
        );
    }

    #[tokio::test]
    async fn test_exit_codes() {
        assert_eq!(CommandLine::new("true", Vec::<String>::new()).status("n").await.unwrap(), Some(0));
        assert_eq!(CommandLine::new("sh", ["-c", "exit 24"]).status("n").await.unwrap(), Some(24));
    }

    #[tokio::test]
    async fn test_failed_command_carries_retryability() {
        let err = CommandLine::new("false", Vec::<String>::new())
            .run("n", true)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("exit code 1"));
    }
}
