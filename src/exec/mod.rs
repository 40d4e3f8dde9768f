//! Running filesystem, mount and iSCSI commands on the host

#[cfg(test)]
pub mod mock;

use std::fmt::Debug;

use async_trait::async_trait;
use tracing::debug;

use crate::common::error::{Context, DateraError, DateraResult};

/// Replacement for secret values in logs
pub const STRIPPED: &str = "***stripped***";
/// Prefix of the iSCSI settings holding CHAP credentials
const CHAP_SETTING_PREFIX: &str = "node.session.auth.";

/// Runs a command and returns its combined output.
/// A non-zero exit is `DateraError::CommandErr` carrying the output.
#[async_trait]
pub trait Executor: Debug + Send + Sync {
    /// Run an already normalized argv
    async fn run(&self, argv: &[String]) -> DateraResult<String>;

    /// Normalize and run an argv, blank arguments are dropped
    async fn exec(&self, argv: &[&str]) -> DateraResult<String> {
        let args = normalize(argv);
        if args.is_empty() {
            return Err(DateraError::ArgumentInvalid {
                context: vec!["empty command".to_owned()],
            });
        }
        self.run(&args).await
    }
}

/// Trim every argument and drop the empty ones
#[must_use]
pub fn normalize(argv: &[&str]) -> Vec<String> {
    argv.iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Render an argv for logs with CHAP values replaced
#[must_use]
pub fn redact(argv: &[String]) -> String {
    let mut shown = Vec::with_capacity(argv.len());
    let mut secret_setting = false;
    let mut prev_is_value_flag = false;
    for arg in argv {
        if prev_is_value_flag && secret_setting {
            shown.push(STRIPPED);
            secret_setting = false;
        } else {
            shown.push(arg.as_str());
        }
        if arg.starts_with(CHAP_SETTING_PREFIX) {
            secret_setting = true;
        }
        prev_is_value_flag = arg == "-v";
    }
    shown.join(" ")
}

/// Runs commands on this host
#[derive(Debug, Default)]
pub struct HostExecutor;

#[async_trait]
impl Executor for HostExecutor {
    async fn run(&self, argv: &[String]) -> DateraResult<String> {
        let shown = redact(argv);
        let (program, args) = argv.split_first().ok_or_else(|| DateraError::ArgumentInvalid {
            context: vec!["empty command".to_owned()],
        })?;
        debug!("running command: {}", shown);
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn {shown}"))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!("command {} output: {}", shown, combined);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(DateraError::CommandErr {
                command: shown,
                output: combined,
                context: vec![format!("exit status {}", output.status)],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(&["mkfs.ext4", " ", "-F ", "", "/dev/sdb"]),
            vec!["mkfs.ext4", "-F", "/dev/sdb"]
        );
    }

    #[test]
    fn test_redact() {
        let argv = normalize(&[
            "iscsiadm", "-m", "node", "-o", "update", "-n",
            "node.session.auth.password", "-v", "hunter2",
        ]);
        let shown = redact(&argv);
        assert!(!shown.contains("hunter2"));
        assert!(shown.ends_with("-v ***stripped***"));

        let argv = normalize(&["iscsiadm", "-n", "node.startup", "-v", "automatic"]);
        assert!(redact(&argv).ends_with("automatic"));
    }

    #[tokio::test]
    async fn test_host_executor() {
        let exec = HostExecutor;
        let out = exec.exec(&["echo", "hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");

        let err = exec.exec(&["sh", "-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            DateraError::CommandErr { output, .. } => assert_eq!(output.trim(), "boom"),
            _ => panic!("unexpected error {err:?}"),
        }
        assert!(exec.exec(&[" "]).await.is_err());
    }
}
