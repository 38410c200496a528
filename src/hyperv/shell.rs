//! PowerShell process runner with a per-call timeout

use crate::{Error, Result};
use std::time::Duration;
use tokio::process::Command;

/// Runs scripts in a fresh `powershell` process.
///
/// Scripts execute with `$ErrorActionPreference = 'Stop'`, so any failing
/// cmdlet ends the process with a non-zero exit code. A script still running
/// when its timeout expires is killed.
pub struct PowerShell {
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
}

impl PowerShell {
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime, timeout })
    }

    /// Run with the default timeout, returning stdout
    pub fn run(&self, script: &str) -> Result<String> {
        self.run_with_timeout(script, self.timeout)
    }

    pub fn run_with_timeout(&self, script: &str, timeout: Duration) -> Result<String> {
        let operation = describe(script);
        tracing::debug!(%operation, ?timeout, "Running PowerShell");

        let script = format!("$ErrorActionPreference = 'Stop'\n{}", script);
        let output = self.runtime.block_on(async {
            let child = Command::new("powershell")
                .args([
                    "-NoProfile",
                    "-NonInteractive",
                    "-ExecutionPolicy",
                    "Bypass",
                    "-Command",
                    &script,
                ])
                .kill_on_drop(true)
                .output();
            tokio::time::timeout(timeout, child).await
        });

        let output = match output {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation,
                    after: timeout,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(Error::PowerShell(format!(
                "{} (exit code {:?})\nStderr: {}\nStdout: {}",
                operation,
                output.status.code(),
                stderr.trim(),
                stdout.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Escape a value for use inside a single-quoted PowerShell string
pub(crate) fn escape_ps(s: &str) -> String {
    s.replace('\'', "''")
}

/// Short label for logs and timeout errors: the first cmdlet line
fn describe(script: &str) -> String {
    let line = script
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("PowerShell");
    let cmdlet = line.split_whitespace().next().unwrap_or(line);
    cmdlet.trim_start_matches('$').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_ps() {
        assert_eq!(escape_ps("test"), "test");
        assert_eq!(escape_ps("test's"), "test''s");
        assert_eq!(escape_ps(r"C:\VMs\o'brien"), r"C:\VMs\o''brien");
    }

    #[test]
    fn test_describe_uses_first_cmdlet() {
        assert_eq!(describe("\n   Copy-Item -LiteralPath 'a' -Destination 'b'\n"), "Copy-Item");
        assert_eq!(describe("Get-VM"), "Get-VM");
        assert_eq!(describe(""), "PowerShell");
    }
}
