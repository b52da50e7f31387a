use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;

/// Exit status a scraper command uses to ask for an in-place retry (EX_TEMPFAIL).
pub const RETRYABLE_EXIT_CODE: i32 = 75;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ScrapeError {
    pub message: String,
    /// Set by the scraper when trying again right away may succeed.
    pub retryable: bool,
}

impl ScrapeError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// The scraping collaborator: fetches one replay page and returns its analysis.
#[async_trait]
pub trait ReplayFetcher: Send + Sync {
    async fn fetch_replay(&self, url: &str, session_id: Option<&str>)
        -> Result<Value, ScrapeError>;
}

/// Result of running the fetch loop for one job.
#[derive(Debug)]
pub struct FetchOutcome {
    pub attempts: u32,
    pub result: Result<Value, ScrapeError>,
}

/// Calls the fetcher, retrying retryable errors immediately up to a cap.
#[derive(Clone)]
pub struct FetchExecutor {
    fetcher: Arc<dyn ReplayFetcher>,
    max_attempts: u32,
}

impl FetchExecutor {
    pub fn new(fetcher: Arc<dyn ReplayFetcher>, max_attempts: u32) -> Self {
        Self {
            fetcher,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn execute(&self, job_id: &str, url: &str, session_id: Option<&str>) -> FetchOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            tracing::info!(job_id, url, attempt = attempts, "Fetching replay");
            match self.fetcher.fetch_replay(url, session_id).await {
                Ok(value) => {
                    return FetchOutcome {
                        attempts,
                        result: Ok(value),
                    }
                }
                Err(e) if e.retryable && attempts < self.max_attempts => {
                    tracing::warn!(job_id, attempt = attempts, error = %e, "Retryable scrape error");
                }
                Err(e) => {
                    tracing::error!(
                        job_id,
                        attempts,
                        retryable = e.retryable,
                        error = %e,
                        "Scrape failed"
                    );
                    return FetchOutcome {
                        attempts,
                        result: Err(e),
                    };
                }
            }
        }
    }
}

/// Runs an external scraper program per replay.
///
/// The program gets the url (and session id, when there is one) as trailing
/// arguments and prints the analysis as JSON on stdout. Exit code 75 marks a
/// retryable failure; any other non-zero exit is fatal.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
}

impl CommandFetcher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. No shell quoting.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    fn process_output(
        url: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> Result<Value, ScrapeError> {
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(url, error = %e, "Failed to spawn scraper");
                return Err(ScrapeError::fatal(format!("failed to spawn scraper: {e}")));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code();
        if !output.status.success() {
            let message = if stderr.is_empty() {
                format!("scraper exited with {exit_code:?}")
            } else {
                stderr
            };
            return Err(ScrapeError {
                message,
                retryable: exit_code == Some(RETRYABLE_EXIT_CODE),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ScrapeError::fatal(format!("scraper printed invalid JSON: {e}")))
    }
}

#[async_trait]
impl ReplayFetcher for CommandFetcher {
    async fn fetch_replay(
        &self,
        url: &str,
        session_id: Option<&str>,
    ) -> Result<Value, ScrapeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(url);
        if let Some(session_id) = session_id {
            cmd.arg(session_id);
        }
        let result = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        Self::process_output(url, result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        retryable: bool,
    }

    #[async_trait]
    impl ReplayFetcher for Scripted {
        async fn fetch_replay(&self, url: &str, _: Option<&str>) -> Result<Value, ScrapeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(ScrapeError {
                    message: format!("attempt {n}"),
                    retryable: self.retryable,
                });
            }
            Ok(json!({ "url": url }))
        }
    }

    fn scripted(fail_first: u32, retryable: bool) -> Arc<Scripted> {
        Arc::new(Scripted {
            calls: AtomicU32::new(0),
            fail_first,
            retryable,
        })
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_in_place() {
        let fetcher = scripted(2, true);
        let executor = FetchExecutor::new(fetcher.clone(), 3);
        let outcome = executor.execute("j1", "u", None).await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), json!({ "url": "u" }));
    }

    #[tokio::test]
    async fn retries_stop_at_the_cap() {
        let fetcher = scripted(10, true);
        let executor = FetchExecutor::new(fetcher.clone(), 3);
        let outcome = executor.execute("j1", "u", None).await;
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_aborts_immediately() {
        let fetcher = scripted(1, false);
        let executor = FetchExecutor::new(fetcher.clone(), 3);
        let outcome = executor.execute("j1", "u", None).await;
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.result.unwrap_err().retryable);
    }

    #[tokio::test]
    async fn command_fetcher_parses_json_stdout() {
        let fetcher = CommandFetcher::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"printf '{"url":"%s","session":"%s"}' "$0" "$1""#.to_string(),
            ],
        );
        let value = fetcher
            .fetch_replay("https://replay.test/1", Some("s1"))
            .await
            .unwrap();
        assert_eq!(value["url"], "https://replay.test/1");
        assert_eq!(value["session"], "s1");
    }

    #[tokio::test]
    async fn command_fetcher_maps_exit_codes() {
        let tempfail = CommandFetcher::new(
            "sh",
            vec!["-c".to_string(), "echo busy >&2; exit 75".to_string()],
        );
        let err = tempfail.fetch_replay("u", None).await.unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.message, "busy");

        let fatal = CommandFetcher::new("sh", vec!["-c".to_string(), "exit 1".to_string()]);
        assert!(!fatal.fetch_replay("u", None).await.unwrap_err().retryable);

        let garbage = CommandFetcher::new("sh", vec!["-c".to_string(), "echo nope".to_string()]);
        assert!(!garbage.fetch_replay("u", None).await.unwrap_err().retryable);
    }

    #[test]
    fn command_line_is_split_on_whitespace() {
        let fetcher = CommandFetcher::from_command_line("node scrape.js --headless").unwrap();
        assert_eq!(fetcher.program, "node");
        assert_eq!(fetcher.args, vec!["scrape.js", "--headless"]);
        assert!(CommandFetcher::from_command_line("   ").is_none());
    }
}
