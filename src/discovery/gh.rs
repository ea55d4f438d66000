use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::discovery::source::{IssueSource, IssueStatus, SourceItem};
use crate::error::SourceError;

const LIST_FIELDS: &str = "number,title,body,labels,createdAt";
const LIST_LIMIT: &str = "200";

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    created_at: Option<DateTime<Utc>>,
}

/// GitHub issues through the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhCliSource {
    repo: String,
    trigger_label: String,
    command_timeout: Duration,
    program: String,
}

impl GhCliSource {
    pub fn new(repo: impl Into<String>, trigger_label: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            trigger_label: trigger_label.into(),
            command_timeout: Duration::from_secs(60),
            program: "gh".to_string(),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Use another executable in place of `gh`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn issue_number<'a>(&self, source_id: &'a str) -> Result<&'a str, SourceError> {
        source_id
            .strip_prefix(self.repo.as_str())
            .and_then(|rest| rest.strip_prefix('#'))
            .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))
    }

    async fn gh(&self, args: &[&str]) -> Result<String, SourceError> {
        let command = format!("{} {}", self.program, args.join(" "));
        tracing::debug!(command = %command, "Running gh");

        let run = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.command_timeout, run).await {
            Err(_) => return Err(SourceError::Timeout(self.command_timeout)),
            Ok(Err(e)) => {
                return Err(SourceError::Command {
                    command,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(SourceError::Command {
                command,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parses `gh issue list --json number,title,body,labels,createdAt` output.
pub fn parse_issue_list(repo: &str, json: &str) -> Result<Vec<SourceItem>, SourceError> {
    let issues: Vec<GhIssue> =
        serde_json::from_str(json).map_err(|e| SourceError::Malformed(e.to_string()))?;

    Ok(issues
        .into_iter()
        .map(|issue| {
            let labels: Vec<String> = issue.labels.into_iter().map(|l| l.name).collect();
            let body = issue.body.unwrap_or_default();
            let payload = serde_json::json!({
                "repo": repo,
                "number": issue.number,
                "title": issue.title,
                "body": body,
                "labels": labels,
                "created_at": issue.created_at,
            });
            SourceItem {
                source_id: format!("{}#{}", repo, issue.number),
                title: issue.title,
                body,
                labels,
                created_at: issue.created_at,
                payload,
            }
        })
        .collect())
}

#[async_trait]
impl IssueSource for GhCliSource {
    async fn list_triggering_items(&self) -> Result<Vec<SourceItem>, SourceError> {
        let stdout = self
            .gh(&[
                "issue",
                "list",
                "--repo",
                &self.repo,
                "--label",
                &self.trigger_label,
                "--state",
                "open",
                "--limit",
                LIST_LIMIT,
                "--json",
                LIST_FIELDS,
            ])
            .await?;
        parse_issue_list(&self.repo, &stdout)
    }

    async fn set_status(
        &self,
        source_id: &str,
        status: IssueStatus,
        comment: Option<&str>,
    ) -> Result<(), SourceError> {
        let number = self.issue_number(source_id)?;

        let stale = IssueStatus::ALL
            .iter()
            .filter(|s| **s != status)
            .map(|s| s.label())
            .collect::<Vec<_>>()
            .join(",");
        let swapped = self
            .gh(&[
                "issue",
                "edit",
                number,
                "--repo",
                &self.repo,
                "--add-label",
                status.label(),
                "--remove-label",
                &stale,
            ])
            .await;
        if let Err(e) = swapped {
            // Removing a label the repository has never had fails the whole
            // edit; adding alone still moves the issue forward.
            tracing::debug!(source_id, error = %e, "Label swap failed, adding only");
            self.gh(&["issue", "edit", number, "--repo", &self.repo, "--add-label", status.label()])
                .await?;
        }

        if let Some(body) = comment {
            self.gh(&["issue", "comment", number, "--repo", &self.repo, "--body", body])
                .await?;
        }

        tracing::info!(source_id, status = %status, "Issue status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"number": 42, "title": "Fix login", "body": "Node app crashes",
         "labels": [{"name": "claude-bot"}, {"name": "p1"}],
         "createdAt": "2024-05-01T10:00:00Z"},
        {"number": 43, "title": "Docs", "body": null, "labels": [], "createdAt": null}
    ]"#;

    #[test]
    fn test_parses_issue_list_output() {
        let items = parse_issue_list("acme/web", SAMPLE).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source_id, "acme/web#42");
        assert_eq!(items[0].labels, vec!["claude-bot", "p1"]);
        assert_eq!(items[0].payload["number"], 42);
        assert!(items[0].created_at.is_some());
        assert_eq!(items[1].body, "");
    }

    #[test]
    fn test_malformed_output_is_reported() {
        assert!(matches!(
            parse_issue_list("acme/web", "not json"),
            Err(SourceError::Malformed(_))
        ));
    }

    /// A stand-in `gh` that appends its arguments to `calls.log`.
    #[cfg(unix)]
    fn recording_gh(dir: &std::path::Path, exit_code: i32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("gh");
        let script = format!(
            "#!/bin/sh\necho \"$*\" >> {}/calls.log\nexit {}\n",
            dir.display(),
            exit_code
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_change_is_a_single_edit() {
        let dir = tempfile::tempdir().unwrap();
        let source = GhCliSource::new("acme/web", "claude-bot")
            .with_program(recording_gh(dir.path(), 0));

        source
            .set_status("acme/web#12", IssueStatus::Completed, Some("done"))
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let calls: Vec<&str> = log.lines().collect();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("issue edit 12 --repo acme/web --add-label bot:completed"));
        assert!(calls[0].contains("--remove-label bot:queued,bot:in-progress,bot:failed"));
        assert!(calls[1].starts_with("issue comment 12"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_swap_falls_back_to_adding() {
        let dir = tempfile::tempdir().unwrap();
        let source = GhCliSource::new("acme/web", "claude-bot")
            .with_program(recording_gh(dir.path(), 1));

        let err = source
            .set_status("acme/web#12", IssueStatus::Queued, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Command { .. }));

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let calls: Vec<&str> = log.lines().collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], "issue edit 12 --repo acme/web --add-label bot:queued");
    }

    #[test]
    fn test_issue_number_requires_matching_repo() {
        let source = GhCliSource::new("acme/web", "claude-bot");
        assert_eq!(source.issue_number("acme/web#12").unwrap(), "12");
        assert!(source.issue_number("other/repo#12").is_err());
        assert!(source.issue_number("acme/web#").is_err());
        assert!(source.issue_number("acme/web#1;rm").is_err());
    }
}
