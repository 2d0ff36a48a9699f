//! Run options and their translation into agent invocation arguments.
//!
//! ## Merge law
//!
//! Every place options are combined (window defaults + call overrides,
//! request-queue defaults + existing window defaults) uses
//! [`RunOptions::merge`]: a field from the override wins only when it is
//! present and non-empty, otherwise the base field is kept.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one run. Every field is optional; absent fields are
/// omitted from the invocation rather than defaulted here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sandbox / isolation mode (`read-only`, `workspace-write`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Extra directories the agent may write to
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_directories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_git_repo_check: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn pick(base: &Option<String>, over: &Option<String>) -> Option<String> {
    if present(over) {
        over.clone()
    } else {
        base.clone()
    }
}

impl RunOptions {
    /// Combine `self` (base) with `over`; see the module docs for the law.
    pub fn merge(&self, over: &RunOptions) -> RunOptions {
        RunOptions {
            model: pick(&self.model, &over.model),
            sandbox_mode: pick(&self.sandbox_mode, &over.sandbox_mode),
            approval_policy: pick(&self.approval_policy, &over.approval_policy),
            working_directory: pick(&self.working_directory, &over.working_directory),
            additional_directories: if over.additional_directories.is_empty() {
                self.additional_directories.clone()
            } else {
                over.additional_directories.clone()
            },
            skip_git_repo_check: over.skip_git_repo_check.or(self.skip_git_repo_check),
            web_search: over.web_search.or(self.web_search),
            reasoning_effort: pick(&self.reasoning_effort, &over.reasoning_effort),
        }
    }

    /// Whether the fields a queued window needs before it can be created are set.
    pub fn is_launchable(&self) -> bool {
        present(&self.working_directory) && present(&self.sandbox_mode)
    }
}

/// The program a run spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableRef {
    pub program: PathBuf,
    /// Arguments placed before the generated invocation arguments
    pub args: Vec<String>,
}

impl ExecutableRef {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build from the `[agent]` config section.
    pub fn from_config(config: &crate::config::AgentConfig) -> Self {
        Self::new(&config.executable).with_args(config.extra_args.iter().cloned())
    }
}

/// Translate merged options into `exec` arguments.
///
/// The prompt itself is never an argument: the trailing `-` makes the agent
/// read it from stdin.
pub fn build_exec_args(options: &RunOptions, thread_id: Option<&str>) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "--json".to_string()];

    if let Some(model) = options.model.as_deref().filter(|v| !v.trim().is_empty()) {
        args.push("--model".into());
        args.push(model.to_string());
    }
    if let Some(sandbox) = options.sandbox_mode.as_deref().filter(|v| !v.trim().is_empty()) {
        args.push("--sandbox".into());
        args.push(sandbox.to_string());
    }
    if let Some(policy) = options
        .approval_policy
        .as_deref()
        .filter(|v| !v.trim().is_empty())
    {
        args.push("-c".into());
        args.push(format!("approval_policy=\"{policy}\""));
    }
    if let Some(cwd) = options
        .working_directory
        .as_deref()
        .filter(|v| !v.trim().is_empty())
    {
        args.push("--cd".into());
        args.push(cwd.to_string());
    }
    for dir in options
        .additional_directories
        .iter()
        .filter(|d| !d.trim().is_empty())
    {
        args.push("--add-dir".into());
        args.push(dir.clone());
    }
    if options.skip_git_repo_check == Some(true) {
        args.push("--skip-git-repo-check".into());
    }
    if let Some(enabled) = options.web_search {
        args.push("-c".into());
        args.push(format!("tools.web_search={enabled}"));
    }
    if let Some(effort) = options
        .reasoning_effort
        .as_deref()
        .filter(|v| !v.trim().is_empty())
    {
        args.push("-c".into());
        args.push(format!("model_reasoning_effort=\"{effort}\""));
    }
    if let Some(thread) = thread_id.filter(|t| !t.trim().is_empty()) {
        args.push("resume".into());
        args.push(thread.to_string());
    }
    args.push("-".into());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(model: Option<&str>, cwd: Option<&str>) -> RunOptions {
        RunOptions {
            model: model.map(String::from),
            working_directory: cwd.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_override_wins_when_present() {
        let base = opts(Some("gpt-5"), Some("/repo"));
        let over = opts(Some("gpt-5-codex"), None);
        let merged = base.merge(&over);
        assert_eq!(merged.model.as_deref(), Some("gpt-5-codex"));
        assert_eq!(merged.working_directory.as_deref(), Some("/repo"));
    }

    #[test]
    fn test_merge_ignores_empty_override() {
        let base = opts(Some("gpt-5"), Some("/repo"));
        let over = opts(Some("  "), Some(""));
        assert_eq!(base.merge(&over), base);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = opts(Some("a"), None);
        let over = RunOptions {
            sandbox_mode: Some("workspace-write".into()),
            additional_directories: vec!["/data".into()],
            web_search: Some(false),
            ..Default::default()
        };
        let once = base.merge(&over);
        assert_eq!(once.merge(&over), once);
    }

    #[test]
    fn test_build_args_omits_absent_options() {
        let args = build_exec_args(&RunOptions::default(), None);
        assert_eq!(args, vec!["exec", "--json", "-"]);
    }

    #[test]
    fn test_build_args_full() {
        let options = RunOptions {
            model: Some("gpt-5".into()),
            sandbox_mode: Some("workspace-write".into()),
            approval_policy: Some("never".into()),
            working_directory: Some("/repo".into()),
            additional_directories: vec!["/a".into(), "/b".into()],
            skip_git_repo_check: Some(true),
            web_search: Some(true),
            reasoning_effort: Some("high".into()),
        };
        let args = build_exec_args(&options, Some("thread-9"));
        assert_eq!(
            args,
            vec![
                "exec",
                "--json",
                "--model",
                "gpt-5",
                "--sandbox",
                "workspace-write",
                "-c",
                "approval_policy=\"never\"",
                "--cd",
                "/repo",
                "--add-dir",
                "/a",
                "--add-dir",
                "/b",
                "--skip-git-repo-check",
                "-c",
                "tools.web_search=true",
                "-c",
                "model_reasoning_effort=\"high\"",
                "resume",
                "thread-9",
                "-",
            ]
        );
    }

    #[test]
    fn test_launchable_requires_cwd_and_sandbox() {
        let mut options = opts(None, Some("/tmp"));
        assert!(!options.is_launchable());
        options.sandbox_mode = Some("x".into());
        assert!(options.is_launchable());
    }

    #[test]
    fn test_options_json_is_camel_case() {
        let options = opts(None, Some("/tmp"));
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json, serde_json::json!({"workingDirectory": "/tmp"}));
    }
}
