use crate::error::{Result, ToolError};
use crate::traits::CommandRunner;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

const OUTPUT_BYTES_MAX: usize = 32_000;
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '<', '>', '`', '$', '\n'];
const DENIED_FLAG_PREFIXES: &[&str] = &["--output", "--ext-diff", "--exec"];

#[derive(Debug, Clone)]
pub struct ShellPolicy {
    pub sandbox_root: PathBuf,
    pub timeout: Duration,
    /// Whole programs the operator trusts in addition to the built-in allow-list.
    pub extra_programs: Vec<String>,
}

impl Default for ShellPolicy {
    fn default() -> Self {
        let sandbox_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            sandbox_root,
            timeout: Duration::from_secs(30),
            extra_programs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn render(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("[stderr]\n");
            out.push_str(stderr);
        }
        if self.exit_code != 0 {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[exit code {}]", self.exit_code));
        }
        if out.trim().is_empty() {
            return "[No output]".to_string();
        }
        keep_tail(out, OUTPUT_BYTES_MAX)
    }
}

pub struct SandboxedShell {
    policy: ShellPolicy,
}

impl SandboxedShell {
    pub fn new(policy: ShellPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ShellPolicy {
        &self.policy
    }

    /// Splits and vets a command line. Returns argv only for allow-listed invocations.
    pub fn authorize(&self, command: &str) -> Result<Vec<String>> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(ToolError::InvalidArguments("empty command".to_string()));
        }
        let not_allowed =
            || ToolError::Unauthorized(format!("'{trimmed}' is not in the command allow-list"));

        if trimmed.contains(SHELL_METACHARACTERS) {
            return Err(not_allowed());
        }
        let argv = shell_words::split(trimmed)
            .map_err(|e| ToolError::InvalidArguments(format!("could not parse command: {e}")))?;
        let Some(program) = argv.first() else {
            return Err(ToolError::InvalidArguments("empty command".to_string()));
        };

        if !self.is_allow_listed(&argv) {
            return Err(not_allowed());
        }
        if program.contains('/') {
            return Err(not_allowed());
        }
        for arg in &argv[1..] {
            if DENIED_FLAG_PREFIXES.iter().any(|p| arg.starts_with(p)) {
                return Err(ToolError::Unauthorized(format!(
                    "flag '{arg}' is not allowed in the sandbox"
                )));
            }
            if !arg.starts_with('-') {
                validate_relative_path(arg)?;
            }
        }
        Ok(argv)
    }

    fn is_allow_listed(&self, argv: &[String]) -> bool {
        let words: Vec<&str> = argv.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["ls", ..] | ["pwd"] | ["pytest", ..] => true,
            ["cat", _, ..] => true,
            ["git", "status" | "diff" | "log", ..] => true,
            ["python" | "python3", "-m", "pytest", ..] => true,
            ["cargo", "test", ..] => true,
            [program, ..] => self.policy.extra_programs.iter().any(|p| p.as_str() == *program),
            [] => false,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(program))]
    pub async fn execute(&self, command: &str) -> Result<CommandOutput> {
        let argv = self.authorize(command)?;
        tracing::Span::current().record("program", argv[0].as_str());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.policy.sandbox_root)
            .env("GIT_PAGER", "cat")
            .env("PAGER", "cat")
            .env("BENJAMIN_EXECUTION_MODE", "sandbox")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = tokio::time::timeout(self.policy.timeout, cmd.output())
            .await
            .map_err(|_| ToolError::Timeout(self.policy.timeout))?
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let out = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        tracing::info!(
            exit_code = out.exit_code,
            latency_ms = started.elapsed().as_millis() as u64,
            stdout_bytes = out.stdout.len(),
            "sandboxed command finished"
        );
        Ok(out)
    }
}

#[async_trait]
impl CommandRunner for SandboxedShell {
    async fn run_sandboxed(&self, command: &str) -> String {
        match self.execute(command).await {
            Ok(out) => out.render(),
            Err(e) => {
                tracing::warn!(error = %e, "sandboxed command not executed");
                e.to_stand_in()
            }
        }
    }
}

fn validate_relative_path(arg: &str) -> Result<()> {
    let rel = Path::new(arg);
    if rel.is_absolute() {
        return Err(ToolError::Unauthorized(format!(
            "absolute path '{arg}' is outside the sandbox"
        )));
    }
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(ToolError::Unauthorized(
                    "path traversal is not allowed in the sandbox".to_string(),
                ));
            }
            Component::CurDir | Component::Normal(_) => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::Unauthorized(format!(
                    "invalid path '{arg}' for the sandbox"
                )));
            }
        }
    }
    Ok(())
}

fn keep_tail(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[...truncated]\n{}", &text[start..])
}
