use async_trait::async_trait;

/// Runs one allow-listed command and renders the outcome as text.
///
/// Implementations never fail: a rejected, timed-out or crashed command comes back as a
/// bracketed stand-in string (`[Blocked: ...]`, `[Command timed out after 30s]`) so callers
/// can feed it straight into the next prompt.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_sandboxed(&self, command: &str) -> String;
}
