//! Agent command construction and process launch.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use claude_proxy_error::SandboxError;

use crate::config::AgentCommand;

const BASE_FLAGS: [&str; 5] = [
    "--dangerously-skip-permissions",
    "--verbose",
    "--include-partial-messages",
    "--output-format",
    "stream-json",
];
const CONTINUE_FLAG: &str = "-c";
const PROMPT_FLAG: &str = "-p";

/// Builds the agent arguments. The prompt is always the final element and is
/// passed as one argv entry, never through a shell.
pub fn build_command(prompt: &str, continuation: bool) -> Vec<String> {
    let mut args: Vec<String> = BASE_FLAGS.iter().map(|flag| flag.to_string()).collect();
    if continuation {
        args.push(CONTINUE_FLAG.to_string());
    }
    args.push(PROMPT_FLAG.to_string());
    args.push(prompt.to_string());
    args
}

/// Short label for the invocation mode, used in logs.
pub fn mode_label(continuation: bool) -> &'static str {
    if continuation {
        "-c -p"
    } else {
        "-p"
    }
}

/// Spawns the agent in `cwd` with piped stdout/stderr.
///
/// On unix the child leads its own process group so a timeout can take down
/// everything it started.
pub fn launch(agent: &AgentCommand, args: &[String], cwd: &Path) -> Result<Child, SandboxError> {
    let mut cmd = Command::new(&agent.program);
    cmd.args(&agent.leading_args)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|err| SandboxError::AgentSpawnFailed {
        program: agent.program.clone(),
        message: err.to_string(),
    })
}

/// Sends SIGKILL to the child and, on unix, to its process group.
pub fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg only signals; the group id came from our own child.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    if let Err(err) = child.start_kill() {
        tracing::debug!(error = %err, "agent already exited before kill");
    }
}
