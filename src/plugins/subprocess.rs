//! Subprocess plugin execution
//!
//! A subprocess plugin is a child process: arguments go in as one JSON
//! document on stdin, the result comes back on stdout. The manifest is
//! re-read from disk on every execution so plugin authors can edit
//! entry command, config defaults and timeout without re-registering.

use super::manifest::PluginManifest;
use super::SubprocessSpec;
use crate::error::{Result, VcpError};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

const MAX_STDERR_SNIPPET: usize = 2 * 1024;

/// Forced UTF-8 I/O hint for interpreter-based plugins.
const ENV_IO_ENCODING: (&str, &str) = ("PYTHONIOENCODING", "utf-8");
/// Points the child at the root of the plugin tree.
const ENV_BASE_PATH: &str = "VCP_SERVER_BASE";

/// Execute a subprocess plugin with `args` as its stdin document.
pub(crate) async fn execute(
    spec: &SubprocessSpec,
    plugin_root: &Path,
    plugin_id: &str,
    args: &Value,
) -> Result<Value> {
    let manifest = PluginManifest::load(&spec.directory)?;
    let entry = manifest
        .entry_point
        .as_ref()
        .map(|e| e.command.as_str())
        .ok_or_else(|| {
            VcpError::invalid_manifest(format!("plugin {plugin_id} has no entryPoint.command"))
        })?;

    let mut argv = entry.split_whitespace();
    let program = argv.next().ok_or_else(|| {
        VcpError::invalid_manifest(format!("plugin {plugin_id} has an empty entry command"))
    })?;

    let mut cmd = Command::new(program);
    cmd.args(argv)
        .current_dir(&spec.directory)
        .envs(manifest.config_defaults())
        .env(ENV_IO_ENCODING.0, ENV_IO_ENCODING.1)
        .env(ENV_BASE_PATH, plugin_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group so a timeout kill takes grandchildren with it
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .ok();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        VcpError::tool_execution_failed(format!("plugin {plugin_id}: failed to spawn {program}: {e}"))
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = args.to_string();
        // The child may exit without reading; a broken pipe here is not an error
        let _ = stdin.write_all(payload.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let pid = child.id();
    let timeout_duration = Duration::from_millis(manifest.timeout_ms());

    let output = match timeout(timeout_duration, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(VcpError::tool_execution_failed(format!(
                "plugin {plugin_id}: wait failed: {e}"
            )))
        }
        Err(_) => {
            if let Some(pid) = pid {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid;
                    let _ = killpg(Pid::from_raw(pid.cast_signed()), Signal::SIGKILL);
                }
                #[cfg(not(unix))]
                {
                    let _ = pid;
                }
            }
            return Err(VcpError::tool_timeout(format!(
                "plugin {plugin_id} timed out after {}ms",
                manifest.timeout_ms()
            ))
            .with_details(serde_json::json!({
                "pluginId": plugin_id,
                "timeoutMs": manifest.timeout_ms(),
            })));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(VcpError::tool_execution_failed(format!(
            "plugin {plugin_id} exited with code {exit_code}: {}",
            truncate(&stderr, MAX_STDERR_SNIPPET)
        ))
        .with_details(serde_json::json!({
            "pluginId": plugin_id,
            "exitCode": exit_code,
        })));
    }

    if !stderr.trim().is_empty() {
        tracing::debug!(plugin = plugin_id, stderr = %truncate(&stderr, MAX_STDERR_SNIPPET), "plugin wrote to stderr");
    }

    match serde_json::from_str::<Value>(&stdout) {
        Ok(parsed) => Ok(parsed),
        Err(_) => Ok(serde_json::json!({
            "status": "success",
            "result": stdout.trim(),
        })),
    }
}

/// Run a preprocessor plugin over a message list.
///
/// The child receives `{"messages": [...]}` on stdin and must print the
/// transformed list (bare array, or an object with a `messages` array).
pub(crate) async fn run_preprocessor(
    spec: &SubprocessSpec,
    plugin_root: &Path,
    plugin_id: &str,
    messages: &[Value],
) -> Result<Vec<Value>> {
    let payload = serde_json::json!({ "messages": messages });
    let result = execute(spec, plugin_root, plugin_id, &payload).await?;
    let transformed = match result {
        Value::Array(list) => list,
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(list)) => list,
            _ => {
                return Err(VcpError::tool_execution_failed(format!(
                    "preprocessor {plugin_id} did not return a message list"
                )))
            }
        },
        _ => {
            return Err(VcpError::tool_execution_failed(format!(
                "preprocessor {plugin_id} did not return a message list"
            )))
        }
    };
    Ok(transformed)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}… [truncated {} bytes]", &text[..cut], text.len() - cut)
}
