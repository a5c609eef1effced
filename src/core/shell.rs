//! Host shell plumbing - spawn commands, kill and check processes by pid

use anyhow::Result;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Spawn `command` through the host shell in `cwd` with stdout and stderr
/// piped. On Unix the child leads its own process group so that everything
/// it starts can be killed together.
pub fn spawn(command: &str, cwd: &Path) -> std::io::Result<Child> {
    let mut cmd = shell_command(command);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("powershell");
    cmd.args(["-NoProfile", "-Command", command]);
    cmd
}

/// Forcefully kill `pid` and, on Unix, its process group
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    // Group first; fall back to the bare pid for processes that are not
    // group leaders (e.g. recorded by an older controller)
    // No `--`: dash's builtin kill rejects it
    let script = format!("kill -9 -{pid} 2>/dev/null || kill -9 {pid}");
    let output = std::process::Command::new("sh")
        .args(["-c", &script])
        .output()?;

    if !output.status.success() {
        anyhow::bail!(
            "kill {} failed: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(windows)]
pub fn force_kill(pid: u32) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()?;

    if !output.status.success() {
        anyhow::bail!(
            "taskkill {} failed: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Check if a process is running. A killed process its parent has not
/// reaped yet counts as gone.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let signalable = std::process::Command::new("sh")
        .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    signalable && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // "pid (comm) S ..."; comm may itself contain ") "
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(") ")
                .map(|(_, rest)| rest.starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim_start().starts_with('Z'))
        .unwrap_or(false)
}

#[cfg(windows)]
pub fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Exit code as logged: the real code, or the negated signal number
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    -1
}
