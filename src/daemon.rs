// src/daemon.rs
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{error, warn};

const PID_FILE: &str = "/tmp/dipsignal-pipeline.pid";
const LOG_FILE: &str = "/tmp/dipsignal-pipeline.log";
const ERR_FILE: &str = "/tmp/dipsignal-pipeline.err";

/// Grace period between SIGTERM and SIGKILL. Long enough for in-flight nodes
/// to notice the shutdown flag.
const STOP_GRACE: Duration = Duration::from_secs(10);

fn parse_pid(contents: &str) -> Result<u32> {
    contents
        .trim()
        .parse::<u32>()
        .with_context(|| format!("Invalid PID in PID file: {:?}", contents.trim()))
}

fn read_pid() -> Result<Option<u32>> {
    if !Path::new(PID_FILE).exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(PID_FILE).context("Failed to read PID file")?;
    parse_pid(&contents).map(Some)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> Result<bool> {
    let status = Command::new("ps")
        .arg("-p")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    Ok(status.success())
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> Result<bool> {
    let output = Command::new("tasklist")
        .arg("/FI")
        .arg(format!("PID eq {}", pid))
        .arg("/NH")
        .output()?;
    Ok(String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
}

fn is_daemon_running() -> Result<bool> {
    match read_pid()? {
        Some(pid) => process_alive(pid),
        None => Ok(false),
    }
}

/// Arguments for the background process: the foreground `start` plus any
/// global flags the operator passed.
fn child_args(config: Option<&Path>, dry_run: bool) -> Vec<String> {
    let mut args = vec!["start".to_string()];
    if let Some(path) = config {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    if dry_run {
        args.push("--dry-run".to_string());
    }
    args
}

/// Start the scheduler as a background process
pub async fn start_daemon(config: Option<PathBuf>, dry_run: bool) -> Result<()> {
    if is_daemon_running()? {
        println!("Pipeline scheduler is already running.");
        return Ok(());
    }

    let exec_path = std::env::current_exe().context("Cannot locate own executable")?;
    let args = child_args(config.as_deref(), dry_run);

    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("nohup");
        cmd.arg(&exec_path);
        cmd
    };
    #[cfg(not(unix))]
    let mut cmd = {
        warn!("Running on a non-Unix system. Daemon functionality may be limited.");
        Command::new(&exec_path)
    };

    let child = cmd
        .args(&args)
        .stdout(Stdio::from(File::create(LOG_FILE)?))
        .stderr(Stdio::from(File::create(ERR_FILE)?))
        .stdin(Stdio::null())
        .env("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .spawn()
        .context("Failed to spawn scheduler process")?;

    let pid = child.id();
    fs::write(PID_FILE, pid.to_string()).context("Failed to write PID file")?;

    // Give it a moment to fail fast on bad configuration.
    tokio::time::sleep(Duration::from_millis(500)).await;
    if !process_alive(pid)? {
        let _ = fs::remove_file(PID_FILE);
        anyhow::bail!("Scheduler exited immediately - see {}", ERR_FILE);
    }

    println!("Pipeline scheduler started with PID {}.", pid);
    println!("Logs are being written to {} and {}", LOG_FILE, ERR_FILE);
    Ok(())
}

/// Stop the background scheduler
pub async fn stop_daemon() -> Result<()> {
    let Some(pid) = read_pid()? else {
        println!("Pipeline scheduler is not running.");
        return Ok(());
    };

    if !process_alive(pid)? {
        warn!("Process with PID {} is not running, removing stale PID file", pid);
        fs::remove_file(PID_FILE)?;
        println!("Removed stale PID file.");
        return Ok(());
    }

    #[cfg(unix)]
    {
        let status = Command::new("kill").arg(pid.to_string()).status()?;
        if !status.success() {
            error!("Failed to signal process with PID {}", pid);
            anyhow::bail!("Failed to terminate process with PID {}", pid);
        }
        println!("Sent termination signal to scheduler (PID {}), waiting for in-flight runs...", pid);

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while process_alive(pid)? && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        if process_alive(pid)? {
            println!("Process still running, attempting force kill...");
            let forced = Command::new("kill").arg("-9").arg(pid.to_string()).status()?;
            if !forced.success() {
                anyhow::bail!("Failed to terminate process with PID {}", pid);
            }
            println!("Force killed scheduler (PID {}).", pid);
        }
    }

    #[cfg(not(unix))]
    {
        let status = Command::new("taskkill")
            .arg("/PID")
            .arg(pid.to_string())
            .arg("/F")
            .status()?;
        if !status.success() {
            println!("Failed to terminate process. The process may have already exited.");
        }
    }

    if Path::new(PID_FILE).exists() {
        fs::remove_file(PID_FILE)?;
    }
    println!("Pipeline scheduler stopped.");
    Ok(())
}

fn recent_logs(lines: usize) -> Result<String> {
    if !Path::new(LOG_FILE).exists() {
        return Ok("No log file found.".to_string());
    }
    let contents = fs::read_to_string(LOG_FILE)?;
    let all: Vec<&str> = contents.lines().collect();
    if all.is_empty() {
        return Ok("Log file exists but is empty.".to_string());
    }
    Ok(all[all.len().saturating_sub(lines)..].join("\n"))
}

/// Check the status of the background scheduler
pub async fn check_daemon_status() -> Result<()> {
    let pid = match read_pid()? {
        Some(pid) if process_alive(pid)? => pid,
        _ => {
            println!("Pipeline scheduler is not running.");
            return Ok(());
        }
    };

    println!("Pipeline scheduler is running (PID {}).", pid);

    #[cfg(unix)]
    {
        let uptime = Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .arg("-o")
            .arg("etime=")
            .output()?;
        let uptime = String::from_utf8_lossy(&uptime.stdout).trim().to_string();
        if !uptime.is_empty() {
            println!("Uptime: {}", uptime);
        }
    }

    println!("\nRecent logs:");
    println!("{}", recent_logs(10)?);
    Ok(())
}
