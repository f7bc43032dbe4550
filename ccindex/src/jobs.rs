//! Background job management for orchestrator runs.
//!
//! Jobs are detached subprocesses with stdout and stderr merged into a
//! timestamped log file. Every launch appends one JSON line to the
//! `orchestrator_jobs.jsonl` registry under an exclusive file lock; the
//! registry is append-only and never rewritten.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::{Error, Result};

/// One launched orchestrator job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub pid: u32,
    pub label: String,
    pub log_path: String,
    pub cmd: Vec<String>,
    pub started_at: String,
}

/// Signals accepted by `stop_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Kill,
    Int,
}

impl std::str::FromStr for StopSignal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TERM" | "SIGTERM" => Ok(StopSignal::Term),
            "KILL" | "SIGKILL" => Ok(StopSignal::Kill),
            "INT" | "SIGINT" => Ok(StopSignal::Int),
            other => Err(Error::Config(format!("unknown signal: {}", other))),
        }
    }
}

impl StopSignal {
    fn as_raw(self) -> i32 {
        match self {
            StopSignal::Term => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
            StopSignal::Int => libc::SIGINT,
        }
    }
}

/// Coarse progress parsed from a job's log tail.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSummary {
    pub current_collection: Option<String>,
    pub current_stage: Option<String>,
    pub last_heartbeat: Option<String>,
}

/// Status of one job: the registry record, liveness, and a log tail.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub record: Option<JobRecord>,
    pub alive: bool,
    pub tail: String,
    pub progress: ProgressSummary,
}

/// Build the orchestrator argv from persisted settings plus overrides.
///
/// `extra_args` are appended verbatim after the settings-derived flags so
/// explicit flags win over persisted defaults.
pub fn plan_command(config: &Config, extra_args: &[String]) -> Result<Vec<String>> {
    let exe = std::env::current_exe()?;
    let mut argv = vec![
        exe.to_string_lossy().to_string(),
        "run".to_string(),
        "--ccindex-root".to_string(),
        config.ccindex_root.to_string_lossy().to_string(),
        "--parquet-root".to_string(),
        config.parquet_root.to_string_lossy().to_string(),
        "--duckdb-collection-root".to_string(),
        config.duckdb_collection_root.to_string_lossy().to_string(),
        "--duckdb-year-root".to_string(),
        config.duckdb_year_root.to_string_lossy().to_string(),
        "--duckdb-master-root".to_string(),
        config.duckdb_master_root.to_string_lossy().to_string(),
        "--workers".to_string(),
        config.workers.to_string(),
        "--heartbeat-seconds".to_string(),
        config.heartbeat_seconds.to_string(),
    ];
    if let Some(n) = config.sort_workers {
        argv.push("--sort-workers".to_string());
        argv.push(n.to_string());
    }
    argv.push("--sort-memory-per-worker-gb".to_string());
    argv.push(config.sort_memory_per_worker_gb.to_string());
    if let Some(dir) = &config.sort_temp_dir {
        argv.push("--sort-temp-dir".to_string());
        argv.push(dir.to_string_lossy().to_string());
    }
    argv.extend(extra_args.iter().cloned());
    Ok(argv)
}

/// Launch a job as a detached subprocess and append it to the registry.
pub fn start_job(config: &Config, argv: &[String], label: &str) -> Result<JobRecord> {
    if argv.is_empty() {
        return Err(Error::Config("empty command".to_string()));
    }

    std::fs::create_dir_all(&config.log_dir)?;
    let log_name = format!("{}_{}.log", label, Local::now().format("%Y%m%d_%H%M%S"));
    let log_path = config.log_dir.join(log_name);
    let log_file = File::create(&log_path)?;
    let log_clone = log_file.try_clone()?;

    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_clone))
        .process_group(0)
        .spawn()?;

    let record = JobRecord {
        pid: child.id(),
        label: label.to_string(),
        log_path: log_path.to_string_lossy().to_string(),
        cmd: argv.to_vec(),
        started_at: Utc::now().to_rfc3339(),
    };
    append_registry(config, &record)?;

    info!(pid = record.pid, label, log = %record.log_path, "job started");
    Ok(record)
}

/// Append one record to the registry under an exclusive lock.
fn append_registry(config: &Config, record: &JobRecord) -> Result<()> {
    let path = config.jobs_registry_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

    let fd = file.as_raw_fd();
    let locked = unsafe { libc::flock(fd, libc::LOCK_EX) } == 0;
    let line = serde_json::to_string(record)
        .map_err(|e| Error::Config(format!("serialize job record: {}", e)))?;
    let result = writeln!(file, "{}", line);
    if locked {
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
    result?;
    Ok(())
}

/// Check liveness by sending signal 0.
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Deliver a stop signal to a job.
pub fn stop_job(pid: u32, signal: StopSignal) -> Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
    if rc != 0 {
        return Err(Error::NotFound(format!("no such process: {}", pid)));
    }
    info!(pid, signal = ?signal, "signal delivered");
    Ok(())
}

/// Read the registry, newest-last on disk; returns at most `limit` records
/// from the end.
pub fn list_jobs(config: &Config, limit: usize) -> Result<Vec<JobRecord>> {
    let path = config.jobs_registry_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(&path)?;
    let records: Vec<JobRecord> = contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let skip = records.len().saturating_sub(limit);
    Ok(records.into_iter().skip(skip).collect())
}

/// Read the last `lines` lines of a log file.
pub fn tail_file(path: &Path, lines: usize) -> Result<String> {
    const CHUNK: u64 = 64 * 1024;
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    // Read a bounded window from the end; enough for any sane tail request.
    let want = (lines as u64).saturating_mul(512).clamp(CHUNK, 8 * CHUNK);
    let start = len.saturating_sub(want);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;

    let collected: Vec<&str> = buf.lines().collect();
    let skip = collected.len().saturating_sub(lines);
    Ok(collected[skip..].join("\n"))
}

/// Status of a job located by pid or by log path.
pub fn job_status(
    config: &Config,
    pid: Option<u32>,
    log_path: Option<&Path>,
    lines: usize,
) -> Result<JobStatus> {
    let jobs = list_jobs(config, usize::MAX)?;
    let record = jobs
        .into_iter()
        .rev()
        .find(|j| match (pid, log_path) {
            (Some(p), _) => j.pid == p,
            (None, Some(lp)) => Path::new(&j.log_path) == lp,
            (None, None) => true,
        });

    let alive = record.as_ref().map(|r| pid_alive(r.pid)).unwrap_or(false);
    let tail = match (&record, log_path) {
        (Some(r), _) => tail_file(Path::new(&r.log_path), lines).unwrap_or_default(),
        (None, Some(lp)) => tail_file(lp, lines).unwrap_or_default(),
        (None, None) => String::new(),
    };
    let progress = parse_progress_from_tail(&tail);

    Ok(JobStatus {
        record,
        alive,
        tail,
        progress,
    })
}

/// Best-effort extraction of pipeline progress from a log tail.
pub fn parse_progress_from_tail(tail: &str) -> ProgressSummary {
    let mut progress = ProgressSummary::default();
    for line in tail.lines() {
        if let Some(idx) = line.find("processing collection ") {
            let rest = &line[idx + "processing collection ".len()..];
            let name: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect();
            if !name.is_empty() {
                progress.current_collection = Some(name);
            }
        }
        for stage in ["download", "convert", "sort", "index", "cleanup"] {
            if line.contains(&format!("stage: {}", stage)) {
                progress.current_stage = Some(stage.to_string());
            }
        }
        if line.contains("heartbeat") {
            progress.last_heartbeat = Some(line.trim().to_string());
        }
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_registry_append_only_in_launch_order() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());

        for i in 0..3 {
            let record = JobRecord {
                pid: 1000 + i,
                label: format!("job-{}", i),
                log_path: format!("/tmp/job-{}.log", i),
                cmd: vec!["ccpipe".to_string(), "run".to_string()],
                started_at: Utc::now().to_rfc3339(),
            };
            append_registry(&config, &record).unwrap();
        }

        let jobs = list_jobs(&config, 50).unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].pid, 1000);
        assert_eq!(jobs[2].pid, 1002);

        let jobs = list_jobs(&config, 2).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].pid, 1001);
    }

    #[test]
    fn test_pid_alive_self() {
        assert!(pid_alive(std::process::id()));
        // A pid far beyond pid_max should not be alive.
        assert!(!pid_alive(4_000_000));
    }

    #[test]
    fn test_tail_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.log");
        let body: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, body).unwrap();

        let tail = tail_file(&path, 3).unwrap();
        assert_eq!(tail, "line 97\nline 98\nline 99");
    }

    #[test]
    fn test_plan_command_includes_roots() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());

        let argv = plan_command(&config, &["--filter".to_string(), "2024".to_string()]).unwrap();
        assert_eq!(argv[1], "run");
        assert!(argv.contains(&"--ccindex-root".to_string()));
        assert!(argv.contains(&"--filter".to_string()));
        // Overrides come last.
        assert_eq!(argv.last().unwrap(), "2024");
    }

    #[test]
    fn test_parse_progress_from_tail() {
        let tail = "pipeline stage: sort\n\
                    processing collection CC-MAIN-2024-10\n\
                    heartbeat: still running (elapsed 2.5 min)";
        let progress = parse_progress_from_tail(tail);
        assert_eq!(progress.current_collection.as_deref(), Some("CC-MAIN-2024-10"));
        assert_eq!(progress.current_stage.as_deref(), Some("sort"));
        assert!(progress.last_heartbeat.unwrap().contains("elapsed"));
    }
}
