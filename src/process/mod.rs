use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("no command given")]
    EmptyCommand,
    #[error("failed to start process: {0}")]
    Start(#[from] std::io::Error),
    #[error("{0} of the process is not available")]
    PipeUnavailable(&'static str),
}

/// Where the pipeline gets its raw lines from
pub trait LineSource {
    /// True while the producing process is alive
    fn running(&mut self) -> bool;
    /// Lines of the standard output in arrival order
    fn stdout_queue(&mut self) -> &mut UnboundedReceiver<String>;
    /// Everything the error stream produced so far
    fn get_stderr(&mut self) -> Vec<String>;
}

/// Pumps the lines of one stream into a queue until the stream ends or
/// [`AsyncReader::stop_running`] was called. The flag is checked between
/// lines, a read that is waiting only returns when the stream closes.
pub struct AsyncReader {
    label: String,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl AsyncReader {
    pub fn start<R>(fd: R, queue: UnboundedSender<String>, label: &str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let name = label.to_string();

        let handle = tokio::spawn(async move {
            debug!("start async reader for {name}");
            let mut lines = BufReader::new(fd).split(b'\n');
            loop {
                let raw = match lines.next_segment().await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{name}: read failed: {e}");
                        break;
                    }
                };
                /* tfrec may print garbled bytes, they must not end the stream */
                let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();

                if queue.send(line).is_err() {
                    break;
                }
                if !flag.load(Ordering::Relaxed) {
                    break;
                }
            }
            debug!("async reader for {name} finished");
        });

        AsyncReader { label: label.to_string(), running, handle }
    }

    pub fn stop_running(&self) {
        debug!("stopping async reader for {}", self.label);
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Runs tfrec and exposes its output streams as line queues
pub struct ProcManager {
    cmd: String,
    process: Child,
    stdout_queue: UnboundedReceiver<String>,
    stdout_reader: AsyncReader,
    stderr_queue: UnboundedReceiver<String>,
    stderr_reader: AsyncReader,
}

impl ProcManager {
    /// Kills running instances of the same program, then starts `cmd`.
    /// Has to be called from within a tokio runtime.
    pub async fn startup(cmd: &str, path: Option<&str>, ld_library_path: Option<&str>) -> Result<Self, ProcessError> {
        let mut args = cmd.split_whitespace();
        let program = args.next().ok_or(ProcessError::EmptyCommand)?;

        kill_all(program_name(program)).await;

        info!("startup process '{cmd}'");
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(path) = path {
            let current = std::env::var("PATH").unwrap_or_default();
            command.env("PATH", format!("{path}:{current}"));
        }
        if let Some(ld_library_path) = ld_library_path {
            command.env("LD_LIBRARY_PATH", ld_library_path);
        }

        let mut process = command.spawn()?;
        let stdout = process.stdout.take().ok_or(ProcessError::PipeUnavailable("stdout"))?;
        let stderr = process.stderr.take().ok_or(ProcessError::PipeUnavailable("stderr"))?;

        let (out_tx, stdout_queue) = unbounded_channel();
        let (err_tx, stderr_queue) = unbounded_channel();

        Ok(ProcManager {
            cmd: cmd.to_string(),
            process,
            stdout_queue,
            stdout_reader: AsyncReader::start(stdout, out_tx, "stdout-thread"),
            stderr_queue,
            stderr_reader: AsyncReader::start(stderr, err_tx, "stderr-thread"),
        })
    }

    pub async fn shutdown(&mut self) {
        info!("shutdown process {}", self.cmd);
        self.stdout_reader.stop_running();
        self.stderr_reader.stop_running();
        if let Err(e) = self.process.start_kill() {
            debug!("process already gone: {e}");
        }
        if let Some(program) = self.cmd.split_whitespace().next() {
            kill_all(program_name(program)).await;
        }
    }
}

impl LineSource for ProcManager {
    fn running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    fn stdout_queue(&mut self) -> &mut UnboundedReceiver<String> {
        &mut self.stdout_queue
    }

    fn get_stderr(&mut self) -> Vec<String> {
        drain_queue(&mut self.stderr_queue)
    }
}

/// Takes whatever is queued right now without waiting
pub fn drain_queue(queue: &mut UnboundedReceiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = queue.try_recv() {
        lines.push(line);
    }
    lines
}

/// `/usr/local/bin/tfrec` -> `tfrec`
fn program_name(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

async fn get_pid(name: &str) -> Vec<i32> {
    match Command::new("pidof").arg(name).stdin(Stdio::null()).output().await {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect(),
        Err(e) => {
            debug!("pidof not usable: {e}");
            Vec::new()
        }
    }
}

async fn kill_all(name: &str) {
    for pid in get_pid(name).await {
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => info!("{name} with pid {pid} killed"),
            Err(e) => warn!("{name} with pid {pid} could not be killed: {e}"),
        }
    }
}
