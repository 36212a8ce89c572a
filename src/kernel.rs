use crate::{
    config::{ResourceLimits, ServiceConfig},
    errors::{Result, SandboxError},
    output::{ExecutionResult, OutputAggregator},
    protocol::{ExecutionState, KernelEvent, KernelFrame, KernelRequest, KERNEL_SHIM},
    resolver::DependencyResolver,
    sandbox::SandboxId,
};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// A persistent interpreter that runs code against one long-lived namespace
#[async_trait]
pub trait Kernel: Send + Sync {
    /// Run `code` and collect everything it emits. Submissions are serialized in
    /// arrival order; a full queue fails with `Busy`.
    async fn submit(&self, code: &str, timeout: Duration) -> Result<ExecutionResult>;

    /// Ask the running execution to stop
    async fn interrupt(&self) -> Result<()>;

    /// Stop the process and release its resources. Idempotent.
    async fn shutdown(&self) -> Result<()>;

    fn state(&self) -> KernelState;
}

/// Starts kernels for freshly provisioned sandboxes
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn Kernel>>;
}

/// What a launcher needs to know about the sandbox it starts a kernel for
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub sandbox_id: SandboxId,
    pub env_path: PathBuf,
    pub workspace_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Starting,
    Idle,
    Busy,
    Terminated,
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelState::Starting => "starting",
            KernelState::Idle => "idle",
            KernelState::Busy => "busy",
            KernelState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Per-kernel knobs taken from the service config
#[derive(Debug, Clone)]
pub struct KernelSettings {
    pub startup_timeout: Duration,
    pub interrupt_grace: Duration,
    /// Submissions allowed to wait behind the running one
    pub queue_depth: usize,
    pub limits: ResourceLimits,
}

impl KernelSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            startup_timeout: config.kernel_startup_timeout,
            interrupt_grace: config.interrupt_grace,
            queue_depth: config.queue_depth,
            limits: config.limits.clone(),
        }
    }
}

/// The request/response half of the process, held by whoever is executing
struct KernelIo {
    /// Whole request lines, written to stdin by a dedicated task so that a
    /// submitter going away mid-write never leaves half a line behind.
    requests: mpsc::UnboundedSender<String>,
    frames: Lines<BufReader<ChildStdout>>,
    /// Execution whose completion has not been observed yet. Survives a
    /// submitter that stopped waiting, so the next one can drain it.
    in_flight: Option<OutputAggregator>,
}

impl KernelIo {
    fn send(&self, request: &KernelRequest) -> Result<()> {
        let line = request.encode()?;
        self.requests
            .send(line)
            .map_err(|_| SandboxError::KernelCrashed("kernel input is closed".to_string()))
    }

    /// Read frames until the in-flight execution completes. Cancel safe.
    async fn pump(&mut self, sandbox_id: SandboxId) -> Result<()> {
        loop {
            let Some(aggregator) = self.in_flight.as_mut() else {
                return Ok(());
            };
            if aggregator.is_complete() {
                return Ok(());
            }
            let line = match self.frames.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(SandboxError::KernelCrashed(
                        "kernel process exited".to_string(),
                    ))
                }
                Err(e) => {
                    return Err(SandboxError::KernelCrashed(format!(
                        "reading kernel output: {}",
                        e
                    )))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let frame = match KernelFrame::decode(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[KERNEL] Sandbox {}: {}", sandbox_id, e);
                    continue;
                }
            };
            if let Err(e) = aggregator.accept(&frame) {
                warn!("[KERNEL] Sandbox {}: {}", sandbox_id, e);
            }
        }
    }
}

/// One interpreter process per sandbox, bridged to a single `submit` call.
///
/// Starting -> Idle -> Busy -> Idle ... -> Terminated. The process is never
/// restarted: a kernel that will not yield to an interrupt is killed and stays
/// Terminated, so the sandbox's accumulated state is never silently lost.
pub struct KernelSession {
    sandbox_id: SandboxId,
    settings: KernelSettings,
    pid: Option<u32>,
    state: Mutex<KernelState>,
    admission: Semaphore,
    io: tokio::sync::Mutex<KernelIo>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl KernelSession {
    /// Spawn the interpreter from `spec.env_path` with the workspace as its working
    /// directory, and wait for it to report idle.
    pub async fn start(spec: &LaunchSpec, settings: KernelSettings) -> Result<Self> {
        let python = DependencyResolver::env_python(&spec.env_path);
        if !python.exists() {
            return Err(SandboxError::KernelStartFailure(format!(
                "interpreter {} does not exist",
                python.display()
            )));
        }

        let mut cmd = Command::new(&python);
        cmd.arg("-u")
            .arg("-c")
            .arg(KERNEL_SHIM)
            .current_dir(&spec.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_environment(&mut cmd, &spec.env_path, &settings.limits)?;
        apply_process_limits(&mut cmd, &settings.limits);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::KernelStartFailure(e.to_string()))?;
        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(SandboxError::KernelStartFailure(
                "kernel pipes unavailable".to_string(),
            ));
        };

        let sandbox_id = spec.sandbox_id;
        let (requests, outgoing) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(stdin, outgoing, sandbox_id));
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[KERNEL] Sandbox {} stderr: {}", sandbox_id, line);
            }
        });

        let mut frames = BufReader::new(stdout).lines();
        match tokio::time::timeout(settings.startup_timeout, wait_until_ready(&mut frames)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                kill_process_group(pid);
                let _ = child.start_kill();
                return Err(e);
            }
            Err(_) => {
                kill_process_group(pid);
                let _ = child.start_kill();
                return Err(SandboxError::KernelStartFailure(format!(
                    "kernel did not become ready within {:?}",
                    settings.startup_timeout
                )));
            }
        }

        info!(
            "[KERNEL] Sandbox {}: kernel ready (pid {:?}, {})",
            sandbox_id,
            pid,
            python.display()
        );
        let permits = settings.queue_depth + 1;
        Ok(Self {
            sandbox_id,
            settings,
            pid,
            state: Mutex::new(KernelState::Idle),
            admission: Semaphore::new(permits),
            io: tokio::sync::Mutex::new(KernelIo {
                requests,
                frames,
                in_flight: None,
            }),
            child: tokio::sync::Mutex::new(Some(child)),
        })
    }

    fn set_state(&self, next: KernelState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != KernelState::Terminated {
            *state = next;
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state() == KernelState::Terminated {
            Err(SandboxError::KernelCrashed("kernel has terminated".to_string()))
        } else {
            Ok(())
        }
    }

    fn send_interrupt(&self) {
        match self.pid {
            Some(pid) => signal_interrupt(pid, self.sandbox_id),
            None => warn!(
                "[KERNEL] Sandbox {}: no pid to interrupt",
                self.sandbox_id
            ),
        }
    }

    /// Kill the process group and mark the session Terminated
    pub async fn terminate(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = KernelState::Terminated;
        kill_process_group(self.pid);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => debug!(
                    "[KERNEL] Sandbox {}: kernel exited with {}",
                    self.sandbox_id, status
                ),
                Ok(Err(e)) => warn!(
                    "[KERNEL] Sandbox {}: failed to reap kernel: {}",
                    self.sandbox_id, e
                ),
                Err(_) => warn!(
                    "[KERNEL] Sandbox {}: kernel did not exit after SIGKILL",
                    self.sandbox_id
                ),
            }
        }
    }

    /// Interrupt an execution that its submitter abandoned and wait for it to finish
    async fn drain_abandoned(&self, io: &mut KernelIo) -> Result<()> {
        warn!(
            "[KERNEL] Sandbox {}: interrupting abandoned execution",
            self.sandbox_id
        );
        self.send_interrupt();
        match tokio::time::timeout(self.settings.interrupt_grace, io.pump(self.sandbox_id)).await
        {
            Ok(Ok(())) => {
                io.in_flight = None;
                Ok(())
            }
            Ok(Err(e)) => {
                self.terminate().await;
                Err(e)
            }
            Err(_) => {
                self.terminate().await;
                Err(SandboxError::KernelCrashed(
                    "abandoned execution did not yield to interrupt".to_string(),
                ))
            }
        }
    }
}

/// Interrupts the running cell when its submitter stops waiting for it.
/// The leftover frames are drained by the next submit.
struct SubmitGuard<'a> {
    session: &'a KernelSession,
    armed: bool,
}

impl SubmitGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                "[KERNEL] Sandbox {}: submitter went away, interrupting execution",
                self.session.sandbox_id
            );
            self.session.send_interrupt();
            self.session.set_state(KernelState::Idle);
        }
    }
}

impl KernelSession {
    /// Send `code` and collect its frames. Leaves `io.in_flight` empty unless
    /// the future is dropped part way.
    async fn run(&self, io: &mut KernelIo, code: &str, timeout: Duration) -> Result<ExecutionResult> {
        let request = KernelRequest::execute(code);
        io.in_flight = Some(OutputAggregator::new(request.msg_id()));
        self.set_state(KernelState::Busy);
        debug!(
            "[KERNEL] Sandbox {}: executing request {}",
            self.sandbox_id,
            request.msg_id()
        );
        if let Err(e) = io.send(&request) {
            io.in_flight = None;
            self.terminate().await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, io.pump(self.sandbox_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("[KERNEL] Sandbox {}: {}", self.sandbox_id, e);
                io.in_flight = None;
                self.terminate().await;
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "[KERNEL] Sandbox {}: execution exceeded {:?}, interrupting",
                    self.sandbox_id, timeout
                );
                self.send_interrupt();
                let grace = self.settings.interrupt_grace;
                return match tokio::time::timeout(grace, io.pump(self.sandbox_id)).await {
                    Ok(Ok(())) => {
                        io.in_flight = None;
                        self.set_state(KernelState::Idle);
                        Err(SandboxError::ExecutionTimeout(timeout))
                    }
                    Ok(Err(e)) => {
                        io.in_flight = None;
                        self.terminate().await;
                        Err(e)
                    }
                    Err(_) => {
                        error!(
                            "[KERNEL] Sandbox {}: kernel ignored interrupt for {:?}, killing it",
                            self.sandbox_id, grace
                        );
                        io.in_flight = None;
                        self.terminate().await;
                        Err(SandboxError::KernelCrashed(format!(
                            "execution exceeded {:?} and did not yield to interrupt",
                            timeout
                        )))
                    }
                };
            }
        }

        let result = io
            .in_flight
            .take()
            .map(OutputAggregator::finish)
            .unwrap_or_default();
        self.set_state(KernelState::Idle);
        Ok(result)
    }
}

#[async_trait]
impl Kernel for KernelSession {
    async fn submit(&self, code: &str, timeout: Duration) -> Result<ExecutionResult> {
        self.ensure_alive()?;
        let _permit = self.admission.try_acquire().map_err(|_| SandboxError::Busy)?;
        let mut io = self.io.lock().await;
        self.ensure_alive()?;

        if io.in_flight.is_some() {
            self.drain_abandoned(&mut io).await?;
        }

        let mut guard = SubmitGuard {
            session: self,
            armed: true,
        };
        let outcome = self.run(&mut io, code, timeout).await;
        guard.disarm();
        outcome
    }

    async fn interrupt(&self) -> Result<()> {
        self.ensure_alive()?;
        self.send_interrupt();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.state() == KernelState::Terminated {
            return Ok(());
        }
        // Ask politely when no execution holds the channel.
        if let Ok(io) = self.io.try_lock() {
            let _ = io.send(&KernelRequest::shutdown());
        }
        let exited = {
            let mut child = self.child.lock().await;
            match child.as_mut() {
                Some(child) => {
                    tokio::time::timeout(self.settings.interrupt_grace, child.wait())
                        .await
                        .is_ok()
                }
                None => true,
            }
        };
        if !exited {
            debug!(
                "[KERNEL] Sandbox {}: kernel did not exit on request",
                self.sandbox_id
            );
        }
        // Also reaps anything the user's code left running in the group.
        self.terminate().await;
        info!("[KERNEL] Sandbox {}: kernel shut down", self.sandbox_id);
        Ok(())
    }

    fn state(&self) -> KernelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state != KernelState::Terminated {
            kill_process_group(self.pid);
        }
    }
}

/// Launches `KernelSession`s as local processes
#[derive(Debug, Clone)]
pub struct ProcessKernelLauncher {
    settings: KernelSettings,
}

impl ProcessKernelLauncher {
    pub fn new(settings: KernelSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl KernelLauncher for ProcessKernelLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn Kernel>> {
        let session = KernelSession::start(&spec, self.settings.clone()).await?;
        Ok(Arc::new(session))
    }
}

/// Feed queued request lines to the interpreter until the session goes away
async fn write_requests(
    mut stdin: ChildStdin,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    sandbox_id: SandboxId,
) {
    while let Some(line) = outgoing.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // The read side sees the exit and reports the crash.
            debug!("[KERNEL] Sandbox {}: stdin closed: {}", sandbox_id, e);
            break;
        }
    }
}

async fn wait_until_ready(frames: &mut Lines<BufReader<ChildStdout>>) -> Result<()> {
    loop {
        let line = frames
            .next_line()
            .await
            .map_err(|e| SandboxError::KernelStartFailure(e.to_string()))?
            .ok_or_else(|| {
                SandboxError::KernelStartFailure("kernel exited during startup".to_string())
            })?;
        let Ok(frame) = KernelFrame::decode(&line) else {
            continue;
        };
        if frame.parent_id.is_none()
            && matches!(
                frame.event(),
                Ok(KernelEvent::Status(ExecutionState::Idle))
            )
        {
            return Ok(());
        }
    }
}

/// Environment of a kernel process: the sandbox's own interpreter first on PATH
fn configure_environment(cmd: &mut Command, env_path: &Path, limits: &ResourceLimits) -> Result<()> {
    let bin = DependencyResolver::env_python(env_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| env_path.to_path_buf());
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    let path = std::env::join_paths(
        std::iter::once(bin).chain(std::env::split_paths(&inherited)),
    )
    .map_err(|e| SandboxError::KernelStartFailure(e.to_string()))?;

    let threads = limits.max_threads.to_string();
    cmd.env("VIRTUAL_ENV", env_path)
        .env("PATH", path)
        .env("PYTHONIOENCODING", "utf-8")
        .env("PYTHONUNBUFFERED", "1")
        .env("MPLBACKEND", "Agg")
        .env("OMP_NUM_THREADS", &threads)
        .env("OPENBLAS_NUM_THREADS", &threads)
        .env("MKL_NUM_THREADS", &threads)
        .env_remove("PYTHONHOME")
        .env_remove("PYTHONPATH")
        .env_remove("PYTHONSTARTUP");
    Ok(())
}

/// Own process group so the whole tree can be killed; optional address-space cap
#[cfg(unix)]
fn apply_process_limits(cmd: &mut Command, limits: &ResourceLimits) {
    let memory_bytes = limits.memory_mb.map(|mb| (mb as u64) * 1024 * 1024);
    unsafe {
        cmd.pre_exec(move || {
            libc::setpgid(0, 0);

            // macOS doesn't support RLIMIT_AS properly, skip it
            #[cfg(not(target_os = "macos"))]
            {
                if let Some(bytes) = memory_bytes {
                    let rlimit = libc::rlimit {
                        rlim_cur: bytes as libc::rlim_t,
                        rlim_max: bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
            }
            #[cfg(target_os = "macos")]
            let _ = memory_bytes;

            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_process_limits(_cmd: &mut Command, _limits: &ResourceLimits) {}

#[cfg(unix)]
fn signal_interrupt(pid: u32, sandbox_id: SandboxId) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!(
            "[KERNEL] Sandbox {}: failed to interrupt pid {}: {}",
            sandbox_id, pid, e
        );
    }
}

#[cfg(not(unix))]
fn signal_interrupt(_pid: u32, sandbox_id: SandboxId) {
    warn!(
        "[KERNEL] Sandbox {}: interrupts are not supported on this platform",
        sandbox_id
    );
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("[KERNEL] Failed to kill process group {}: {}", pid, e),
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
