//! Process supervisor - locates, spawns and terminates the worker.
//!
//! The engine only sees a [`WorkerIo`]: three byte streams plus a
//! [`WorkerProcess`] handle. [`ProcessSpawner`] produces one from a real child
//! process; tests inject in-memory pipes through the same [`WorkerSpawner`] seam.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::{BridgeError, StartupError};

/// Environment variable overriding the environment-local worker program.
pub const PYTHON_ENV: &str = "RAG_ENGINE_PYTHON";

/// Why the worker is no longer usable. Exactly one is recorded per bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// `stop()` was called (or every bridge handle was dropped).
    Stopped,
    /// The process exited on its own.
    Exited { exit_code: Option<i32> },
    /// stdout reached end-of-stream while the process kept running.
    OutputClosed,
    /// Reading or writing the worker's streams failed.
    Transport(String),
}

impl Termination {
    /// Failure delivered to every swept caller.
    pub fn to_error(&self) -> BridgeError {
        match self {
            Self::Stopped => BridgeError::EngineStopped,
            Self::Exited { exit_code } => BridgeError::EngineTerminated {
                exit_code: *exit_code,
                reason: "worker exited".to_string(),
            },
            Self::OutputClosed => BridgeError::EngineTerminated {
                exit_code: None,
                reason: "worker closed its output stream".to_string(),
            },
            Self::Transport(reason) => BridgeError::EngineTerminated {
                exit_code: None,
                reason: format!("transport error: {reason}"),
            },
        }
    }

    /// Failure reported by `start()` when this happens before the handshake.
    pub fn to_startup_error(&self) -> StartupError {
        match self {
            Self::Stopped => StartupError::Stopped,
            Self::Exited { exit_code } => StartupError::Exited {
                exit_code: *exit_code,
            },
            Self::OutputClosed => {
                StartupError::Transport("worker closed its output stream".to_string())
            }
            Self::Transport(reason) => StartupError::Transport(reason.clone()),
        }
    }
}

pub type WorkerInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to a running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for exit. Must be cancel safe.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the worker to exit (SIGTERM on Unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcibly kill and reap the worker.
    async fn kill(&mut self) -> io::Result<()>;
}

/// A spawned worker with its standard streams detached.
pub struct WorkerIo {
    pub stdin: WorkerInput,
    pub stdout: WorkerOutput,
    pub stderr: Option<WorkerOutput>,
    pub process: Box<dyn WorkerProcess>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerIo, StartupError>;
}

/// [`WorkerProcess`] backed by a tokio child process.
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // Already reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Where the resolved worker program came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramSource {
    /// Environment-local program (e.g. the engine's virtualenv interpreter).
    Local,
    /// System-wide default resolved on `PATH`.
    System,
}

/// Fully resolved command line for the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub source: ProgramSource,
}

/// Worker discovery settings.
///
/// Prefers the environment-local program when it exists, otherwise resolves
/// the system default. Fails with a setup error when neither is present.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLocator {
    local_program: Option<PathBuf>,
    system_program: PathBuf,
    script: Option<PathBuf>,
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl WorkerLocator {
    /// Run `program` (resolved on `PATH` when it has no directory part).
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            local_program: None,
            system_program: program.into(),
            script: None,
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// `<engine_dir>/main.py` run by the engine's virtualenv interpreter,
    /// falling back to `python3`.
    pub fn python_engine(engine_dir: impl AsRef<Path>) -> Self {
        let dir = engine_dir.as_ref();
        Self::program("python3")
            .with_local_program(local_python(dir))
            .with_script(dir.join("main.py"))
            .with_working_dir(dir)
            .with_env("PYTHONUNBUFFERED", "1")
    }

    pub fn with_local_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.local_program = Some(program.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Apply `RAG_ENGINE_PYTHON` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(program) = lookup(PYTHON_ENV).filter(|p| !p.trim().is_empty()) {
            tracing::debug!(program = %program, "Worker program overridden by {}", PYTHON_ENV);
            self.local_program = Some(PathBuf::from(program));
        }
        self
    }

    pub fn locate(&self) -> Result<WorkerCommand, StartupError> {
        self.locate_in(std::env::var_os("PATH"))
    }

    /// Resolve against an explicit `PATH` value.
    pub fn locate_in(&self, search_path: Option<OsString>) -> Result<WorkerCommand, StartupError> {
        if let Some(script) = &self.script
            && !script.is_file()
        {
            return Err(StartupError::ScriptNotFound(script.clone()));
        }

        let mut searched = Vec::new();
        let resolved = match &self.local_program {
            Some(local) if local.is_file() => Some((local.clone(), ProgramSource::Local)),
            Some(local) => {
                searched.push(local.clone());
                None
            }
            None => None,
        };
        let (program, source) = match resolved {
            Some(found) => found,
            None => match resolve_program(&self.system_program, search_path) {
                Some(path) => (path, ProgramSource::System),
                None => {
                    searched.push(self.system_program.clone());
                    return Err(StartupError::WorkerNotFound { searched });
                }
            },
        };

        let mut args = Vec::with_capacity(self.args.len() + 1);
        if let Some(script) = &self.script {
            args.push(script.clone().into_os_string());
        }
        args.extend(self.args.iter().cloned());

        Ok(WorkerCommand {
            program,
            args,
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            source,
        })
    }
}

fn local_python(dir: &Path) -> PathBuf {
    if cfg!(windows) {
        dir.join(".venv").join("Scripts").join("python.exe")
    } else {
        dir.join(".venv").join("bin").join("python")
    }
}

fn resolve_program(program: &Path, search_path: Option<OsString>) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let search_path = search_path?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Spawns the worker as a child process with piped standard streams.
pub struct ProcessSpawner {
    locator: WorkerLocator,
}

impl ProcessSpawner {
    pub fn new(locator: WorkerLocator) -> Self {
        Self { locator }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<WorkerIo, StartupError> {
        let command = self.locator.locate()?;
        tracing::info!(
            program = %command.program.display(),
            source = ?command.source,
            "Spawning worker subprocess"
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| StartupError::Spawn {
            program: command.program.clone(),
            reason: e.to_string(),
        })?;

        let missing = |stream: &str| StartupError::Spawn {
            program: command.program.clone(),
            reason: format!("{stream} not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();

        tracing::debug!(pid = ?child.id(), "Worker spawned");
        Ok(WorkerIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as WorkerOutput),
            process: Box::new(ChildProcess::new(child)),
        })
    }
}
