//! Starting kernel processes.
//!
//! The daemon client never spawns kernels itself; it goes through a
//! [`KernelLauncher`], so tests can stand in an in-process fake.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use log::{debug, info};
use tokio::io::AsyncWriteExt;

use crate::error::KernelError;
use crate::protocol::Request;

const MPL_BACKEND_ENV: &str = "MPLBACKEND";
const INLINE_MPL_BACKEND: &str = "module://matplotlib_inline.backend_inline";

pub trait KernelLauncher: Send + Sync {
    /// Launch a kernel for a `start` request. Returns once the launcher
    /// process has handed off; the kernel writes its transport file to
    /// `request.options.transport` when it is ready.
    fn start<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<(), KernelError>>;

    /// Run one `execute` request in a process that exits afterwards, and
    /// return what it printed.
    fn run_oneshot<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<String, KernelError>>;
}

/// Launches kernels by running a program and writing the request line to
/// its stdin.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// A Python interpreter running a kernel driver script. Matplotlib is
    /// pinned to the inline backend so an inherited GUI backend never opens
    /// windows.
    pub fn python(python: impl Into<PathBuf>, script: impl AsRef<Path>) -> Self {
        Self::new(python)
            .arg(script.as_ref())
            .env("PYDEVD_DISABLE_FILE_VALIDATION", "1")
            .env(MPL_BACKEND_ENV, INLINE_MPL_BACKEND)
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn run(&self, request: &Request, stdout: Stdio) -> Result<Vec<u8>, KernelError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        debug!(
            "[kernel-client] Running {} for {:?} request",
            self.program.display(),
            request.command
        );
        let mut child = cmd.spawn().map_err(|e| {
            KernelError::StartFailed(format!("{}: {}", self.program.display(), e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(request.to_line()?.as_bytes()).await {
                Ok(()) => {}
                // The process may exit without reading its input.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("[kernel-client] {} closed stdin early", self.program.display());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(KernelError::StartFailed(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }
        Ok(output.stdout)
    }
}

impl KernelLauncher for ProcessLauncher {
    fn start<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<(), KernelError>> {
        Box::pin(async move {
            info!("[kernel-client] Starting kernel");
            self.run(request, Stdio::null()).await.map(|_| ())
        })
    }

    fn run_oneshot<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<String, KernelError>> {
        Box::pin(async move {
            let stdout = self.run(request, Stdio::piped()).await?;
            Ok(String::from_utf8_lossy(&stdout).into_owned())
        })
    }
}
