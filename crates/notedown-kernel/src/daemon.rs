//! Client side of the kernel daemon.
//!
//! Requests for the same input are serialized by a per-key async mutex.
//! Across processes the transport file is the only coordination: a kernel
//! that cannot be reached is assumed dead and its file removed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use notedown::Notebook;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::{ExecuteOptions, Keepalive, KernelConfig};
use crate::connection::KernelStream;
use crate::error::KernelError;
use crate::framing::FrameReader;
use crate::launcher::KernelLauncher;
use crate::protocol::{Request, Response, ResponseKind};
use crate::transport::{
    read_transport_file, remove_transport_file, transport_file, transport_key, KernelTransport,
};

/// Upper bound on kernel-initiated restarts within one execution.
pub const MAX_RESTARTS: u32 = 8;

const READ_CHUNK: usize = 8192;

/// Extension of the notebook written next to a non-notebook input.
const EXECUTION_NOTEBOOK_EXT: &str = "notedown.ipynb";

enum Outcome {
    Done,
    Restart,
}

pub struct KernelDaemon {
    config: KernelConfig,
    launcher: Arc<dyn KernelLauncher>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KernelDaemon {
    pub fn new(config: KernelConfig, launcher: Arc<dyn KernelLauncher>) -> Self {
        Self {
            config,
            launcher,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Transport file of the kernel serving `input`.
    pub fn transport_file(&self, input: &Path) -> PathBuf {
        transport_file(&self.config.runtime_dir, input)
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop the lock for `key` once nobody else holds or waits on it.
    /// The caller must have dropped its own handle first.
    fn release_lock(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    /// Connect to the kernel for `input`, launching one if none is running.
    pub async fn connect_or_start(
        &self,
        input: &Path,
    ) -> Result<(KernelStream, KernelTransport), KernelError> {
        self.connect_or_start_with(input, self.config.keepalive).await
    }

    async fn connect_or_start_with(
        &self,
        input: &Path,
        keepalive: Keepalive,
    ) -> Result<(KernelStream, KernelTransport), KernelError> {
        let path = self.transport_file(input);
        match self.connect_transport(&path).await {
            Ok(Some(connected)) => return Ok(connected),
            Ok(None) => {}
            Err(KernelError::StaleTransport(stale)) => {
                debug!(
                    "[kernel-client] Removed stale transport {}, starting a new kernel",
                    stale.display()
                );
            }
            Err(e) => return Err(e),
        }

        fs::create_dir_all(&self.config.runtime_dir)?;
        let log = self.config.ensure_log_file()?;

        info!("[kernel-client] Starting kernel for {}", input.display());
        let mut options = Map::new();
        options.insert(
            "transport".into(),
            Value::String(path.to_string_lossy().into_owned()),
        );
        options.insert("timeout".into(), keepalive.timeout_secs().into());
        options.insert("type".into(), "tcp".into());
        options.insert("debug".into(), self.config.debug.into());
        options.insert("log".into(), Value::String(log.to_string_lossy().into_owned()));
        self.launcher.start(&Request::start(options)).await?;

        for attempt in 1..=self.config.connect_attempts {
            tokio::time::sleep(self.config.poll_interval * attempt).await;
            let Some(transport) = read_transport_file(&path)? else {
                continue;
            };
            return match KernelStream::connect(&transport).await {
                Ok(stream) => {
                    debug!("[kernel-client] Connected after {} polls", attempt);
                    Ok((stream, transport))
                }
                Err(e) => {
                    remove_transport_file(&path)?;
                    Err(KernelError::StartFailed(format!(
                        "unable to connect to kernel for {}: {}",
                        input.display(),
                        e
                    )))
                }
            };
        }

        Err(KernelError::StartFailed(format!(
            "no transport file for {} after {} attempts",
            input.display(),
            self.config.connect_attempts
        )))
    }

    /// Connect through an existing transport file without starting anything.
    /// An unreachable kernel yields `StaleTransport` after its file is removed.
    async fn connect_transport(
        &self,
        path: &Path,
    ) -> Result<Option<(KernelStream, KernelTransport)>, KernelError> {
        let Some(transport) = read_transport_file(path)? else {
            return Ok(None);
        };
        match KernelStream::connect(&transport).await {
            Ok(stream) => Ok(Some((stream, transport))),
            Err(e) => {
                debug!(
                    "[kernel-client] Unable to reach kernel at {}: {}",
                    path.display(),
                    e
                );
                remove_transport_file(path)?;
                Err(KernelError::StaleTransport(path.to_path_buf()))
            }
        }
    }

    /// Execute `input`, passing progress messages to `sink`.
    ///
    /// A kernel `error` message fails with [`KernelError::Execution`] and
    /// leaves the kernel running. A broken connection or stream removes the
    /// transport file, so the next request starts a fresh kernel.
    pub async fn execute(
        &self,
        input: &Path,
        options: &ExecuteOptions,
        sink: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), KernelError> {
        let key = transport_key(input);
        let lock = self.lock_for(&key);
        let guard = lock.lock().await;
        let result = self.execute_locked(input, options, sink).await;
        drop(guard);
        drop(lock);
        self.release_lock(&key);
        result
    }

    async fn execute_locked(
        &self,
        input: &Path,
        options: &ExecuteOptions,
        sink: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), KernelError> {
        let keepalive = options.keepalive.unwrap_or(self.config.keepalive);
        let log = self.config.ensure_log_file()?;
        let request_options = options.to_request_options(input, log)?;

        if keepalive == Keepalive::OneShot {
            self.abort_locked(input).await?;
            info!("[kernel-client] Executing {} without a daemon", input.display());
            let output = self
                .launcher
                .run_oneshot(&Request::execute("", request_options))
                .await?;
            if !output.is_empty() {
                sink(&output);
            }
            return Ok(());
        }

        if options.restart {
            self.abort_locked(input).await?;
        }

        let path = self.transport_file(input);
        let mut restarts = 0;
        loop {
            let (stream, transport) = self.connect_or_start_with(input, keepalive).await?;
            let request = Request::execute(transport.secret.as_str(), request_options.clone());
            match run_request(stream, &request, &mut *sink).await {
                Ok(Outcome::Done) => return Ok(()),
                Ok(Outcome::Restart) => {
                    restarts += 1;
                    if restarts > MAX_RESTARTS {
                        return Err(KernelError::TooManyRestarts(MAX_RESTARTS));
                    }
                    info!("[kernel-client] Kernel requested restart ({})", restarts);
                }
                Err(e @ KernelError::Execution(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "[kernel-client] Request for {} failed: {}",
                        input.display(),
                        e
                    );
                    if let Err(remove) = remove_transport_file(&path) {
                        warn!("[kernel-client] Unable to remove transport file: {}", remove);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Shut down the kernel for `input`, if there is one. Never starts a
    /// kernel; the transport file is gone afterwards either way.
    pub async fn abort(&self, input: &Path) -> Result<(), KernelError> {
        let key = transport_key(input);
        let lock = self.lock_for(&key);
        let guard = lock.lock().await;
        let result = self.abort_locked(input).await;
        drop(guard);
        drop(lock);
        self.release_lock(&key);
        result
    }

    async fn abort_locked(&self, input: &Path) -> Result<(), KernelError> {
        let path = self.transport_file(input);
        let (mut stream, transport) = match self.connect_transport(&path).await {
            Ok(Some(connected)) => connected,
            Ok(None) | Err(KernelError::StaleTransport(_)) => {
                debug!("[kernel-client] No running kernel for {}", input.display());
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!("[kernel-client] Aborting kernel for {}", input.display());
        let line = Request::abort(transport.secret).to_line()?;
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            warn!("[kernel-client] Abort request failed: {}", e);
        } else if let Err(e) = stream.shutdown().await {
            debug!("[kernel-client] Shutdown after abort failed: {}", e);
        }
        remove_transport_file(&path)
    }

    /// Execute `notebook` as the notebook for `input` and return the executed
    /// copy. A notebook input is executed in place; anything else gets a
    /// temporary notebook next to it.
    pub async fn execute_notebook(
        &self,
        input: &Path,
        notebook: Notebook,
        options: &ExecuteOptions,
        sink: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Notebook, KernelError> {
        let in_place = input.extension().is_some_and(|ext| ext == "ipynb");
        let notebook_path = if in_place {
            input.to_path_buf()
        } else {
            input.with_extension(EXECUTION_NOTEBOOK_EXT)
        };
        fs::write(&notebook_path, notebook.to_ipynb_string()?)?;

        let options = ExecuteOptions {
            notebook: Some(notebook_path.clone()),
            ..options.clone()
        };
        let executed = match self.execute(input, &options, sink).await {
            Ok(()) => fs::read_to_string(&notebook_path)
                .map_err(KernelError::from)
                .and_then(|json| Notebook::from_ipynb_str(&json).map_err(KernelError::from)),
            Err(e) => Err(e),
        };

        if !in_place {
            if let Err(e) = fs::remove_file(&notebook_path) {
                warn!(
                    "[kernel-client] Unable to remove {}: {}",
                    notebook_path.display(),
                    e
                );
            }
        }
        executed
    }
}

async fn run_request(
    mut stream: KernelStream,
    request: &Request,
    sink: &mut (dyn FnMut(&str) + Send),
) -> Result<Outcome, KernelError> {
    stream.write_all(request.to_line()?.as_bytes()).await?;
    stream.flush().await?;

    let mut frames = FrameReader::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for response in frames.feed(&buf[..n])? {
            if let Some(outcome) = handle_response(response, sink)? {
                return Ok(outcome);
            }
        }
    }

    match frames.finish()? {
        Some(response) => Ok(handle_response(response, sink)?.unwrap_or(Outcome::Done)),
        None => Ok(Outcome::Done),
    }
}

fn handle_response(
    response: Response,
    sink: &mut (dyn FnMut(&str) + Send),
) -> Result<Option<Outcome>, KernelError> {
    match response.kind {
        ResponseKind::Data => {
            sink(&response.data);
            Ok(None)
        }
        ResponseKind::Error => Err(KernelError::Execution(response.data)),
        ResponseKind::Restart => Ok(Some(Outcome::Restart)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::launcher::ProcessLauncher;
    use tempfile::TempDir;

    fn daemon(temp_dir: &TempDir) -> KernelDaemon {
        let config = KernelConfig::default()
            .with_runtime_dir(temp_dir.path().join("jt"))
            .with_log_file(temp_dir.path().join("kernel.log"))
            .with_keepalive(Keepalive::OneShot);
        KernelDaemon::new(config, Arc::new(ProcessLauncher::new("cat")))
    }

    fn lock_count(daemon: &KernelDaemon) -> usize {
        daemon.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_locks_are_released_after_requests() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = daemon(&temp_dir);

        for name in ["a.qmd", "b.qmd", "c.qmd"] {
            let input = temp_dir.path().join(name);
            let mut output = String::new();
            let mut sink = |text: &str| output.push_str(text);
            daemon
                .execute(&input, &ExecuteOptions::default(), &mut sink)
                .await
                .unwrap();
            assert!(output.contains("\"command\":\"execute\""));
            daemon.abort(&input).await.unwrap();
        }
        assert_eq!(lock_count(&daemon), 0);
    }

    #[tokio::test]
    async fn test_held_lock_is_kept() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = daemon(&temp_dir);
        let input = temp_dir.path().join("doc.qmd");
        let key = transport_key(&input);

        let held = daemon.lock_for(&key);
        daemon.abort(&input).await.unwrap();
        assert_eq!(lock_count(&daemon), 1);

        drop(held);
        daemon.release_lock(&key);
        assert_eq!(lock_count(&daemon), 0);
    }
}
