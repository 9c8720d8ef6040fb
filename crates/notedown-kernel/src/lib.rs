//! notedown-kernel - Client for long-lived notebook kernels.
//!
//! A kernel is started once per input document and found again through a
//! transport file in the runtime directory. Requests and responses are
//! newline-delimited JSON over TCP (or a Unix socket when the transport file
//! names a path). See [`KernelDaemon`] for the request lifecycle.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod framing;
pub mod launcher;
pub mod protocol;
pub mod transport;

pub use config::{ExecuteOptions, KernelConfig, Keepalive};
pub use daemon::KernelDaemon;
pub use error::KernelError;
pub use framing::FrameReader;
pub use launcher::{KernelLauncher, ProcessLauncher};
pub use protocol::{Command, Request, Response, ResponseKind};
pub use transport::{KernelTransport, TransportAddress};
