//! Peer subprocess management.
//!
//! A peer is an external runtime spawned with piped stdio; the link runs
//! over its stdin/stdout with length-prefixed frames. The child side of
//! the same arrangement is [`over_stdio`].

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::dispatch::HandlerRegistry;
use crate::link::{CallHandle, Link, LinkConfig};

/// How long [`Peer::shutdown`] waits for the child to exit on its own
/// after stdin closes, before killing it.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// A spawned peer process with a live link over its stdio.
pub struct Peer {
    child: Child,
    link: Link,
}

impl Peer {
    /// Spawns `command` with piped stdin/stdout and starts a link over
    /// them. Stderr is inherited so the child's diagnostics land in the
    /// parent's stream.
    pub fn spawn(
        mut command: Command,
        registry: Arc<HandlerRegistry>,
        config: LinkConfig,
    ) -> io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command.spawn()?;
        tracing::info!(pid = child.id(), "spawned peer process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("peer stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("peer stdout not captured"))?;

        let link = Link::spawn(stdout, stdin, registry, config);
        Ok(Self { child, link })
    }

    pub fn handle(&self) -> CallHandle {
        self.link.handle()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the child to exit on its own.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Closes the link (the child sees EOF on stdin) and waits for it to
    /// exit, killing it after a grace period.
    pub async fn shutdown(mut self) -> io::Result<ExitStatus> {
        self.link.shutdown().await;
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!("peer did not exit after stdin closed, killing");
                self.child.start_kill()?;
                self.child.wait().await
            }
        }
    }
}

/// Runs a link over this process's own stdin/stdout, the child side of
/// [`Peer::spawn`]. The returned link ends when the parent closes the pipe.
pub fn over_stdio(registry: Arc<HandlerRegistry>, config: LinkConfig) -> Link {
    Link::spawn(tokio::io::stdin(), tokio::io::stdout(), registry, config)
}
