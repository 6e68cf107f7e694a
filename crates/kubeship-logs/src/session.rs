//! Supervised tail sessions
//!
//! A session owns one log file for as long as it runs. Each attempt (stat,
//! pod lookup, opt-in check, follow and forward) runs as its own task so a
//! panic is caught at the task boundary. The supervisor then restarts the
//! attempt on the same path while still holding the registry claim.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::follower::{FollowConfig, FollowError, LogFollower};
use crate::parser::LogParser;
use crate::registry::ManagedFileRegistry;
use kubeship_gelf::{ForwardError, MessageForwarder};
use kubeship_k8s::{PodLookup, ResolveError};
use kubeship_types::{LogFilePath, OptInPolicy, PodIdentity, SessionState};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Which pods are shipped
    pub opt_in: OptInPolicy,

    /// Pause before restarting after a lookup failure or a panic
    pub restart_delay: Duration,

    pub follow: FollowConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            opt_in: OptInPolicy::default(),
            restart_delay: Duration::from_secs(1),
            follow: FollowConfig::default(),
        }
    }
}

/// Why a session ended for good
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The path is a directory
    Directory,
    /// The path could not be stat'ed
    StatFailed,
    /// The file name does not name a pod
    NotContainerLog,
    /// The pod has not opted into shipping
    NotOptedIn,
    /// The file could not be opened for reading
    Unreadable,
    /// Another session already manages the path
    AlreadyManaged,
    /// Shutdown was requested
    Shutdown,
    /// The forwarding channel has no consumer anymore
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to resolve pod {pod}: {source}")]
    Resolve {
        pod: PodIdentity,
        #[source]
        source: ResolveError,
    },

    #[error(transparent)]
    Follow(#[from] FollowError),

    #[error("session attempt panicked: {0}")]
    Panicked(String),

    #[error("session attempt was aborted")]
    Aborted,
}

/// Everything a session shares with the rest of the daemon
pub struct SessionContext<L, F> {
    pub lookup: Arc<L>,
    pub forwarder: Arc<F>,
    pub registry: ManagedFileRegistry,
    pub config: Arc<SessionConfig>,
    pub cancel: CancellationToken,
}

impl<L, F> SessionContext<L, F> {
    pub fn new(
        lookup: Arc<L>,
        forwarder: Arc<F>,
        registry: ManagedFileRegistry,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lookup,
            forwarder,
            registry,
            config: Arc::new(config),
            cancel,
        }
    }
}

impl<L, F> Clone for SessionContext<L, F> {
    fn clone(&self) -> Self {
        Self {
            lookup: Arc::clone(&self.lookup),
            forwarder: Arc::clone(&self.forwarder),
            registry: self.registry.clone(),
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
        }
    }
}

/// Tails one log file and forwards its lines until stopped
pub struct TailSession<L, F> {
    path: LogFilePath,
    ctx: SessionContext<L, F>,
    state: Arc<watch::Sender<SessionState>>,
}

/// Spawn a session for `path` on the runtime
pub fn spawn_session<L, F>(path: LogFilePath, ctx: SessionContext<L, F>) -> JoinHandle<StopReason>
where
    L: PodLookup + 'static,
    F: MessageForwarder + 'static,
{
    tokio::spawn(TailSession::new(path, ctx).run())
}

impl<L, F> TailSession<L, F>
where
    L: PodLookup + 'static,
    F: MessageForwarder + 'static,
{
    pub fn new(path: LogFilePath, ctx: SessionContext<L, F>) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            path,
            ctx,
            state: Arc::new(state),
        }
    }

    /// Watch the session's state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run the session to completion
    pub async fn run(self) -> StopReason {
        let span = info_span!("session", path = %self.path);
        self.supervise().instrument(span).await
    }

    async fn supervise(self) -> StopReason {
        match tokio::fs::metadata(self.path.as_path()).await {
            Ok(metadata) if metadata.is_dir() => {
                debug!("skipping directory");
                return self.stop(StopReason::Directory);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "cannot stat log file");
                return self.stop(StopReason::StatFailed);
            }
        }

        let Some(_claim) = self.ctx.registry.try_manage(&self.path) else {
            debug!("file is already managed");
            return self.stop(StopReason::AlreadyManaged);
        };

        loop {
            self.state.send_replace(SessionState::Starting);

            let task = tokio::spawn(
                attempt(self.path.clone(), self.ctx.clone(), Arc::clone(&self.state))
                    .in_current_span(),
            );
            let _abort = AbortOnDrop(task.abort_handle());

            let delay = match task.await {
                Ok(Ok(reason)) => return self.stop(reason),
                Ok(Err(SessionError::Follow(e))) => {
                    warn!(error = %e, "follower failed, restarting");
                    None
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "session attempt failed");
                    Some(self.ctx.config.restart_delay)
                }
                Err(e) => match attempt_failure(e) {
                    SessionError::Aborted => {
                        debug!("session attempt aborted");
                        return self.stop(StopReason::Shutdown);
                    }
                    e => {
                        error!(error = %e, "recovered from panic");
                        Some(self.ctx.config.restart_delay)
                    }
                },
            };

            self.state.send_replace(SessionState::Failed);
            if let Some(delay) = delay {
                tokio::select! {
                    biased;
                    _ = self.ctx.cancel.cancelled() => return self.stop(StopReason::Shutdown),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.ctx.cancel.is_cancelled() {
                return self.stop(StopReason::Shutdown);
            }

            self.state.send_replace(SessionState::Restarting);
            info!("restarting session");
        }
    }

    fn stop(&self, reason: StopReason) -> StopReason {
        self.state.send_replace(SessionState::Stopped);
        debug!(?reason, "session stopped");
        reason
    }
}

/// One pass through the session lifecycle
async fn attempt<L, F>(
    path: LogFilePath,
    ctx: SessionContext<L, F>,
    state: Arc<watch::Sender<SessionState>>,
) -> Result<StopReason, SessionError>
where
    L: PodLookup,
    F: MessageForwarder,
{
    if ctx.cancel.is_cancelled() {
        return Ok(StopReason::Shutdown);
    }

    match tokio::fs::metadata(path.as_path()).await {
        Ok(metadata) if metadata.is_dir() => return Ok(StopReason::Directory),
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "cannot stat log file");
            return Ok(StopReason::StatFailed);
        }
    }

    let Some(identity) = path.identity() else {
        debug!("file name does not identify a pod");
        return Ok(StopReason::NotContainerLog);
    };

    state.send_replace(SessionState::Resolving);
    let pod = ctx
        .lookup
        .resolve(&identity.name, &identity.namespace)
        .await
        .map_err(|source| SessionError::Resolve {
            pod: identity.clone(),
            source,
        })?;

    if !ctx.config.opt_in.allows(&pod) {
        info!(pod = %identity, "pod has not opted into log shipping");
        return Ok(StopReason::NotOptedIn);
    }

    let mut follower = match LogFollower::open(path.as_path(), ctx.config.follow.clone()).await {
        Ok(follower) => follower,
        Err(e) => {
            warn!(error = %e, "cannot open log file");
            return Ok(StopReason::Unreadable);
        }
    };

    let host = pod.host().to_string();
    state.send_replace(SessionState::Tailing);
    info!(pod = %identity, %host, "tailing log file");

    while let Some(raw) = follower.next_line(&ctx.cancel).await? {
        let message = match LogParser::to_gelf_json(&raw, &host) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "skipping line");
                continue;
            }
        };

        match ctx.forwarder.push(message, &ctx.cancel).await {
            Ok(()) => {}
            Err(ForwardError::Closed) => return Ok(StopReason::ChannelClosed),
            Err(ForwardError::Cancelled) => return Ok(StopReason::Shutdown),
        }
    }

    Ok(StopReason::Shutdown)
}

/// Aborts the attempt task if the supervisor itself goes away
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn attempt_failure(e: JoinError) -> SessionError {
    match e.try_into_panic() {
        Ok(payload) => SessionError::Panicked(panic_message(payload.as_ref())),
        Err(_) => SessionError::Aborted,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
