//! Tunnel orchestration
//!
//! The forwarder resolves every tunnel to its session by name and runs one
//! [`TunnelRunner`] per tunnel on its own task. A tunnel whose session is
//! unknown is skipped; a runner that fails ends only its own tunnel.

use crate::error::ForwardError;
use crate::runner::{TunnelRunner, TunnelState};
use portferry_proto::TunnelSpec;
use portferry_transport::SessionMap;
use std::fmt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct Forwarder {
    sessions: SessionMap,
}

impl Forwarder {
    pub fn new(sessions: SessionMap) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    /// Dispatch one runner per resolvable tunnel and return immediately
    pub fn spawn(&self, tunnels: impl IntoIterator<Item = TunnelSpec>) -> ForwarderHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handle = ForwarderHandle {
            tunnels: Vec::new(),
            skipped: Vec::new(),
            shutdown: shutdown_tx,
            tasks: JoinSet::new(),
            report: ForwardReport::default(),
        };

        for spec in tunnels {
            let Some(session) = self.sessions.get(&spec.session_name) else {
                let error = ForwardError::UnknownSession {
                    session: spec.session_name.clone(),
                    tunnel: spec.to_string(),
                };
                warn!(tunnel = %spec, error = %error, "Skipping tunnel");
                handle.skipped.push(SkippedTunnel { spec, error });
                continue;
            };

            let runner = TunnelRunner::new(spec.clone(), session.clone(), shutdown_rx.clone());
            let index = handle.tunnels.len();
            handle.tunnels.push(TunnelHandle {
                spec,
                state: runner.subscribe(),
            });
            handle
                .tasks
                .spawn(async move { (index, runner.run().await) });
        }

        handle.report.dispatched = handle.tunnels.len();
        handle.report.skipped = handle.skipped.len();
        info!(
            dispatched = handle.report.dispatched,
            skipped = handle.report.skipped,
            "Tunnels dispatched"
        );
        handle
    }

    /// Dispatch the tunnels and wait until every runner has stopped
    pub async fn start(&self, tunnels: impl IntoIterator<Item = TunnelSpec>) -> ForwardReport {
        self.spawn(tunnels).wait().await
    }

    /// Close every session; reverse listeners on them end
    pub async fn close_sessions(&self) {
        for (name, session) in &self.sessions {
            if !session.is_closed() {
                info!(server = %name, "Closing session");
            }
            session.close().await;
        }
    }
}

/// A dispatched tunnel and its live state
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    pub spec: TunnelSpec,
    pub state: watch::Receiver<TunnelState>,
}

impl TunnelHandle {
    pub fn current_state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Wait until the runner leaves `Starting`
    ///
    /// Returns the listening address, or `None` if the runner stopped first.
    pub async fn listening(&self) -> Option<String> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, TunnelState::Starting))
            .await;

        match settled.as_deref() {
            Ok(TunnelState::Listening { address }) => Some(address.clone()),
            _ => None,
        }
    }
}

/// A tunnel that was never dispatched
#[derive(Debug)]
pub struct SkippedTunnel {
    pub spec: TunnelSpec,
    pub error: ForwardError,
}

/// Outcome of a forwarder run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub dispatched: usize,
    pub skipped: usize,
    /// Runners that ended with an error or panicked
    pub failed: usize,
    /// Runners that stopped cleanly on shutdown
    pub stopped: usize,
}

impl fmt::Display for ForwardReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} dispatched, {} skipped, {} failed, {} stopped",
            self.dispatched, self.skipped, self.failed, self.stopped
        )
    }
}

/// Running tunnels of one [`Forwarder::spawn`] call
///
/// Dropping the handle aborts every runner.
pub struct ForwarderHandle {
    tunnels: Vec<TunnelHandle>,
    skipped: Vec<SkippedTunnel>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<(usize, Result<(), ForwardError>)>,
    report: ForwardReport,
}

impl ForwarderHandle {
    pub fn tunnels(&self) -> &[TunnelHandle] {
        &self.tunnels
    }

    pub fn skipped(&self) -> &[SkippedTunnel] {
        &self.skipped
    }

    /// Ask every runner to stop accepting; in-flight relays continue
    pub fn shutdown(&self) {
        info!("Stopping all tunnels");
        self.shutdown.send_replace(true);
    }

    /// Wait for every runner to finish
    ///
    /// Runner errors are logged here and counted, never propagated. Safe to
    /// cancel and call again: runners already joined stay counted.
    pub async fn wait(&mut self) -> ForwardReport {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => self.report.stopped += 1,
                Ok((index, Err(e))) => {
                    if let Some(tunnel) = self.tunnels.get(index) {
                        error!(tunnel = %tunnel.spec, error = %e, "Tunnel failed");
                    }
                    self.report.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Tunnel task panicked");
                    self.report.failed += 1;
                }
            }
        }

        info!(report = %self.report, "All tunnels finished");
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let report = ForwardReport {
            dispatched: 3,
            skipped: 1,
            failed: 0,
            stopped: 3,
        };
        assert_eq!(
            report.to_string(),
            "3 dispatched, 1 skipped, 0 failed, 3 stopped"
        );
    }

    #[tokio::test]
    async fn test_every_tunnel_skipped_without_sessions() {
        let forwarder = Forwarder::new(SessionMap::new());
        let mut handle = forwarder.spawn(vec![
            TunnelSpec::forward("gw", "127.0.0.1:0", "10.0.0.5:80"),
            TunnelSpec::reverse("gw", "0.0.0.0:2222", "127.0.0.1:22"),
        ]);

        assert!(handle.tunnels().is_empty());
        assert_eq!(handle.skipped().len(), 2);
        assert!(matches!(
            handle.skipped()[0].error,
            ForwardError::UnknownSession { .. }
        ));

        let report = handle.wait().await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped, 2);
    }
}
