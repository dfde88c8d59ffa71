//! Process-level event plumbing: signals and the stop/reload interests.
//!
//! User code registers interest in reload or stop and receives a
//! broadcast when the matching signal arrives: `SIGHUP` raises reload,
//! `SIGINT` raises stop. `SIGPIPE` is ignored (a peer closing mid-write
//! is an errno, not a process killer) and the file-descriptor soft limit
//! is raised to the hard limit at startup, since every proxied connection
//! costs two sockets.

use anyhow::Result;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Reload,
    Stop,
}

#[derive(Clone)]
pub struct EventSystem {
    reload: broadcast::Sender<()>,
    stop: broadcast::Sender<()>,
}

impl EventSystem {
    pub fn new() -> Result<Self> {
        raise_fd_limit();
        ignore_sigpipe();
        let (reload, _) = broadcast::channel(4);
        let (stop, _) = broadcast::channel(4);
        Ok(Self { reload, stop })
    }

    pub fn subscribe(&self, interest: Interest) -> broadcast::Receiver<()> {
        match interest {
            Interest::Reload => self.reload.subscribe(),
            Interest::Stop => self.stop.subscribe(),
        }
    }

    /// Raise the stop interest programmatically (tests, fatal setup
    /// errors).
    pub fn trigger_stop(&self) {
        let _ = self.stop.send(());
    }

    /// Translate process signals into interest broadcasts until stop.
    pub async fn drive_signals(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGHUP handler");
                return;
            }
        };
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    tracing::info!("SIGHUP: running reload handlers");
                    let _ = self.reload.send(());
                }
                _ = interrupt.recv() => {
                    tracing::info!("SIGINT: running stop handlers");
                    let _ = self.stop.send(());
                    return;
                }
            }
        }
    }
}

fn raise_fd_limit() {
    unsafe {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 && rlim.rlim_cur < rlim.rlim_max {
            rlim.rlim_cur = rlim.rlim_max;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) != 0 {
                tracing::warn!("could not raise file descriptor limit");
            }
        }
    }
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_interest_reaches_all_subscribers() {
        let events = EventSystem::new().unwrap();
        let mut a = events.subscribe(Interest::Stop);
        let mut b = events.subscribe(Interest::Stop);
        events.trigger_stop();
        a.recv().await.unwrap();
        b.recv().await.unwrap();
    }

    #[tokio::test]
    async fn interests_are_independent() {
        let events = EventSystem::new().unwrap();
        let mut reload = events.subscribe(Interest::Reload);
        events.trigger_stop();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), reload.recv())
                .await
                .is_err(),
            "stop must not wake reload subscribers"
        );
    }
}
