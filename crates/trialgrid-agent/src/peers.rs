//! Peer latency prober.
//!
//! Every tick the prober connects to the authority's server address and
//! then to every known peer node, and reports the TCP connect round-trip
//! in milliseconds. Unreachable peers are reported as `None`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use trialgrid_sync::NodeController;

use crate::error::AgentResult;

/// Peer id the server's latency is reported under.
pub const SERVER_PEER_ID: &str = "server";

/// Round-trip of a TCP connect to `address` in milliseconds.
pub async fn measure_latency(address: &str, timeout: Duration) -> Option<f64> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Some(start.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => {
            debug!(%address, error = %e, "peer unreachable");
            None
        }
        Err(_) => {
            debug!(%address, "peer connect timed out");
            None
        }
    }
}

pub struct PeerProber {
    controller: Arc<dyn NodeController>,
    server_address: Option<String>,
    interval: Duration,
    timeout: Duration,
}

impl PeerProber {
    pub fn new(controller: Arc<dyn NodeController>, server_address: Option<String>, interval: Duration) -> Self {
        Self {
            controller,
            server_address,
            interval,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe the server, then every peer. Returns how many were reached.
    pub async fn probe_once(&self) -> AgentResult<usize> {
        let mut reached = 0;
        if let Some(address) = &self.server_address {
            let latency = measure_latency(address, self.timeout).await;
            reached += latency.is_some() as usize;
            self.controller.set_peer_connection(SERVER_PEER_ID, latency).await?;
        }
        for peer in self.controller.peers().await? {
            let latency = measure_latency(&peer.address, self.timeout).await;
            reached += latency.is_some() as usize;
            self.controller.set_peer_connection(&peer.id, latency).await?;
        }
        Ok(reached)
    }

    /// Probe every `interval` until shutdown. Probes never overlap.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "peer prober started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.probe_once().await {
                        Ok(reached) => debug!(reached, "peers probed"),
                        Err(e) => warn!(error = %e, "peer probe failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("peer prober stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn listening_peer_has_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let latency = measure_latency(&address, Duration::from_secs(1)).await;
        assert!(latency.is_some_and(|ms| ms >= 0.0));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        assert!(measure_latency(&address, Duration::from_secs(1)).await.is_none());
    }
}
