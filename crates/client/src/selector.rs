//! Candidate probing and node selection.
//!
//! Every configured node is probed with a bare TCP connect; the connection is
//! closed as soon as it is established and no bytes are exchanged. The node
//! with the lowest connect latency wins, ties going to the earlier candidate.
//!
//! Probing is lazy: [`NodeSelector::select_best_node`] only probes when no node
//! is currently selected. Use [`NodeSelector::reprobe`] to force a fresh pass.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::config::{NodeAddress, NodesConfig};
use crate::error::{ClientError, ProbeError, Result};

/// Bind-all address that is retried as loopback when refused.
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Host substituted for [`WILDCARD_HOST`].
pub const LOOPBACK_HOST: &str = "localhost";

/// A node the client may connect to, with its last probe result.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether the last probe succeeded.
    pub reachable: bool,
    /// Round-trip time of the last successful probe or ping.
    pub last_latency: Duration,
}

impl Candidate {
    /// Creates an unprobed candidate.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reachable: false,
            last_latency: Duration::ZERO,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Last latency in seconds.
    pub fn latency_secs(&self) -> f64 {
        self.last_latency.as_secs_f64()
    }
}

impl From<NodeAddress> for Candidate {
    fn from(node: NodeAddress) -> Self {
        Self::new(node.host, node.port)
    }
}

/// Measures reachability of one endpoint.
pub trait Prober: Send + Sync {
    /// Connects to `host:port` and returns the time it took.
    fn probe(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = std::result::Result<Duration, ProbeError>> + Send;
}

/// Probes with a plain TCP connect bounded by a timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    /// Creates a prober with the given per-probe timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Prober for TcpProber {
    async fn probe(&self, host: &str, port: u16) -> std::result::Result<Duration, ProbeError> {
        let started = Instant::now();
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProbeError::TimedOut(self.timeout))??;
        let elapsed = started.elapsed();
        drop(stream);
        Ok(elapsed)
    }
}

/// Index of the reachable candidate with the lowest latency. Ties keep the first.
pub fn pick_best(candidates: &[Candidate]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if !candidate.reachable {
            continue;
        }
        match best {
            Some(current) if candidates[current].last_latency <= candidate.last_latency => {}
            _ => best = Some(index),
        }
    }
    best
}

/// Keeps the candidate list and the current selection.
#[derive(Debug)]
pub struct NodeSelector<P = TcpProber> {
    candidates: Vec<Candidate>,
    selected: Option<usize>,
    prober: P,
}

impl NodeSelector<TcpProber> {
    /// Builds a selector from configuration.
    pub fn from_config(config: &NodesConfig) -> Self {
        Self::new(
            config.candidates.iter().cloned(),
            TcpProber::new(config.probe_timeout()),
        )
    }
}

impl<P: Prober> NodeSelector<P> {
    /// Creates a selector over `nodes` using `prober`.
    pub fn new(nodes: impl IntoIterator<Item = NodeAddress>, prober: P) -> Self {
        Self {
            candidates: nodes.into_iter().map(Candidate::from).collect(),
            selected: None,
            prober,
        }
    }

    /// Returns the selected node, probing first if nothing is selected.
    pub async fn select_best_node(&mut self) -> Result<Candidate> {
        if let Some(candidate) = self.selected() {
            return Ok(candidate.clone());
        }
        self.reprobe().await
    }

    /// Probes every candidate and selects again.
    pub async fn reprobe(&mut self) -> Result<Candidate> {
        self.selected = None;
        self.probe_all().await;

        let index = pick_best(&self.candidates).ok_or(ClientError::NoReachableNode {
            candidates: self.candidates.len(),
        })?;
        self.selected = Some(index);

        let candidate = &self.candidates[index];
        tracing::info!(
            node = %candidate.addr(),
            latency_ms = candidate.last_latency.as_millis() as u64,
            "Selected node"
        );
        Ok(candidate.clone())
    }

    /// Probes every candidate in order, updating reachability and latency.
    pub async fn probe_all(&mut self) {
        for index in 0..self.candidates.len() {
            self.probe_candidate(index).await;
        }
    }

    async fn probe_candidate(&mut self, index: usize) {
        let port = self.candidates[index].port;
        let host = self.candidates[index].host.clone();

        let mut result = self.prober.probe(&host, port).await;
        if host == WILDCARD_HOST && matches!(result, Err(ProbeError::Refused)) {
            tracing::debug!(port, "Wildcard address refused, retrying on loopback");
            self.candidates[index].host = LOOPBACK_HOST.to_string();
            result = self.prober.probe(LOOPBACK_HOST, port).await;
        }

        let candidate = &mut self.candidates[index];
        match result {
            Ok(latency) => {
                candidate.reachable = true;
                candidate.last_latency = latency;
                tracing::debug!(
                    node = %candidate.addr(),
                    latency_us = latency.as_micros() as u64,
                    "Probe succeeded"
                );
            }
            Err(e) => {
                candidate.reachable = false;
                tracing::warn!(node = %candidate.addr(), error = %e, "Probe failed");
            }
        }
    }

    /// Clears the selection so the next call probes again.
    pub fn invalidate(&mut self) {
        self.selected = None;
    }

    /// The currently selected node, if any.
    pub fn selected(&self) -> Option<&Candidate> {
        self.selected.map(|index| &self.candidates[index])
    }

    /// Stores a measured round-trip on the selected node.
    pub fn record_latency(&mut self, latency: Duration) {
        if let Some(index) = self.selected {
            self.candidates[index].last_latency = latency;
        }
    }

    /// All candidates with their last probe results.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers probes from a table and records every attempt.
    #[derive(Default)]
    struct ScriptedProber {
        outcomes: HashMap<(String, u16), std::result::Result<u64, ()>>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        fn up(mut self, host: &str, port: u16, latency_ms: u64) -> Self {
            self.outcomes.insert((host.to_string(), port), Ok(latency_ms));
            self
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl Prober for ScriptedProber {
        async fn probe(&self, host: &str, port: u16) -> std::result::Result<Duration, ProbeError> {
            self.attempts.lock().unwrap().push(format!("{}:{}", host, port));
            match self.outcomes.get(&(host.to_string(), port)) {
                Some(Ok(ms)) => Ok(Duration::from_millis(*ms)),
                _ => Err(ProbeError::Refused),
            }
        }
    }

    fn nodes(list: &[(&str, u16)]) -> Vec<NodeAddress> {
        list.iter().map(|(h, p)| NodeAddress::new(*h, *p)).collect()
    }

    fn candidate(latency_ms: u64, reachable: bool) -> Candidate {
        Candidate {
            host: "h".to_string(),
            port: 1,
            reachable,
            last_latency: Duration::from_millis(latency_ms),
        }
    }

    #[test]
    fn test_pick_best_tie_keeps_first() {
        let candidates = vec![candidate(500, true), candidate(200, true), candidate(200, true)];
        assert_eq!(pick_best(&candidates), Some(1));
    }

    #[test]
    fn test_pick_best_skips_unreachable() {
        let candidates = vec![candidate(1, false), candidate(300, true), candidate(100, false)];
        assert_eq!(pick_best(&candidates), Some(1));
        assert_eq!(pick_best(&[candidate(1, false)]), None);
        assert_eq!(pick_best(&[]), None);
    }

    #[test]
    fn test_candidate_addr_brackets_ipv6() {
        assert_eq!(Candidate::new("10.0.0.1", 80).addr(), "10.0.0.1:80");
        assert_eq!(Candidate::new("::1", 80).addr(), "[::1]:80");
    }

    #[tokio::test]
    async fn test_selects_lowest_latency() {
        let prober = ScriptedProber::default()
            .up("a", 1, 500)
            .up("b", 2, 200)
            .up("c", 3, 200);
        let mut selector = NodeSelector::new(nodes(&[("a", 1), ("b", 2), ("c", 3)]), prober);

        let best = selector.select_best_node().await.unwrap();
        assert_eq!(best.host, "b");
        assert_eq!(best.last_latency, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_no_reachable_node() {
        let mut selector =
            NodeSelector::new(nodes(&[("a", 1), ("b", 2)]), ScriptedProber::default());

        let result = selector.select_best_node().await;
        assert!(matches!(
            result,
            Err(ClientError::NoReachableNode { candidates: 2 })
        ));
        assert!(selector.candidates().iter().all(|c| !c.reachable));
        assert!(selector.selected().is_none());
    }

    #[tokio::test]
    async fn test_wildcard_refused_falls_back_to_localhost() {
        let prober = ScriptedProber::default().up(LOOPBACK_HOST, 5050, 3);
        let mut selector = NodeSelector::new(nodes(&[(WILDCARD_HOST, 5050)]), prober);

        let best = selector.select_best_node().await.unwrap();

        assert_eq!(best.host, LOOPBACK_HOST);
        assert!(best.reachable);
        assert_eq!(
            selector.prober.attempts(),
            vec!["0.0.0.0:5050".to_string(), "localhost:5050".to_string()]
        );
    }

    #[tokio::test]
    async fn test_wildcard_fallback_retries_once_then_gives_up() {
        let mut selector =
            NodeSelector::new(nodes(&[(WILDCARD_HOST, 5050)]), ScriptedProber::default());

        assert!(selector.select_best_node().await.is_err());
        assert_eq!(selector.prober.attempts().len(), 2);
        assert!(!selector.candidates()[0].reachable);

        // The substitution sticks: later probes go straight to loopback.
        assert!(selector.reprobe().await.is_err());
        assert_eq!(
            selector.prober.attempts().last().map(String::as_str),
            Some("localhost:5050")
        );
        assert_eq!(selector.prober.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_non_wildcard_refusal_is_not_retried() {
        let mut selector =
            NodeSelector::new(nodes(&[("10.9.9.9", 1)]), ScriptedProber::default());

        assert!(selector.select_best_node().await.is_err());
        assert_eq!(selector.prober.attempts(), vec!["10.9.9.9:1".to_string()]);
    }

    #[tokio::test]
    async fn test_selection_is_lazy_until_invalidated() {
        let prober = ScriptedProber::default().up("a", 1, 10);
        let mut selector = NodeSelector::new(nodes(&[("a", 1)]), prober);

        selector.select_best_node().await.unwrap();
        selector.select_best_node().await.unwrap();
        assert_eq!(selector.prober.attempts().len(), 1);

        selector.invalidate();
        selector.select_best_node().await.unwrap();
        assert_eq!(selector.prober.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_record_latency_updates_selected() {
        let prober = ScriptedProber::default().up("a", 1, 10).up("b", 2, 20);
        let mut selector = NodeSelector::new(nodes(&[("a", 1), ("b", 2)]), prober);

        selector.record_latency(Duration::from_millis(99));
        assert_eq!(selector.candidates()[0].last_latency, Duration::ZERO);

        selector.select_best_node().await.unwrap();
        selector.record_latency(Duration::from_millis(42));
        assert_eq!(
            selector.selected().unwrap().last_latency,
            Duration::from_millis(42)
        );
        assert_eq!(selector.candidates()[1].last_latency, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_tcp_prober_against_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let prober = TcpProber::new(Duration::from_secs(2));
        assert!(prober.probe("127.0.0.1", port).await.is_ok());

        drop(listener);
        let result = prober.probe("127.0.0.1", port).await;
        assert!(matches!(result, Err(ProbeError::Refused)));
    }
}
