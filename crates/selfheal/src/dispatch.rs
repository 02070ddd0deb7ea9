//! Per-node dispatch.
//!
//! Observations for one node are handled strictly in order on that node's worker task;
//! different nodes run in parallel. Action primitives block their worker for as long as the
//! remote job runs, so a slow reboot on one node never delays another node.
//!
//! Episodes for one node must not overlap: spawned jobs are named per (action, node) and a
//! second concurrent episode would delete the first one's job.

use crate::actions::ActionContext;
use crate::error::Result;
use crate::observation::FaultObservation;
use crate::registry::Registry;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An episode event for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "lowercase")]
pub enum Signal {
    /// The fault is present
    Observed(FaultObservation),
    /// The fault cleared
    Resolved(FaultObservation),
}

impl Signal {
    pub fn status(&self) -> &FaultObservation {
        match self {
            Signal::Observed(status) | Signal::Resolved(status) => status,
        }
    }

    pub fn node(&self) -> &str {
        &self.status().node_name
    }
}

/// What [`process`] did with a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No policy handles the condition
    Unknown,
    /// Evaluate declined
    Skipped,
    Executed,
    Cleaned,
}

/// Runs one signal through its policy: Evaluate then Execute, or Cleanup
pub async fn process(
    registry: &Registry,
    ctx: &ActionContext,
    signal: &Signal,
) -> Result<DispatchOutcome> {
    let status = signal.status();
    let node = status.node_name.as_str();
    let policy = match registry.get(&status.condition) {
        Ok(policy) => policy,
        Err(e) if e.is_not_found() => {
            debug!(node = %node, condition = %status.condition, "No policy for condition");
            return Ok(DispatchOutcome::Unknown);
        }
        Err(e) => return Err(e),
    };

    match signal {
        Signal::Observed(_) => {
            if !policy.evaluate(node, status).await {
                debug!(node = %node, condition = %status.condition, policy = policy.name(), "Evaluate declined");
                return Ok(DispatchOutcome::Skipped);
            }
            policy.execute(ctx, node, status).await?;
            Ok(DispatchOutcome::Executed)
        }
        Signal::Resolved(_) => {
            policy.cleanup(ctx, node, status).await?;
            Ok(DispatchOutcome::Cleaned)
        }
    }
}

/// Fans signals out to one worker task per node
pub struct Dispatcher {
    registry: Arc<Registry>,
    token: CancellationToken,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Signal>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, token: CancellationToken) -> Self {
        Self {
            registry,
            token,
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Queues a signal on its node's worker, starting the worker if needed
    pub fn submit(&self, signal: Signal) {
        let node = signal.node().to_string();
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());

        let signal = match queues.get(&node) {
            Some(queue) => match queue.send(signal) {
                Ok(()) => return,
                Err(mpsc::error::SendError(signal)) => signal,
            },
            None => signal,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // a fresh receiver cannot be closed
        let _ = tx.send(signal);
        queues.insert(node.clone(), tx);
        let handle = tokio::spawn(worker(
            node,
            self.registry.clone(),
            self.token.clone(),
            rx,
        ));
        self.workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    /// Closes every queue and waits for workers to finish what they hold
    pub async fn shutdown(&self) {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Node worker panicked");
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn worker(
    node: String,
    registry: Arc<Registry>,
    token: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<Signal>,
) {
    debug!(node = %node, "Node worker started");
    let ctx = ActionContext::new(token.clone());
    loop {
        let signal = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(signal) => signal,
                None => break,
            },
        };

        let condition = signal.status().condition.clone();
        match process(&registry, &ctx, &signal).await {
            Ok(outcome) => debug!(node = %node, condition = %condition, ?outcome, "Signal handled"),
            Err(e) if e.is_deferrable() => {
                info!(node = %node, condition = %condition, error = %e, "Remediation deferred");
            }
            Err(e) => warn!(node = %node, condition = %condition, error = %e, "Remediation failed"),
        }
    }
    debug!(node = %node, "Node worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ApiBridge;
    use crate::config::EngineConfig;
    use crate::observation::{condition, HardwareType};
    use crate::policy::Policy;
    use crate::testing::{aggressive_config, harness};
    use crate::tickets::{TicketKey, TicketManager, TicketState};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Records phase boundaries and takes a second per execute
    #[derive(Default)]
    struct Recording {
        log: Mutex<Vec<String>>,
    }

    impl Recording {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl Policy for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn conditions(&self) -> &'static [&'static str] {
            &["Slow"]
        }

        fn create_instance(&self, _bridge: Arc<ApiBridge>) -> Result<()> {
            Ok(())
        }

        async fn evaluate(&self, _node: &str, status: &FaultObservation) -> bool {
            status.value >= 0
        }

        async fn execute(
            &self,
            _ctx: &ActionContext,
            node: &str,
            status: &FaultObservation,
        ) -> Result<()> {
            self.push(format!("start {node} {}", status.value));
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.push(format!("end {node} {}", status.value));
            Ok(())
        }

        async fn cleanup(
            &self,
            _ctx: &ActionContext,
            node: &str,
            _status: &FaultObservation,
        ) -> Result<()> {
            self.push(format!("cleanup {node}"));
            Ok(())
        }
    }

    fn slow(node: &str, value: i64) -> FaultObservation {
        FaultObservation::new(node, HardwareType::Unknown, "Slow").with_value(value)
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate_false_skips_execute() {
        let recording = Arc::new(Recording::default());
        let mut registry = Registry::new();
        registry.register_policy(recording.clone()).unwrap();

        let outcome = process(
            &registry,
            &ActionContext::default(),
            &Signal::Observed(slow("n1", -1)),
        )
        .await
        .unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert!(recording.log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn declined_observation_leaves_cluster_untouched() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let registry = Registry::with_default_policies().unwrap();
        registry.initialize(h.bridge.clone()).unwrap();

        let benign = FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_XID).with_value(43);
        let outcome = process(&registry, &ActionContext::default(), &Signal::Observed(benign))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert_eq!(h.cluster.mutations(), 0);
        assert!(!h
            .tickets
            .check_ticket_exists(&TicketKey::new("n1", "gpu"))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_condition_is_reported() {
        let registry = Registry::new();
        let outcome = process(
            &registry,
            &ActionContext::default(),
            &Signal::Observed(slow("n1", 1)),
        )
        .await
        .unwrap();
        assert_eq!(outcome, DispatchOutcome::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_hung_gpu_without_aggressive() {
        let h = harness(EngineConfig::default());
        h.cluster.add_node("n1");
        let registry = Registry::with_default_policies().unwrap();
        registry.initialize(h.bridge.clone()).unwrap();
        let hung = FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_HUNG);

        let outcome = process(&registry, &ActionContext::default(), &Signal::Observed(hung))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Executed);

        let node = h.bridge.cluster.get_node("n1").await.unwrap();
        assert!(crate::cluster::is_unschedulable(&node));
        let ticket = h
            .tickets
            .get_ticket(&TicketKey::new("n1", "gpu"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.state, TicketState::DispatchedToSre);
        assert!(h.cluster.created_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_hung_gpu_with_aggressive() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let registry = Registry::with_default_policies().unwrap();
        registry.initialize(h.bridge.clone()).unwrap();
        let hung = FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_HUNG);

        process(&registry, &ActionContext::default(), &Signal::Observed(hung.clone()))
            .await
            .unwrap();

        let node = h.bridge.cluster.get_node("n1").await.unwrap();
        assert!(crate::cluster::is_unschedulable(&node));
        assert!(h
            .tickets
            .check_ticket_exists(&TicketKey::new("n1", "gpu"))
            .await
            .unwrap());
        assert_eq!(
            h.cluster.created_jobs(),
            vec!["reboot-n1".to_string(), "repair-n1".to_string()]
        );

        let outcome = process(&registry, &ActionContext::default(), &Signal::Resolved(hung))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Cleaned);
        let node = h.bridge.cluster.get_node("n1").await.unwrap();
        assert!(!crate::cluster::is_unschedulable(&node));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_gpu_does_not_release_node_held_by_ib() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let registry = Registry::with_default_policies().unwrap();
        registry.initialize(h.bridge.clone()).unwrap();
        let ctx = ActionContext::default();

        let degraded = FaultObservation::new("n1", HardwareType::Ib, condition::IB_DEGRADED);
        process(&registry, &ctx, &Signal::Observed(degraded))
            .await
            .unwrap();
        let hot = FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_HIGH_TEMPERATURE)
            .with_value(91);
        process(&registry, &ctx, &Signal::Observed(hot))
            .await
            .unwrap();

        assert!(!h
            .tickets
            .check_ticket_exists(&TicketKey::new("n1", "gpu"))
            .await
            .unwrap());
        assert!(h
            .tickets
            .check_ticket_exists(&TicketKey::new("n1", "ib"))
            .await
            .unwrap());
        let node = h.bridge.cluster.get_node("n1").await.unwrap();
        assert!(crate::cluster::is_unschedulable(&node));
        assert_eq!(
            crate::cluster::node_label(&node, crate::actions::labels::IB_UNAVAILABLE),
            Some("true")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn episodes_are_serialized_per_node() {
        let recording = Arc::new(Recording::default());
        let mut registry = Registry::new();
        registry.register_policy(recording.clone()).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry), CancellationToken::new());

        dispatcher.submit(Signal::Observed(slow("n1", 1)));
        dispatcher.submit(Signal::Observed(slow("n2", 1)));
        dispatcher.submit(Signal::Observed(slow("n1", 2)));
        dispatcher.submit(Signal::Resolved(slow("n1", 2)));
        dispatcher.shutdown().await;

        let log = recording.log.lock().unwrap().clone();
        let n1: Vec<&str> = log
            .iter()
            .filter(|e| e.contains("n1"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            n1,
            vec!["start n1 1", "end n1 1", "start n1 2", "end n1 2", "cleanup n1"]
        );
        // n2 ran alongside n1's first episode
        let n2_start = log.iter().position(|e| e == "start n2 1").unwrap();
        let n1_end = log.iter().position(|e| e == "end n1 1").unwrap();
        assert!(n2_start < n1_end);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_dispatcher_stops_workers() {
        let recording = Arc::new(Recording::default());
        let mut registry = Registry::new();
        registry.register_policy(recording.clone()).unwrap();
        let token = CancellationToken::new();
        let dispatcher = Dispatcher::new(Arc::new(registry), token.clone());

        token.cancel();
        dispatcher.submit(Signal::Observed(slow("n1", 1)));
        dispatcher.shutdown().await;
        assert!(recording.log.lock().unwrap().is_empty());
    }

    #[test]
    fn signal_wire_format() {
        let line = r#"{"signal":"observed","nodeName":"n1","type":"gpu","condition":"Hung"}"#;
        let signal: Signal = serde_json::from_str(line).unwrap();
        assert_eq!(signal.node(), "n1");
        assert!(matches!(signal, Signal::Observed(_)));

        let err = serde_json::from_str::<Signal>(r#"{"nodeName":"n1"}"#);
        assert!(err.is_err());
    }
}
