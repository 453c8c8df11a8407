//! LifecycleOrchestrator (SPEC_FULL §4.9): components declare dependencies,
//! the orchestrator computes a topological start order and a bounded-deadline
//! reverse shutdown, triggered exactly once by SIGINT/SIGTERM. The signal
//! handling and `notify_waiters`-based fan-out is grounded directly in the
//! teacher's `server::bootstrap::wait_for_shutdown`; the topological
//! ordering and per-component deadline are new to this spec.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> crate::error::Result<()>;
    /// Stop is given `deadline` to complete; the orchestrator does not wait
    /// past it (exceeding it is logged as an escalation to cancellation, per
    /// spec — callers are expected to wire their own task aborts inside this
    /// method; the orchestrator only bounds the wall-clock wait).
    async fn stop(&self, deadline: Duration);
}

struct Registered {
    component: Arc<dyn Component>,
    depends_on: Vec<String>,
}

pub struct LifecycleOrchestrator {
    components: Vec<Registered>,
    shutdown_deadline: Duration,
    shutdown: Arc<Notify>,
    shutdown_triggered: AtomicBool,
}

impl LifecycleOrchestrator {
    pub fn new(shutdown_deadline: Duration) -> Self {
        Self {
            components: Vec::new(),
            shutdown_deadline,
            shutdown: Arc::new(Notify::new()),
            shutdown_triggered: AtomicBool::new(false),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn register(&mut self, component: Arc<dyn Component>, depends_on: &[&str]) {
        self.components.push(Registered {
            component,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Kahn's algorithm over the declared dependency edges. Ties (components
    /// with no remaining unsatisfied dependency at the same step) are broken
    /// by registration order, so the order is deterministic for a fixed
    /// registration sequence.
    fn topological_order(&self) -> crate::error::Result<Vec<usize>> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (idx, r) in self.components.iter().enumerate() {
            by_name.insert(r.component.name(), idx);
        }
        for r in &self.components {
            indegree.entry(r.component.name()).or_insert(0);
            for dep in &r.depends_on {
                if !by_name.contains_key(dep.as_str()) {
                    return Err(crate::error::ClusterError::InvariantViolation(format!(
                        "component '{}' depends on unregistered '{}'",
                        r.component.name(),
                        dep
                    )));
                }
            }
        }
        for r in &self.components {
            *indegree.entry(r.component.name()).or_insert(0) += r.depends_on.len();
        }

        let mut ready: Vec<usize> = self
            .components
            .iter()
            .enumerate()
            .filter(|(_, r)| r.depends_on.is_empty())
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.components.len());
        let mut done: HashSet<&str> = HashSet::new();

        while !ready.is_empty() {
            ready.sort();
            let idx = ready.remove(0);
            let name = self.components[idx].component.name();
            order.push(idx);
            done.insert(name);

            for (i, r) in self.components.iter().enumerate() {
                if done.contains(r.component.name()) || ready.contains(&i) {
                    continue;
                }
                if r.depends_on.iter().all(|d| done.contains(d.as_str())) {
                    ready.push(i);
                }
            }
        }

        if order.len() != self.components.len() {
            return Err(crate::error::ClusterError::InvariantViolation(
                "component dependency graph has a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    /// Starts every component in dependency order, then blocks until a
    /// single SIGINT/SIGTERM (or the externally-held `shutdown_handle` is
    /// notified), then stops every component in reverse order with
    /// `shutdown_deadline` per component.
    pub async fn run(&self) -> crate::error::Result<()> {
        let order = self.topological_order()?;

        for &idx in &order {
            let c = &self.components[idx].component;
            tracing::info!(component = c.name(), "lifecycle: starting");
            c.start().await?;
        }

        wait_for_shutdown(&self.shutdown, &self.shutdown_triggered).await;

        for &idx in order.iter().rev() {
            let c = &self.components[idx].component;
            tracing::info!(component = c.name(), "lifecycle: stopping");
            let deadline = self.shutdown_deadline;
            match tokio::time::timeout(deadline, c.stop(deadline)).await {
                Ok(()) => {}
                Err(_) => {
                    tracing::warn!(
                        component = c.name(),
                        deadline_secs = deadline.as_secs(),
                        "lifecycle: stop exceeded deadline, escalating to cancellation"
                    );
                }
            }
        }

        Ok(())
    }
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>, triggered: &AtomicBool) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "lifecycle: failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("lifecycle: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("lifecycle: received SIGTERM, shutting down"),
        _ = shutdown.notified() => tracing::info!("lifecycle: shutdown requested programmatically"),
    }

    if triggered.swap(true, Ordering::SeqCst) {
        return;
    }
    shutdown.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Component for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        async fn start(&self) -> crate::error::Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            Ok(())
        }
        async fn stop(&self, _deadline: Duration) {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
        }
    }

    #[tokio::test]
    async fn starts_in_dependency_order_and_stops_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut orchestrator = LifecycleOrchestrator::new(Duration::from_millis(200));

        let a = Arc::new(Recorder { name: "a", log: log.clone() });
        let b = Arc::new(Recorder { name: "b", log: log.clone() });
        let c = Arc::new(Recorder { name: "c", log: log.clone() });

        orchestrator.register(c.clone(), &["b"]);
        orchestrator.register(a.clone(), &[]);
        orchestrator.register(b.clone(), &["a"]);

        let shutdown = orchestrator.shutdown_handle();
        let run = tokio::spawn(async move { orchestrator.run().await });
        shutdown.notify_waiters();
        run.await.unwrap().unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec!["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn cyclic_dependencies_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut orchestrator = LifecycleOrchestrator::new(Duration::from_millis(50));
        orchestrator.register(Arc::new(Recorder { name: "a", log: log.clone() }), &["b"]);
        orchestrator.register(Arc::new(Recorder { name: "b", log: log.clone() }), &["a"]);
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, crate::error::ClusterError::InvariantViolation(_)));
    }
}
