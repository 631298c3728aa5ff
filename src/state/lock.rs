//! Lock Coordinator
//!
//! Holds the fleet-wide leader lease. A single task acquires the lease,
//! renews it every TTL/2 and, on any renewal failure, steps down and
//! goes straight back to acquiring. Failed acquisitions wait TTL/5.
//! Mutual exclusion itself is provided by the `LockService`; locally a
//! node only counts itself leader until its own conservative estimate
//! of the lease expiry, so a stalled lock service demotes it before
//! another node can be granted the key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use crate::coordination::LockService;
use crate::shutdown::{self, ShutdownSignal};

/// Role of this node with respect to the lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderRole {
    /// Not holding the lease
    Follower,
    /// Holding the lease
    Leader,
}

impl std::fmt::Display for LeaderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderRole::Follower => write!(f, "FOLLOWER"),
            LeaderRole::Leader => write!(f, "LEADER"),
        }
    }
}

/// Snapshot of the leadership state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leadership {
    pub role: LeaderRole,
    /// Number of promotions so far; identifies the current holding
    pub term: u64,
}

impl Leadership {
    pub fn follower() -> Self {
        Self {
            role: LeaderRole::Follower,
            term: 0,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == LeaderRole::Leader
    }
}

/// Read-only view of the leadership state
#[derive(Debug, Clone)]
pub struct LeadershipWatch {
    rx: watch::Receiver<Leadership>,
}

impl LeadershipWatch {
    pub(crate) fn new(rx: watch::Receiver<Leadership>) -> Self {
        Self { rx }
    }

    /// Current state
    pub fn current(&self) -> Leadership {
        *self.rx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.rx.borrow().is_leader()
    }

    /// Wait for the next transition; false once the coordinator is gone
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Lease parameters
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lease key, scoped by environment
    pub key: String,
    /// Time-to-live granted on acquire and on every renewal
    pub ttl: Duration,
}

impl LeaseConfig {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
        }
    }

    /// Renewal cadence
    pub fn renew_interval(&self) -> Duration {
        self.ttl / 2
    }

    /// Wait after a failed acquisition
    pub fn retry_backoff(&self) -> Duration {
        self.ttl / 5
    }

    /// Slack kept between the local view of the lease and its expiry in the service
    pub fn safety_margin(&self) -> Duration {
        self.ttl / 10
    }

    /// Last instant a lease requested at `requested_at` may be treated as held.
    /// The service starts the TTL no earlier than the request was sent.
    pub fn held_until(&self, requested_at: Instant) -> Instant {
        requested_at + self.ttl - self.safety_margin()
    }
}

/// How a holding period ended
enum HoldOutcome {
    Lost,
    Shutdown,
}

/// Acquires and holds the leader lease for this node
pub struct LockCoordinator {
    /// This node's ID
    node_id: String,
    config: LeaseConfig,
    lock: Arc<dyn LockService>,
    /// Sole writer of the leadership state
    state: watch::Sender<Leadership>,
    running: AtomicBool,
}

impl LockCoordinator {
    /// Create a new lock coordinator
    pub fn new(node_id: String, config: LeaseConfig, lock: Arc<dyn LockService>) -> Self {
        let (state, _) = watch::channel(Leadership::follower());
        Self {
            node_id,
            config,
            lock,
            state,
            running: AtomicBool::new(false),
        }
    }

    /// Read-only leadership view for other components
    pub fn watch(&self) -> LeadershipWatch {
        LeadershipWatch::new(self.state.subscribe())
    }

    /// Current leadership state
    pub fn leadership(&self) -> Leadership {
        *self.state.borrow()
    }

    /// Run the acquire/renew loop until shutdown. Returns immediately if
    /// the loop is already running. On shutdown a held lease is released.
    pub async fn acquire_and_hold(&self, mut shutdown: ShutdownSignal) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Lock coordinator already running for {}", self.config.key);
            return;
        }

        tracing::info!(
            "Competing for lease {} (ttl {:?}) as {}",
            self.config.key,
            self.config.ttl,
            self.node_id
        );

        loop {
            if shutdown::is_requested(&shutdown) {
                break;
            }

            let token = format!("{}:{}", self.node_id, uuid::Uuid::new_v4().simple());
            let requested_at = Instant::now();
            let deadline = self.config.held_until(requested_at);
            let attempt = timeout_at(
                deadline,
                self.lock.acquire(&self.config.key, &token, self.config.ttl),
            )
            .await;

            match attempt {
                Ok(Ok(true)) => {
                    self.promote();
                    match self.hold(&token, requested_at, &mut shutdown).await {
                        HoldOutcome::Lost => {
                            self.demote();
                            // Re-acquire immediately
                            continue;
                        }
                        HoldOutcome::Shutdown => {
                            self.release(&token).await;
                            self.demote();
                            break;
                        }
                    }
                }
                Ok(Ok(false)) => {
                    tracing::trace!("Lease {} is held elsewhere", self.config.key);
                    self.demote();
                }
                Ok(Err(e)) => {
                    tracing::debug!("Lease acquisition for {} failed: {}", self.config.key, e);
                    self.demote();
                }
                Err(_) => {
                    tracing::warn!(
                        "Lease acquisition for {} did not complete before the lease would run out",
                        self.config.key
                    );
                    self.demote();
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_backoff()) => {}
                _ = shutdown::requested(&mut shutdown) => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Lock coordinator for {} stopped", self.config.key);
    }

    /// Renew TTL/2 after each grant until a renewal fails, runs past the
    /// locally known lease expiry, or shutdown is requested
    async fn hold(
        &self,
        token: &str,
        mut granted_at: Instant,
        shutdown: &mut ShutdownSignal,
    ) -> HoldOutcome {
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(granted_at + self.config.renew_interval()) => {}
                _ = shutdown::requested(shutdown) => return HoldOutcome::Shutdown,
            }

            let requested_at = Instant::now();
            let renewal = timeout_at(
                self.config.held_until(granted_at),
                self.lock.extend(&self.config.key, token, self.config.ttl),
            )
            .await;

            match renewal {
                Ok(Ok(true)) => {
                    granted_at = requested_at;
                    tracing::trace!("Renewed lease {}", self.config.key);
                }
                Ok(Ok(false)) => {
                    tracing::info!("Lease {} was lost, restarting election", self.config.key);
                    return HoldOutcome::Lost;
                }
                Ok(Err(e)) => {
                    tracing::info!(
                        "Lease {} renewal failed ({}), restarting election",
                        self.config.key,
                        e
                    );
                    return HoldOutcome::Lost;
                }
                Err(_) => {
                    tracing::info!(
                        "Lease {} renewal still pending at local expiry, restarting election",
                        self.config.key
                    );
                    return HoldOutcome::Lost;
                }
            }
        }
    }

    /// Best-effort delete so the next node does not wait out the TTL
    async fn release(&self, token: &str) {
        match self.lock.release(&self.config.key, token).await {
            Ok(()) => tracing::info!("Released lease {}", self.config.key),
            Err(e) => tracing::warn!("Failed to release lease {}: {}", self.config.key, e),
        }
    }

    fn promote(&self) {
        self.state.send_modify(|state| {
            state.role = LeaderRole::Leader;
            state.term += 1;
        });
        tracing::info!(
            "Node {} is now LEADER (term {})",
            self.node_id,
            self.leadership().term
        );
    }

    fn demote(&self) {
        let stepped_down = self.state.send_if_modified(|state| {
            if state.is_leader() {
                state.role = LeaderRole::Follower;
                true
            } else {
                false
            }
        });
        if stepped_down {
            tracing::info!("Node {} stepped down to FOLLOWER", self.node_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MemoryClient, MemoryCoordinator};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;

    const TTL: Duration = Duration::from_secs(10);
    const KEY: &str = "dev-coasters-leader";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Acquire,
        Extend,
        Release,
    }

    /// Scripted lock service that records when each call happened
    struct ScriptedLock {
        start: Instant,
        grant_acquire: bool,
        grant_extend: bool,
        calls: Mutex<Vec<(Op, Duration)>>,
    }

    impl ScriptedLock {
        fn new(grant_acquire: bool, grant_extend: bool) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                grant_acquire,
                grant_extend,
                calls: Mutex::new(Vec::new()),
            })
        }

        async fn record(&self, op: Op) {
            self.calls.lock().await.push((op, self.start.elapsed()));
        }

        async fn calls(&self) -> Vec<(Op, Duration)> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl LockService for ScriptedLock {
        async fn acquire(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool> {
            self.record(Op::Acquire).await;
            Ok(self.grant_acquire)
        }

        async fn extend(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool> {
            self.record(Op::Extend).await;
            if self.grant_extend {
                Ok(true)
            } else {
                Err(Error::Unavailable("scripted outage".into()))
            }
        }

        async fn release(&self, _key: &str, _token: &str) -> Result<()> {
            self.record(Op::Release).await;
            Ok(())
        }
    }

    fn spawn_coordinator(
        coordinator: &Arc<LockCoordinator>,
        signal: ShutdownSignal,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(coordinator);
        tokio::spawn(async move { coordinator.acquire_and_hold(signal).await })
    }

    fn memory_node(id: &str, client: &MemoryClient) -> Arc<LockCoordinator> {
        Arc::new(LockCoordinator::new(
            id.to_string(),
            LeaseConfig::new(KEY, TTL),
            Arc::new(client.clone()),
        ))
    }

    #[test]
    fn test_lease_cadence() {
        let config = LeaseConfig::new(KEY, TTL);
        assert_eq!(config.renew_interval(), Duration::from_secs(5));
        assert_eq!(config.retry_backoff(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_renewal_at_half_ttl() {
        let lock = ScriptedLock::new(true, true);
        let coordinator = Arc::new(LockCoordinator::new(
            "node-1".to_string(),
            LeaseConfig::new(KEY, TTL),
            lock.clone(),
        ));
        let (trigger, signal) = shutdown::channel();
        let handle = spawn_coordinator(&coordinator, signal);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(coordinator.leadership().is_leader());
        assert_eq!(lock.calls().await, vec![(Op::Acquire, Duration::ZERO)]);

        tokio::time::sleep(Duration::from_millis(5_200)).await;
        assert_eq!(
            lock.calls().await,
            vec![
                (Op::Acquire, Duration::ZERO),
                (Op::Extend, Duration::from_secs(5)),
                (Op::Extend, Duration::from_secs(10)),
            ]
        );

        trigger.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(lock.calls().await.last().unwrap().0, Op::Release);
        assert!(!coordinator.leadership().is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_acquisition_backs_off() {
        let lock = ScriptedLock::new(false, true);
        let coordinator = Arc::new(LockCoordinator::new(
            "node-1".to_string(),
            LeaseConfig::new(KEY, TTL),
            lock.clone(),
        ));
        let (trigger, signal) = shutdown::channel();
        let handle = spawn_coordinator(&coordinator, signal);

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        let times: Vec<Duration> = lock.calls().await.into_iter().map(|(_, at)| at).collect();
        assert_eq!(
            times,
            vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6),
            ]
        );
        assert!(!coordinator.leadership().is_leader());

        trigger.send(true).unwrap();
        handle.await.unwrap();
        // Never held, so nothing to release
        assert!(lock.calls().await.iter().all(|(op, _)| *op == Op::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_demotes_and_reacquires() {
        let lock = ScriptedLock::new(true, false);
        let coordinator = Arc::new(LockCoordinator::new(
            "node-1".to_string(),
            LeaseConfig::new(KEY, TTL),
            lock.clone(),
        ));
        let (trigger, signal) = shutdown::channel();
        let handle = spawn_coordinator(&coordinator, signal);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        let calls = lock.calls().await;
        assert_eq!(
            calls,
            vec![
                (Op::Acquire, Duration::ZERO),
                (Op::Extend, Duration::from_secs(5)),
                // Restart immediately, no backoff after a lost lease
                (Op::Acquire, Duration::from_secs(5)),
            ]
        );
        // The scripted service grants again, so this is a new holding
        assert_eq!(coordinator.leadership().term, 2);

        trigger.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_is_a_no_op() {
        let lock = ScriptedLock::new(false, true);
        let coordinator = Arc::new(LockCoordinator::new(
            "node-1".to_string(),
            LeaseConfig::new(KEY, TTL),
            lock.clone(),
        ));
        let (trigger, signal) = shutdown::channel();
        let handle = spawn_coordinator(&coordinator, signal.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Returns at once while the first loop runs
        coordinator.acquire_and_hold(signal).await;
        assert_eq!(lock.calls().await.len(), 1);

        trigger.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion() {
        let service = MemoryCoordinator::new();
        let (trigger, signal) = shutdown::channel();

        let nodes: Vec<Arc<LockCoordinator>> = (0..3)
            .map(|i| memory_node(&format!("node-{}", i), &service.client()))
            .collect();
        let handles: Vec<_> = nodes
            .iter()
            .map(|node| spawn_coordinator(node, signal.clone()))
            .collect();

        for _ in 0..600 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let leaders = nodes.iter().filter(|n| n.leadership().is_leader()).count();
            assert_eq!(leaders, 1);
        }

        trigger.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(service.holder(KEY).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_after_outage() {
        let service = MemoryCoordinator::new();
        let client_a = service.client();
        let client_b = service.client();
        let a = memory_node("node-a", &client_a);
        let b = memory_node("node-b", &client_b);
        let (trigger, signal) = shutdown::channel();

        let handle_a = spawn_coordinator(&a, signal.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;
        let handle_b = spawn_coordinator(&b, signal.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(a.leadership().is_leader());
        assert!(!b.leadership().is_leader());

        // Node A loses the lock service at t=6; its renewal at t=10 fails
        tokio::time::sleep(Duration::from_millis(6_000)).await;
        client_a.set_online(false);

        let outage_start = Instant::now();
        let mut b_promoted_at = None;
        while outage_start.elapsed() < Duration::from_secs(20) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let a_leads = a.leadership().is_leader();
            let b_leads = b.leadership().is_leader();
            assert!(!(a_leads && b_leads), "two leaders at once");
            if b_leads && b_promoted_at.is_none() {
                b_promoted_at = Some(outage_start.elapsed());
            }
        }

        let promoted = b_promoted_at.expect("node-b never became leader");
        // A's last renewal at t=5 keeps the lease until t=15
        assert!(promoted <= Duration::from_secs(4) + TTL + TTL / 5);
        assert_eq!(b.leadership().term, 1);
        assert!(!a.leadership().is_leader());

        trigger.send(true).unwrap();
        handle_a.await.unwrap();
        handle_b.await.unwrap();
    }

    /// Lock service whose renewals hang for a while and then fail
    struct StallingLock {
        inner: MemoryClient,
        stall: AtomicBool,
        stall_for: Duration,
    }

    #[async_trait]
    impl LockService for StallingLock {
        async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            self.inner.acquire(key, token, ttl).await
        }

        async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            if self.stall.load(Ordering::SeqCst) {
                tokio::time::sleep(self.stall_for).await;
                return Err(Error::ConnectionTimeout("renewal stalled".into()));
            }
            self.inner.extend(key, token, ttl).await
        }

        async fn release(&self, key: &str, token: &str) -> Result<()> {
            self.inner.release(key, token).await
        }
    }

    /// Lock service that grants, but only after the lease would be gone
    struct SlowGrantLock {
        delay: Duration,
        acquires: Mutex<u32>,
    }

    #[async_trait]
    impl LockService for SlowGrantLock {
        async fn acquire(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool> {
            *self.acquires.lock().await += 1;
            tokio::time::sleep(self.delay).await;
            Ok(true)
        }

        async fn extend(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool> {
            Ok(true)
        }

        async fn release(&self, _key: &str, _token: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_renewal_steps_down_before_expiry() {
        let service = MemoryCoordinator::new();
        let stalling = Arc::new(StallingLock {
            inner: service.client(),
            stall: AtomicBool::new(false),
            stall_for: Duration::from_secs(8),
        });
        let a = Arc::new(LockCoordinator::new(
            "node-a".to_string(),
            LeaseConfig::new(KEY, TTL),
            stalling.clone(),
        ));
        let b = memory_node("node-b", &service.client());
        let (trigger, signal) = shutdown::channel();

        let start = Instant::now();
        let handle_a = spawn_coordinator(&a, signal.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;
        let handle_b = spawn_coordinator(&b, signal.clone());
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(a.leadership().is_leader());

        // The renewal at t=5 hangs until t=13, past the lease expiry at t=10
        stalling.stall.store(true, Ordering::SeqCst);

        let mut a_demoted_at = None;
        let mut b_promoted_at = None;
        while start.elapsed() < Duration::from_secs(20) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let a_leads = a.leadership().is_leader();
            let b_leads = b.leadership().is_leader();
            assert!(!(a_leads && b_leads), "two leaders at once");
            if !a_leads && a_demoted_at.is_none() {
                a_demoted_at = Some(start.elapsed());
            }
            if b_leads && b_promoted_at.is_none() {
                b_promoted_at = Some(start.elapsed());
            }
        }

        let demoted = a_demoted_at.expect("node-a never stepped down");
        let promoted = b_promoted_at.expect("node-b never became leader");
        // Local expiry is TTL minus a tenth after the grant at t=0
        assert!(demoted <= Duration::from_millis(9_100));
        assert!(demoted < promoted);
        assert!(promoted <= Duration::from_millis(12_500));
        assert_eq!(b.leadership().term, 1);

        trigger.send(true).unwrap();
        handle_a.await.unwrap();
        handle_b.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_arriving_after_expiry_is_not_leadership() {
        let lock = Arc::new(SlowGrantLock {
            delay: Duration::from_secs(12),
            acquires: Mutex::new(0),
        });
        let coordinator = Arc::new(LockCoordinator::new(
            "node-1".to_string(),
            LeaseConfig::new(KEY, TTL),
            lock.clone(),
        ));
        let (trigger, signal) = shutdown::channel();
        let handle = spawn_coordinator(&coordinator, signal);

        for _ in 0..300 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!coordinator.leadership().is_leader());
        }
        // Attempts time out at t=9 and t=20, each followed by the backoff
        assert_eq!(*lock.acquires.lock().await, 3);

        trigger.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_for_next_node() {
        let service = MemoryCoordinator::new();
        let a = memory_node("node-a", &service.client());
        let b = memory_node("node-b", &service.client());

        let (trigger_a, signal_a) = shutdown::channel();
        let (trigger_b, signal_b) = shutdown::channel();
        let handle_a = spawn_coordinator(&a, signal_a);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let handle_b = spawn_coordinator(&b, signal_b);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.leadership().is_leader());

        trigger_a.send(true).unwrap();
        handle_a.await.unwrap();
        assert!(!a.leadership().is_leader());

        // B takes over on its next retry, well before the TTL would expire
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(b.leadership().is_leader());

        trigger_b.send(true).unwrap();
        handle_b.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_sees_transitions() {
        let service = MemoryCoordinator::new();
        let node = memory_node("node-1", &service.client());
        let mut watch = node.watch();
        assert!(!watch.is_leader());

        let (trigger, signal) = shutdown::channel();
        let handle = spawn_coordinator(&node, signal);

        assert!(watch.changed().await);
        assert!(watch.is_leader());
        assert_eq!(watch.current().term, 1);

        trigger.send(true).unwrap();
        handle.await.unwrap();
        assert!(!watch.is_leader());
    }
}
