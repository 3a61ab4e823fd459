//! Online/offline detection.
//!
//! `ConnectivityMonitor` probes an ordered list of well-known hosts on a
//! fixed schedule. It is online if any host answers and offline only when
//! every host fails. Listeners receive a `ConnectivityEvent` only when the
//! state flips, never for repeated identical readings.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;

const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

impl ConnectivityEvent {
    fn from_online(online: bool) -> Self {
        if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        }
    }
}

/// Last known connectivity and when it last changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectivityState {
    pub online: bool,
    pub changed_at: DateTime<Utc>,
}

pub type ListenerId = u64;

type Listener = (ListenerId, mpsc::UnboundedSender<ConnectivityEvent>);

/// Answers whether a single host is reachable within `timeout`.
///
/// Any failure (DNS, refused, timeout, unreachable network) is just `false`.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, host: &str, timeout: Duration) -> bool;
}

/// Probe that opens a TCP connection to `host:port`.
pub struct TcpProbe;

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self, host: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(host)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(host, error = %e, "Host unreachable");
                false
            }
            Err(_) => {
                debug!(host, "Probe timed out");
                false
            }
        }
    }
}

struct Inner {
    probe: Arc<dyn ReachabilityProbe>,
    hosts: Vec<String>,
    timeout: Duration,
    online: AtomicBool,
    state: Mutex<ConnectivityState>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    /// Held for the duration of a probe round so rounds never overlap.
    probe_lock: tokio::sync::Mutex<()>,
    shut_down: AtomicBool,
}

impl Inner {
    async fn probe_all(&self) -> bool {
        for host in &self.hosts {
            if self.probe.is_reachable(host, self.timeout).await {
                return true;
            }
        }
        false
    }

    async fn check(&self) -> bool {
        let _round = self.probe_lock.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return self.online.load(Ordering::SeqCst);
        }

        let online = self.probe_all().await;
        // Shutdown flips the flag under this lock, so a round that outlives
        // it cannot publish
        let mut listeners = self.listeners.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("Discarding probe round finished after shutdown");
            return self.online.load(Ordering::SeqCst);
        }
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            *self.state.lock() = ConnectivityState {
                online,
                changed_at: Utc::now(),
            };
            if online {
                info!("Connection restored - online mode");
            } else {
                warn!("Connection lost - offline mode");
            }
            Self::notify(&mut listeners, ConnectivityEvent::from_online(online));
        }
        online
    }

    fn notify(listeners: &mut Vec<Listener>, event: ConnectivityEvent) {
        // Listeners whose receiver is gone are dropped here
        listeners.retain(|(id, tx)| match tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!(listener = id, "Listener closed, removing");
                false
            }
        });
    }
}

pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    /// Run the first probe, then start the periodic schedule.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(
        probe: Arc<dyn ReachabilityProbe>,
        hosts: Vec<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        if hosts.is_empty() {
            warn!("No probe hosts configured, connectivity will always read offline");
        }

        let inner = Arc::new(Inner {
            probe,
            hosts,
            timeout,
            online: AtomicBool::new(false),
            state: Mutex::new(ConnectivityState {
                online: false,
                changed_at: Utc::now(),
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            probe_lock: tokio::sync::Mutex::new(()),
            shut_down: AtomicBool::new(false),
        });

        let online = inner.probe_all().await;
        inner.online.store(online, Ordering::SeqCst);
        inner.state.lock().online = online;
        info!(online, hosts = inner.hosts.len(), "Initial connectivity check");

        let task = Self::spawn_schedule(Arc::clone(&inner), interval);
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(TcpProbe),
            config.probe_hosts.clone(),
            config.probe_interval(),
            config.probe_timeout(),
        )
        .await
    }

    fn spawn_schedule(inner: Arc<Inner>, interval: Duration) -> JoinHandle<()> {
        // A zero period would make the ticker panic
        let interval = interval.max(MIN_PROBE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.check().await;
            }
        })
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn is_offline(&self) -> bool {
        !self.is_online()
    }

    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.lock()
    }

    /// Probe immediately, returning the new online flag.
    pub async fn check_now(&self) -> bool {
        self.inner.check().await
    }

    pub fn add_listener(&self, tx: mpsc::UnboundedSender<ConnectivityEvent>) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push((id, tx));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener, _)| *listener != id);
        listeners.len() != before
    }

    /// Register a fresh channel and hand back its receiving end.
    pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<ConnectivityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.add_listener(tx), rx)
    }

    /// Stop probing, then drop every listener.
    pub fn shutdown(&self) {
        info!("Shutting down connectivity monitor");
        {
            let mut listeners = self.inner.listeners.lock();
            self.inner.shut_down.store(true, Ordering::SeqCst);
            listeners.clear();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    /// Replays a fixed sequence of probe outcomes, then reports unreachable.
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<bool>>,
    }

    impl ScriptedProbe {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn is_reachable(&self, _host: &str, _timeout: Duration) -> bool {
            self.outcomes.lock().pop_front().unwrap_or(false)
        }
    }

    /// Reachable only for the listed hosts; records the order of calls.
    struct HostSetProbe {
        up: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReachabilityProbe for HostSetProbe {
        async fn is_reachable(&self, host: &str, _timeout: Duration) -> bool {
            self.calls.lock().push(host.to_string());
            self.up.iter().any(|h| *h == host)
        }
    }

    /// Answers the first probe at once; later probes wait to be released.
    #[derive(Default)]
    struct GatedProbe {
        calls: AtomicU64,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ReachabilityProbe for GatedProbe {
        async fn is_reachable(&self, _host: &str, _timeout: Duration) -> bool {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return true;
            }
            self.entered.notify_one();
            self.release.notified().await;
            false
        }
    }

    const NEVER: Duration = Duration::from_secs(3600);

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|h| h.to_string()).collect()
    }

    #[tokio::test]
    async fn test_listeners_fire_only_on_transitions() {
        let probe = ScriptedProbe::new(&[true, true, true, false, false, true]);
        let monitor = ConnectivityMonitor::new(probe, hosts(&["a"]), NEVER, NEVER).await;
        assert!(monitor.is_online());

        let (_, mut rx) = monitor.subscribe();
        for _ in 0..5 {
            monitor.check_now().await;
        }

        assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::Offline);
        assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::Online);
        assert!(rx.try_recv().is_err());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_any_host_is_enough() {
        let probe = Arc::new(HostSetProbe {
            up: vec!["c"],
            calls: Mutex::new(Vec::new()),
        });
        let monitor =
            ConnectivityMonitor::new(probe.clone(), hosts(&["a", "b", "c", "d"]), NEVER, NEVER).await;
        assert!(monitor.is_online());
        // Stops at the first host that answers
        assert_eq!(*probe.calls.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_offline_only_when_all_fail() {
        let probe = Arc::new(HostSetProbe {
            up: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let monitor = ConnectivityMonitor::new(probe.clone(), hosts(&["a", "b"]), NEVER, NEVER).await;
        assert!(monitor.is_offline());
        assert_eq!(probe.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let probe = ScriptedProbe::new(&[true, false]);
        let monitor = ConnectivityMonitor::new(probe, hosts(&["a"]), NEVER, NEVER).await;
        let (id, mut rx) = monitor.subscribe();
        assert!(monitor.remove_listener(id));
        assert!(!monitor.remove_listener(id));
        monitor.check_now().await;
        assert!(monitor.is_offline());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_state_tracks_transition_time() {
        let probe = ScriptedProbe::new(&[true, false]);
        let monitor = ConnectivityMonitor::new(probe, hosts(&["a"]), NEVER, NEVER).await;
        let before = monitor.state();
        monitor.check_now().await;
        let after = monitor.state();
        assert!(!after.online);
        assert!(after.changed_at >= before.changed_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_schedule_probes() {
        let probe = ScriptedProbe::new(&[true, false]);
        let monitor =
            ConnectivityMonitor::new(probe, hosts(&["a"]), Duration::from_secs(10), NEVER).await;
        let (_, mut rx) = monitor.subscribe();

        assert_eq!(rx.recv().await, Some(ConnectivityEvent::Offline));
        assert!(monitor.is_offline());
    }

    #[tokio::test]
    async fn test_shutdown_stops_notifications() {
        let probe = ScriptedProbe::new(&[true, false]);
        let monitor = ConnectivityMonitor::new(probe, hosts(&["a"]), NEVER, NEVER).await;
        let (_, mut rx) = monitor.subscribe();
        monitor.shutdown();
        monitor.check_now().await;
        assert!(monitor.is_online());
        // Sender side was dropped with the listener list
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_in_flight_at_shutdown_is_discarded() {
        let probe = Arc::new(GatedProbe::default());
        let monitor = Arc::new(ConnectivityMonitor::new(probe.clone(), hosts(&["a"]), NEVER, NEVER).await);
        let (_, mut rx) = monitor.subscribe();

        let round = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            async move { monitor.check_now().await }
        });
        probe.entered.notified().await;
        monitor.shutdown();
        probe.release.notify_one();

        assert!(round.await.unwrap());
        assert!(monitor.is_online());
        assert!(monitor.state().online);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(TcpProbe.is_reachable(&addr, Duration::from_secs(1)).await);
        assert!(
            !TcpProbe
                .is_reachable("host.invalid:53", Duration::from_millis(500))
                .await
        );
    }
}
