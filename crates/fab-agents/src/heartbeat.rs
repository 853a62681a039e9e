//! Heartbeat monitor — nudge-then-kill silence detection (§4.D): an agent
//! that produces output cannot be killed before it has gone silent for
//! `kill_timeout`.
//!
//! Extends the teacher's staleness-only sweep (`at-daemon/src/heartbeat.rs`)
//! with the `{Normal, Warned}` transition spec requires, and drops the
//! teacher's `CacheDb`-backed persistence — this tracker is runtime-only;
//! restart recovery does not need to resume heartbeat state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fab_core::error::Result;
use uuid::Uuid;

/// Capability interface the monitor needs from whatever owns the live agent
/// processes — cuts the supervisor/orchestrator/manager cycle (spec §9)
/// rather than sharing a god object.
#[async_trait]
pub trait AgentHost: Send + Sync {
    async fn send_message(&self, agent_id: Uuid, message: &str) -> Result<()>;
    async fn stop_agent(&self, agent_id: Uuid) -> Result<()>;
    /// Ids of every agent the host currently considers active.
    async fn active_agents(&self) -> Vec<Uuid>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Normal,
    Warned,
}

#[derive(Debug, Clone)]
struct Tracker {
    last_output_time: DateTime<Utc>,
    state: HeartbeatState,
    #[allow(dead_code)]
    warned_at: Option<DateTime<Utc>>,
}

pub struct HeartbeatMonitor {
    host: Arc<dyn AgentHost>,
    trackers: RwLock<HashMap<Uuid, Tracker>>,
    check_interval: StdDuration,
    warn_timeout: chrono::Duration,
    kill_timeout: chrono::Duration,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(
        host: Arc<dyn AgentHost>,
        check_interval: StdDuration,
        warn_timeout: StdDuration,
        kill_timeout: StdDuration,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            trackers: RwLock::new(HashMap::new()),
            check_interval,
            warn_timeout: chrono::Duration::from_std(warn_timeout).unwrap_or_default(),
            kill_timeout: chrono::Duration::from_std(kill_timeout).unwrap_or_default(),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Called on every `ChatEntry` from `id` — resets silence tracking.
    pub fn record_output(&self, id: Uuid) {
        let now = Utc::now();
        let mut guard = self.trackers.write().unwrap();
        guard
            .entry(id)
            .and_modify(|t| {
                t.last_output_time = now;
                t.state = HeartbeatState::Normal;
                t.warned_at = None;
            })
            .or_insert(Tracker {
                last_output_time: now,
                state: HeartbeatState::Normal,
                warned_at: None,
            });
    }

    pub fn remove_agent(&self, id: Uuid) {
        self.trackers.write().unwrap().remove(&id);
    }

    /// Idempotent; restartable after [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) {
        let mut task_guard = self.task.lock().unwrap();
        if task_guard.is_some() {
            return;
        }
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.lock().unwrap() = Some(tx);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.check_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => this.sweep().await,
                    _ = &mut rx => break,
                }
            }
        });
        *task_guard = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn sweep(&self) {
        let now = Utc::now();
        let active = self.host.active_agents().await;

        {
            let mut guard = self.trackers.write().unwrap();
            for id in &active {
                guard.entry(*id).or_insert(Tracker {
                    last_output_time: now,
                    state: HeartbeatState::Normal,
                    warned_at: None,
                });
            }
        }

        let snapshot: Vec<(Uuid, Tracker)> = {
            let guard = self.trackers.read().unwrap();
            guard.iter().map(|(id, t)| (*id, t.clone())).collect()
        };

        for (id, tracker) in snapshot {
            let silence = now - tracker.last_output_time;
            match tracker.state {
                HeartbeatState::Normal if silence >= self.warn_timeout => {
                    match self.host.send_message(id, "continue").await {
                        Ok(()) => {
                            let mut guard = self.trackers.write().unwrap();
                            if let Some(t) = guard.get_mut(&id) {
                                t.state = HeartbeatState::Warned;
                                t.warned_at = Some(now);
                            }
                        }
                        Err(err) => tracing::warn!(
                            agent = %id, %err,
                            "failed to nudge silent agent, retrying next tick"
                        ),
                    }
                }
                HeartbeatState::Warned if silence >= self.kill_timeout => {
                    if let Err(err) = self.host.stop_agent(id).await {
                        tracing::warn!(agent = %id, %err, "failed to stop unresponsive agent");
                    }
                    self.trackers.write().unwrap().remove(&id);
                }
                _ => {}
            }
        }

        let active_set: HashSet<_> = active.into_iter().collect();
        self.trackers
            .write()
            .unwrap()
            .retain(|id, _| active_set.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockHost {
        active: Mutex<Vec<Uuid>>,
        sent: Mutex<Vec<(Uuid, String)>>,
        stopped: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl AgentHost for MockHost {
        async fn send_message(&self, agent_id: Uuid, message: &str) -> Result<()> {
            self.sent.lock().unwrap().push((agent_id, message.into()));
            Ok(())
        }
        async fn stop_agent(&self, agent_id: Uuid) -> Result<()> {
            self.stopped.lock().unwrap().push(agent_id);
            self.active.lock().unwrap().retain(|id| *id != agent_id);
            Ok(())
        }
        async fn active_agents(&self) -> Vec<Uuid> {
            self.active.lock().unwrap().clone()
        }
    }

    fn monitor(host: Arc<MockHost>) -> Arc<HeartbeatMonitor> {
        HeartbeatMonitor::new(
            host,
            StdDuration::from_secs(1),
            StdDuration::from_millis(0),
            StdDuration::from_millis(0),
        )
    }

    #[tokio::test]
    async fn fresh_output_keeps_agent_normal() {
        let agent = Uuid::new_v4();
        let host = Arc::new(MockHost {
            active: Mutex::new(vec![agent]),
            sent: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        });
        let mon = monitor(host.clone());
        mon.record_output(agent);
        // warn_timeout is 0 here only to exercise the transition path below;
        // this test instead asserts record_output seeds a fresh tracker.
        assert!(mon.trackers.read().unwrap().contains_key(&agent));
    }

    #[tokio::test]
    async fn silence_past_warn_timeout_nudges_once() {
        let agent = Uuid::new_v4();
        let host = Arc::new(MockHost {
            active: Mutex::new(vec![agent]),
            sent: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        });
        let mon = HeartbeatMonitor::new(
            host.clone(),
            StdDuration::from_secs(1),
            StdDuration::from_secs(0),
            StdDuration::from_secs(3600),
        );
        mon.sweep().await;
        mon.sweep().await;
        assert_eq!(host.sent.lock().unwrap().len(), 1);
        assert_eq!(host.sent.lock().unwrap()[0].1, "continue");
    }

    #[tokio::test]
    async fn silence_past_kill_timeout_after_warn_stops_agent() {
        let agent = Uuid::new_v4();
        let host = Arc::new(MockHost {
            active: Mutex::new(vec![agent]),
            sent: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        });
        let mon = HeartbeatMonitor::new(
            host.clone(),
            StdDuration::from_secs(1),
            StdDuration::from_secs(0),
            StdDuration::from_secs(0),
        );
        mon.sweep().await; // creates tracker
        mon.sweep().await; // warns
        mon.sweep().await; // kills
        assert_eq!(host.stopped.lock().unwrap().len(), 1);
        assert!(!mon.trackers.read().unwrap().contains_key(&agent));
    }

    #[tokio::test]
    async fn record_output_resets_warned_state_to_normal() {
        let agent = Uuid::new_v4();
        let host = Arc::new(MockHost {
            active: Mutex::new(vec![agent]),
            sent: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        });
        let mon = HeartbeatMonitor::new(
            host.clone(),
            StdDuration::from_secs(1),
            StdDuration::from_secs(0),
            StdDuration::from_secs(3600),
        );
        mon.sweep().await;
        mon.sweep().await;
        assert_eq!(
            mon.trackers.read().unwrap().get(&agent).unwrap().state,
            HeartbeatState::Warned
        );
        mon.record_output(agent);
        assert_eq!(
            mon.trackers.read().unwrap().get(&agent).unwrap().state,
            HeartbeatState::Normal
        );
    }

    #[tokio::test]
    async fn tracker_removed_once_agent_no_longer_active() {
        let agent = Uuid::new_v4();
        let host = Arc::new(MockHost {
            active: Mutex::new(vec![agent]),
            sent: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        });
        let mon = monitor(host.clone());
        mon.sweep().await;
        assert!(mon.trackers.read().unwrap().contains_key(&agent));
        host.active.lock().unwrap().clear();
        mon.sweep().await;
        assert!(!mon.trackers.read().unwrap().contains_key(&agent));
    }
}
