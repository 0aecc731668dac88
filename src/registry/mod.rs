//! Service registry: in-process membership map.
//!
//! Components register into named groups with capability tags and refresh
//! their membership by heartbeat. Members whose heartbeat goes stale past
//! the configured timeout are pruned by the expiry sweep, so the membership
//! view only ever shows components that are actually alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RegistryConfig;

#[derive(Debug, Clone)]
pub struct Member {
    pub id: String,
    pub tags: Vec<String>,
}

struct MemberState {
    tags: Vec<String>,
    last_heartbeat: Instant,
}

pub struct ServiceRegistry {
    groups: Mutex<HashMap<String, HashMap<String, MemberState>>>,
    timeout: Duration,
    sweep_interval: Duration,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(HashMap::new()),
            timeout: Duration::from_secs(config.heartbeat_timeout_secs.max(1)),
            sweep_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        })
    }

    /// Join a group. Re-registering refreshes the heartbeat and replaces the
    /// member's tags.
    pub fn register(&self, group: &str, member_id: &str, tags: &[&str]) {
        let mut groups = self.groups.lock().expect("registry mutex poisoned");
        let members = groups.entry(group.to_string()).or_default();
        let fresh = members
            .insert(
                member_id.to_string(),
                MemberState {
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    last_heartbeat: Instant::now(),
                },
            )
            .is_none();
        if fresh {
            info!(group, member = member_id, "member joined");
        }
    }

    /// Refresh a membership. Returns false when the member is not registered
    /// (expired or never joined); the caller should re-register.
    pub fn heartbeat(&self, group: &str, member_id: &str) -> bool {
        let mut groups = self.groups.lock().expect("registry mutex poisoned");
        match groups.get_mut(group).and_then(|m| m.get_mut(member_id)) {
            Some(state) => {
                state.last_heartbeat = Instant::now();
                true
            }
            None => {
                warn!(group, member = member_id, "heartbeat from unknown member");
                false
            }
        }
    }

    pub fn unregister(&self, group: &str, member_id: &str) {
        let mut groups = self.groups.lock().expect("registry mutex poisoned");
        if let Some(members) = groups.get_mut(group) {
            if members.remove(member_id).is_some() {
                info!(group, member = member_id, "member left");
            }
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    pub fn groups(&self) -> Vec<String> {
        let groups = self.groups.lock().expect("registry mutex poisoned");
        let mut names: Vec<String> = groups.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn members(&self, group: &str) -> Vec<Member> {
        let groups = self.groups.lock().expect("registry mutex poisoned");
        let mut members: Vec<Member> = groups
            .get(group)
            .map(|m| {
                m.iter()
                    .map(|(id, state)| Member {
                        id: id.clone(),
                        tags: state.tags.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// Drop members whose last heartbeat is older than the timeout. Returns
    /// how many were pruned.
    pub fn prune_expired(&self) -> usize {
        let mut groups = self.groups.lock().expect("registry mutex poisoned");
        let mut pruned = 0;
        groups.retain(|group, members| {
            members.retain(|id, state| {
                let alive = state.last_heartbeat.elapsed() < self.timeout;
                if !alive {
                    debug!(group, member = %id, "membership expired");
                    pruned += 1;
                }
                alive
            });
            !members.is_empty()
        });
        pruned
    }

    pub async fn run_expiry_sweep(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.sweep_interval).await;
            let pruned = self.prune_expired();
            if pruned > 0 {
                info!(pruned, "expired stale memberships");
            }
        }
    }
}
