use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Online/offline flag shared between the write path and the resync engine.
/// Only two states exist; callers observe nothing finer than `is_offline`.
#[derive(Debug)]
pub struct ConnectivityState {
    offline: AtomicBool,
}

impl ConnectivityState {
    pub fn new(initial: Connectivity) -> Self {
        Self {
            offline: AtomicBool::new(initial == Connectivity::Offline),
        }
    }

    pub fn current(&self) -> Connectivity {
        if self.is_offline() {
            Connectivity::Offline
        } else {
            Connectivity::Online
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Returns true when this call performed the Online -> Offline transition.
    pub fn go_offline(&self, reason: &str) -> bool {
        let transitioned = !self.offline.swap(true, Ordering::SeqCst);
        if transitioned {
            tracing::warn!(reason = %reason, "backing store unreachable; switching to offline mode");
        }
        transitioned
    }

    /// Returns true when this call performed the Offline -> Online transition.
    pub fn go_online(&self) -> bool {
        let transitioned = self.offline.swap(false, Ordering::SeqCst);
        if transitioned {
            tracing::info!("backing store reachable again; leaving offline mode");
        }
        transitioned
    }
}
