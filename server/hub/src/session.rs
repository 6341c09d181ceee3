//! Live repeater session state, kept in the session store under
//! `hbrp:repeater:<RadioID>` with a five-minute TTL. The row in the
//! relational store is the durable identity; this record is the in-flight
//! protocol state fetched, mutated, and re-stored per packet.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use rx_bus::{keys, SessionStore};

pub const SESSION_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    ChallengeSent,
    WaitingConfig,
    Connected,
    Disconnected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepeaterSession {
    pub radio_id: u32,
    pub addr: SocketAddr,
    pub salt: u32,
    pub state: ConnectionState,
    pub last_ping: DateTime<Utc>,
    pub ts1_static: Vec<u32>,
    pub ts2_static: Vec<u32>,
    pub ts1_dynamic: Option<u32>,
    pub ts2_dynamic: Option<u32>,
}

impl RepeaterSession {
    pub fn new(radio_id: u32, addr: SocketAddr, salt: u32) -> Self {
        RepeaterSession {
            radio_id,
            addr,
            salt,
            state: ConnectionState::ChallengeSent,
            last_ping: Utc::now(),
            ts1_static: Vec::new(),
            ts2_static: Vec::new(),
            ts1_dynamic: None,
            ts2_dynamic: None,
        }
    }

    /// Does this repeater currently want traffic for `tg`, and on which
    /// slot? Static TS1, static TS2, dynamic TS2, dynamic TS1; first match
    /// wins.
    pub fn wants_talkgroup(&self, tg: u32) -> Option<bool> {
        if self.ts1_static.contains(&tg) {
            return Some(false);
        }
        if self.ts2_static.contains(&tg) {
            return Some(true);
        }
        if self.ts2_dynamic == Some(tg) {
            return Some(true);
        }
        if self.ts1_dynamic == Some(tg) {
            return Some(false);
        }
        None
    }

    /// Every talkgroup this session should hold a listener for.
    pub fn subscribed_talkgroups(&self) -> Vec<u32> {
        let mut tgs: Vec<u32> = self
            .ts1_static
            .iter()
            .chain(self.ts2_static.iter())
            .copied()
            .chain(self.ts1_dynamic)
            .chain(self.ts2_dynamic)
            .collect();
        tgs.sort_unstable();
        tgs.dedup();
        tgs
    }

    /// True while a cancel for `tg` must be refused: static members and the
    /// current dynamic talkgroup on either slot stay linked.
    pub fn holds_talkgroup(&self, tg: u32) -> bool {
        self.ts1_static.contains(&tg)
            || self.ts2_static.contains(&tg)
            || self.ts1_dynamic == Some(tg)
            || self.ts2_dynamic == Some(tg)
    }
}

/// Typed accessor over the raw session store.
#[derive(Clone)]
pub struct Sessions {
    store: Arc<dyn SessionStore>,
}

impl Sessions {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn load(&self, radio_id: u32) -> Option<RepeaterSession> {
        let raw = match self.store.get(&keys::repeater_session(radio_id)).await {
            Ok(v) => v?,
            Err(e) => {
                warn!(radio_id, "session store get failed: {e}");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(radio_id, "corrupt session record: {e}");
                None
            }
        }
    }

    pub async fn save(&self, session: &RepeaterSession) {
        let raw = match serde_json::to_vec(session) {
            Ok(v) => Bytes::from(v),
            Err(e) => {
                warn!(radio_id = session.radio_id, "session encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&keys::repeater_session(session.radio_id), raw, SESSION_TTL)
            .await
        {
            warn!(radio_id = session.radio_id, "session store set failed: {e}");
        }
    }

    pub async fn remove(&self, radio_id: u32) {
        if let Err(e) = self.store.delete(&keys::repeater_session(radio_id)).await {
            warn!(radio_id, "session store delete failed: {e}");
        }
    }

    pub async fn registered(&self, radio_id: u32) -> bool {
        matches!(
            self.load(radio_id).await,
            Some(RepeaterSession { state: ConnectionState::Connected, .. })
        )
    }

    /// All live sessions, in no particular order.
    pub async fn all(&self) -> Vec<RepeaterSession> {
        let keys = match self.store.scan(keys::REPEATER_PREFIX).await {
            Ok(k) => k,
            Err(e) => {
                warn!("session scan failed: {e}");
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(id) = key.strip_prefix(keys::REPEATER_PREFIX).and_then(|s| s.parse().ok()) {
                if let Some(session) = self.load(id).await {
                    out.push(session);
                }
            }
        }
        out
    }
}
