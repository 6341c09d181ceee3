//! In-memory datastore for tests and single-node development runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    errors::ControlResult,
    ids::{CallId, PeerId, RadioId, TalkgroupId, UserId},
    model::{CallRecord, Peer, Repeater, Talkgroup, User},
    repo::HubRepo,
};

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    repeaters: HashMap<RadioId, Repeater>,
    talkgroups: HashMap<TalkgroupId, Talkgroup>,
    peers: HashMap<PeerId, Peer>,
    calls: Vec<CallRecord>,
}

#[derive(Default)]
pub struct MemoryHubRepo {
    inner: RwLock<Inner>,
}

impl MemoryHubRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: User) {
        self.inner.write().users.insert(user.id, user);
    }

    pub fn add_repeater(&self, repeater: Repeater) {
        self.inner.write().repeaters.insert(repeater.id, repeater);
    }

    pub fn add_talkgroup(&self, talkgroup: Talkgroup) {
        self.inner.write().talkgroups.insert(talkgroup.id, talkgroup);
    }

    pub fn add_peer(&self, peer: Peer) {
        self.inner.write().peers.insert(peer.id, peer);
    }

    pub fn call_count(&self) -> usize {
        self.inner.read().calls.len()
    }

    pub fn find_call(&self, id: CallId) -> Option<CallRecord> {
        self.inner.read().calls.iter().find(|c| c.id == id).cloned()
    }
}

#[async_trait]
impl HubRepo for MemoryHubRepo {
    async fn user_exists(&self, id: UserId) -> ControlResult<bool> {
        Ok(self.inner.read().users.contains_key(&id))
    }

    async fn get_user(&self, id: UserId) -> ControlResult<Option<User>> {
        Ok(self.inner.read().users.get(&id).cloned())
    }

    async fn repeater_exists(&self, id: RadioId) -> ControlResult<bool> {
        Ok(self.inner.read().repeaters.contains_key(&id))
    }

    async fn get_repeater(&self, id: RadioId) -> ControlResult<Option<Repeater>> {
        Ok(self.inner.read().repeaters.get(&id).cloned())
    }

    async fn save_repeater(&self, repeater: &Repeater) -> ControlResult<()> {
        self.inner.write().repeaters.insert(repeater.id, repeater.clone());
        Ok(())
    }

    async fn list_repeaters_for_owner(&self, owner: UserId) -> ControlResult<Vec<Repeater>> {
        let mut out: Vec<Repeater> = self
            .inner
            .read()
            .repeaters
            .values()
            .filter(|r| r.owner_id == owner)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn talkgroup_exists(&self, id: TalkgroupId) -> ControlResult<bool> {
        Ok(self.inner.read().talkgroups.contains_key(&id))
    }

    async fn get_talkgroup(&self, id: TalkgroupId) -> ControlResult<Option<Talkgroup>> {
        Ok(self.inner.read().talkgroups.get(&id).cloned())
    }

    async fn get_peer(&self, id: PeerId) -> ControlResult<Option<Peer>> {
        Ok(self.inner.read().peers.get(&id).cloned())
    }

    async fn list_peers(&self) -> ControlResult<Vec<Peer>> {
        let mut out: Vec<Peer> = self.inner.read().peers.values().cloned().collect();
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    async fn create_call(&self, call: &CallRecord) -> ControlResult<()> {
        self.inner.write().calls.push(call.clone());
        Ok(())
    }

    async fn save_call(&self, call: &CallRecord) -> ControlResult<()> {
        let mut inner = self.inner.write();
        match inner.calls.iter_mut().find(|c| c.id == call.id) {
            Some(slot) => *slot = call.clone(),
            None => inner.calls.push(call.clone()),
        }
        Ok(())
    }

    async fn delete_call(&self, id: CallId) -> ControlResult<()> {
        self.inner.write().calls.retain(|c| c.id != id);
        Ok(())
    }

    async fn last_call_for_user(&self, user: UserId) -> ControlResult<Option<CallRecord>> {
        Ok(self
            .inner
            .read()
            .calls
            .iter()
            .filter(|c| c.user_id == user)
            .max_by_key(|c| c.start_time)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CallTarget;
    use chrono::{Duration, Utc};

    fn call(user: u32, repeater: u32, start_offset_s: i64) -> CallRecord {
        let t = Utc::now() + Duration::seconds(start_offset_s);
        CallRecord {
            id: CallId::new(),
            stream_id: 1,
            user_id: UserId(user),
            repeater_id: RadioId(repeater),
            target: CallTarget::Talkgroup(TalkgroupId(91)),
            start_time: t,
            last_packet_time: t,
            duration_ms: 0,
            active: true,
            time_slot: false,
            group_call: true,
            last_seq: None,
            last_frame_num: 0,
            total_packets: 0,
            lost_sequences: 0,
            loss: 0.0,
            jitter: 0.0,
            total_bits: 0,
            total_errors: 0,
            ber: 0.0,
            rssi: 0.0,
            has_header: false,
            has_term: false,
        }
    }

    #[tokio::test]
    async fn last_call_picks_most_recent() {
        let repo = MemoryHubRepo::new();
        let older = call(1_000_001, 100_001, -60);
        let newer = call(1_000_001, 100_002, 0);
        repo.create_call(&older).await.unwrap();
        repo.create_call(&newer).await.unwrap();
        repo.create_call(&call(1_000_002, 100_003, 10)).await.unwrap();

        let last = repo.last_call_for_user(UserId(1_000_001)).await.unwrap().unwrap();
        assert_eq!(last.id, newer.id);
        assert_eq!(last.repeater_id, RadioId(100_002));
    }

    #[tokio::test]
    async fn delete_call_removes_row() {
        let repo = MemoryHubRepo::new();
        let c = call(1_000_001, 100_001, 0);
        repo.create_call(&c).await.unwrap();
        assert_eq!(repo.call_count(), 1);
        repo.delete_call(c.id).await.unwrap();
        assert_eq!(repo.call_count(), 0);
    }

    #[tokio::test]
    async fn save_call_upserts() {
        let repo = MemoryHubRepo::new();
        let mut c = call(1_000_001, 100_001, 0);
        repo.create_call(&c).await.unwrap();
        c.total_packets = 7;
        c.active = false;
        repo.save_call(&c).await.unwrap();
        let stored = repo.find_call(c.id).unwrap();
        assert_eq!(stored.total_packets, 7);
        assert!(!stored.active);
        assert_eq!(repo.call_count(), 1);
    }
}
