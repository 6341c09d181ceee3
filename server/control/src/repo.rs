use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::{
    errors::ControlResult,
    ids::{CallId, PeerId, RadioId, TalkgroupId, UserId},
    model::{CallRecord, CallTarget, Peer, PeerRule, Repeater, RuleDirection, Talkgroup, User},
};

/// Narrow query surface the hub needs from the relational datastore.
#[async_trait]
pub trait HubRepo: Send + Sync {
    // Users
    async fn user_exists(&self, id: UserId) -> ControlResult<bool>;
    async fn get_user(&self, id: UserId) -> ControlResult<Option<User>>;

    // Repeaters
    async fn repeater_exists(&self, id: RadioId) -> ControlResult<bool>;
    async fn get_repeater(&self, id: RadioId) -> ControlResult<Option<Repeater>>;
    async fn save_repeater(&self, repeater: &Repeater) -> ControlResult<()>;
    async fn list_repeaters_for_owner(&self, owner: UserId) -> ControlResult<Vec<Repeater>>;

    // Talkgroups
    async fn talkgroup_exists(&self, id: TalkgroupId) -> ControlResult<bool>;
    async fn get_talkgroup(&self, id: TalkgroupId) -> ControlResult<Option<Talkgroup>>;

    // OpenBridge peers
    async fn get_peer(&self, id: PeerId) -> ControlResult<Option<Peer>>;
    async fn list_peers(&self) -> ControlResult<Vec<Peer>>;

    // Call history
    async fn create_call(&self, call: &CallRecord) -> ControlResult<()>;
    async fn save_call(&self, call: &CallRecord) -> ControlResult<()>;
    async fn delete_call(&self, id: CallId) -> ControlResult<()>;
    async fn last_call_for_user(&self, user: UserId) -> ControlResult<Option<CallRecord>>;
}

#[derive(Clone)]
pub struct PgHubRepo {
    pool: PgPool,
}

impl PgHubRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn rules_for(&self, peer: PeerId) -> ControlResult<(Vec<PeerRule>, Vec<PeerRule>)> {
        let rows = sqlx::query(
            r#"
            SELECT peer_id, direction, subject_id_min, subject_id_max
            FROM peer_rules
            WHERE peer_id = $1
            "#,
        )
        .bind(peer.0 as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut ingress = Vec::new();
        let mut egress = Vec::new();
        for r in rows {
            let direction = match r.get::<&str, _>("direction") {
                "egress" => RuleDirection::Egress,
                _ => RuleDirection::Ingress,
            };
            let rule = PeerRule {
                peer_id: PeerId(r.get::<i64, _>("peer_id") as u32),
                direction,
                subject_id_min: r.get::<i64, _>("subject_id_min") as u32,
                subject_id_max: r.get::<i64, _>("subject_id_max") as u32,
            };
            match direction {
                RuleDirection::Ingress => ingress.push(rule),
                RuleDirection::Egress => egress.push(rule),
            }
        }
        Ok((ingress, egress))
    }
}

fn repeater_from_row(r: &sqlx::postgres::PgRow) -> Repeater {
    Repeater {
        id: RadioId(r.get::<i64, _>("id") as u32),
        owner_id: UserId(r.get::<i64, _>("owner_id") as u32),
        password: r.get::<String, _>("password"),
        ip: r.get::<Option<String>, _>("ip"),
        port: r.get::<Option<i32>, _>("port"),
        callsign: r.get::<String, _>("callsign"),
        rx_freq: r.get::<i64, _>("rx_freq"),
        tx_freq: r.get::<i64, _>("tx_freq"),
        tx_power: r.get::<i16, _>("tx_power"),
        color_code: r.get::<i16, _>("color_code"),
        latitude: r.get::<f32, _>("latitude"),
        longitude: r.get::<f32, _>("longitude"),
        height: r.get::<i16, _>("height"),
        location: r.get::<String, _>("location"),
        description: r.get::<String, _>("description"),
        slots: r.get::<i16, _>("slots"),
        url: r.get::<String, _>("url"),
        software_id: r.get::<String, _>("software_id"),
        package_id: r.get::<String, _>("package_id"),
        ts1_static: tg_vec(r.get::<Vec<i64>, _>("ts1_static")),
        ts2_static: tg_vec(r.get::<Vec<i64>, _>("ts2_static")),
        ts1_dynamic: r.get::<Option<i64>, _>("ts1_dynamic").map(|v| TalkgroupId(v as u32)),
        ts2_dynamic: r.get::<Option<i64>, _>("ts2_dynamic").map(|v| TalkgroupId(v as u32)),
        last_ping: r.get::<Option<DateTime<Utc>>, _>("last_ping"),
    }
}

fn tg_vec(raw: Vec<i64>) -> Vec<TalkgroupId> {
    raw.into_iter().map(|v| TalkgroupId(v as u32)).collect()
}

fn call_from_row(r: &sqlx::postgres::PgRow) -> CallRecord {
    let target = if let Some(tg) = r.get::<Option<i64>, _>("dest_talkgroup_id") {
        CallTarget::Talkgroup(TalkgroupId(tg as u32))
    } else if let Some(u) = r.get::<Option<i64>, _>("dest_user_id") {
        CallTarget::User(UserId(u as u32))
    } else {
        CallTarget::Repeater(RadioId(r.get::<Option<i64>, _>("dest_repeater_id").unwrap_or(0) as u32))
    };

    CallRecord {
        id: CallId(r.get("id")),
        stream_id: r.get::<i64, _>("stream_id") as u32,
        user_id: UserId(r.get::<i64, _>("user_id") as u32),
        repeater_id: RadioId(r.get::<i64, _>("repeater_id") as u32),
        target,
        start_time: r.get("start_time"),
        last_packet_time: r.get("last_packet_time"),
        duration_ms: r.get("duration_ms"),
        active: r.get("active"),
        time_slot: r.get("time_slot"),
        group_call: r.get("group_call"),
        last_seq: r.get::<Option<i16>, _>("last_seq").map(|v| v as u8),
        last_frame_num: r.get::<i16, _>("last_frame_num") as u8,
        total_packets: r.get::<i64, _>("total_packets") as u32,
        lost_sequences: r.get::<i64, _>("lost_sequences") as u32,
        loss: r.get("loss"),
        jitter: r.get("jitter"),
        total_bits: r.get::<i64, _>("total_bits") as u32,
        total_errors: r.get::<i64, _>("total_errors") as u32,
        ber: r.get("ber"),
        rssi: r.get("rssi"),
        has_header: r.get("has_header"),
        has_term: r.get("has_term"),
    }
}

fn call_target_columns(call: &CallRecord) -> (Option<i64>, Option<i64>, Option<i64>) {
    match call.target {
        CallTarget::Talkgroup(tg) => (Some(tg.0 as i64), None, None),
        CallTarget::User(u) => (None, Some(u.0 as i64), None),
        CallTarget::Repeater(r) => (None, None, Some(r.0 as i64)),
    }
}

#[async_trait]
impl HubRepo for PgHubRepo {
    async fn user_exists(&self, id: UserId) -> ControlResult<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM users WHERE id = $1")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_user(&self, id: UserId) -> ControlResult<Option<User>> {
        let row = sqlx::query("SELECT id, callsign, approved FROM users WHERE id = $1")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| User {
            id: UserId(r.get::<i64, _>("id") as u32),
            callsign: r.get::<String, _>("callsign"),
            approved: r.get::<bool, _>("approved"),
        }))
    }

    async fn repeater_exists(&self, id: RadioId) -> ControlResult<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM repeaters WHERE id = $1")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_repeater(&self, id: RadioId) -> ControlResult<Option<Repeater>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, password, ip, port, callsign, rx_freq, tx_freq,
                   tx_power, color_code, latitude, longitude, height, location,
                   description, slots, url, software_id, package_id,
                   ts1_static, ts2_static, ts1_dynamic, ts2_dynamic, last_ping
            FROM repeaters
            WHERE id = $1
            "#,
        )
        .bind(id.0 as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| repeater_from_row(&r)))
    }

    async fn save_repeater(&self, repeater: &Repeater) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO repeaters (id, owner_id, password, ip, port, callsign, rx_freq,
                                   tx_freq, tx_power, color_code, latitude, longitude,
                                   height, location, description, slots, url,
                                   software_id, package_id, ts1_static, ts2_static,
                                   ts1_dynamic, ts2_dynamic, last_ping, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, NOW())
            ON CONFLICT (id) DO UPDATE SET
              ip = EXCLUDED.ip,
              port = EXCLUDED.port,
              callsign = EXCLUDED.callsign,
              rx_freq = EXCLUDED.rx_freq,
              tx_freq = EXCLUDED.tx_freq,
              tx_power = EXCLUDED.tx_power,
              color_code = EXCLUDED.color_code,
              latitude = EXCLUDED.latitude,
              longitude = EXCLUDED.longitude,
              height = EXCLUDED.height,
              location = EXCLUDED.location,
              description = EXCLUDED.description,
              slots = EXCLUDED.slots,
              url = EXCLUDED.url,
              software_id = EXCLUDED.software_id,
              package_id = EXCLUDED.package_id,
              ts1_static = EXCLUDED.ts1_static,
              ts2_static = EXCLUDED.ts2_static,
              ts1_dynamic = EXCLUDED.ts1_dynamic,
              ts2_dynamic = EXCLUDED.ts2_dynamic,
              last_ping = EXCLUDED.last_ping,
              updated_at = NOW()
            "#,
        )
        .bind(repeater.id.0 as i64)
        .bind(repeater.owner_id.0 as i64)
        .bind(&repeater.password)
        .bind(&repeater.ip)
        .bind(repeater.port)
        .bind(&repeater.callsign)
        .bind(repeater.rx_freq)
        .bind(repeater.tx_freq)
        .bind(repeater.tx_power)
        .bind(repeater.color_code)
        .bind(repeater.latitude)
        .bind(repeater.longitude)
        .bind(repeater.height)
        .bind(&repeater.location)
        .bind(&repeater.description)
        .bind(repeater.slots)
        .bind(&repeater.url)
        .bind(&repeater.software_id)
        .bind(&repeater.package_id)
        .bind(repeater.ts1_static.iter().map(|t| t.0 as i64).collect::<Vec<_>>())
        .bind(repeater.ts2_static.iter().map(|t| t.0 as i64).collect::<Vec<_>>())
        .bind(repeater.ts1_dynamic.map(|t| t.0 as i64))
        .bind(repeater.ts2_dynamic.map(|t| t.0 as i64))
        .bind(repeater.last_ping)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_repeaters_for_owner(&self, owner: UserId) -> ControlResult<Vec<Repeater>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, password, ip, port, callsign, rx_freq, tx_freq,
                   tx_power, color_code, latitude, longitude, height, location,
                   description, slots, url, software_id, package_id,
                   ts1_static, ts2_static, ts1_dynamic, ts2_dynamic, last_ping
            FROM repeaters
            WHERE owner_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(owner.0 as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(repeater_from_row).collect())
    }

    async fn talkgroup_exists(&self, id: TalkgroupId) -> ControlResult<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM talkgroups WHERE id = $1")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_talkgroup(&self, id: TalkgroupId) -> ControlResult<Option<Talkgroup>> {
        let row = sqlx::query("SELECT id, name, description FROM talkgroups WHERE id = $1")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Talkgroup {
            id: TalkgroupId(r.get::<i64, _>("id") as u32),
            name: r.get::<String, _>("name"),
            description: r.get::<String, _>("description"),
        }))
    }

    async fn get_peer(&self, id: PeerId) -> ControlResult<Option<Peer>> {
        let row = sqlx::query(
            "SELECT id, owner_id, password, ip, port, ingress, egress FROM peers WHERE id = $1",
        )
        .bind(id.0 as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else { return Ok(None) };
        let (ingress_rules, egress_rules) = self.rules_for(id).await?;

        Ok(Some(Peer {
            id: PeerId(r.get::<i64, _>("id") as u32),
            owner_id: UserId(r.get::<i64, _>("owner_id") as u32),
            password: r.get::<String, _>("password"),
            ip: r.get::<Option<String>, _>("ip"),
            port: r.get::<Option<i32>, _>("port"),
            ingress: r.get::<bool, _>("ingress"),
            egress: r.get::<bool, _>("egress"),
            ingress_rules,
            egress_rules,
        }))
    }

    async fn list_peers(&self) -> ControlResult<Vec<Peer>> {
        let rows = sqlx::query("SELECT id FROM peers ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut peers = Vec::with_capacity(rows.len());
        for r in rows {
            let id = PeerId(r.get::<i64, _>("id") as u32);
            if let Some(peer) = self.get_peer(id).await? {
                peers.push(peer);
            }
        }
        Ok(peers)
    }

    async fn create_call(&self, call: &CallRecord) -> ControlResult<()> {
        let (tg, user, rptr) = call_target_columns(call);
        sqlx::query(
            r#"
            INSERT INTO calls (id, stream_id, user_id, repeater_id, dest_talkgroup_id,
                               dest_user_id, dest_repeater_id, start_time,
                               last_packet_time, duration_ms, active, time_slot,
                               group_call, last_seq, last_frame_num, total_packets,
                               lost_sequences, loss, jitter, total_bits, total_errors,
                               ber, rssi, has_header, has_term)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
            "#,
        )
        .bind(call.id.0)
        .bind(call.stream_id as i64)
        .bind(call.user_id.0 as i64)
        .bind(call.repeater_id.0 as i64)
        .bind(tg)
        .bind(user)
        .bind(rptr)
        .bind(call.start_time)
        .bind(call.last_packet_time)
        .bind(call.duration_ms)
        .bind(call.active)
        .bind(call.time_slot)
        .bind(call.group_call)
        .bind(call.last_seq.map(|v| v as i16))
        .bind(call.last_frame_num as i16)
        .bind(call.total_packets as i64)
        .bind(call.lost_sequences as i64)
        .bind(call.loss)
        .bind(call.jitter)
        .bind(call.total_bits as i64)
        .bind(call.total_errors as i64)
        .bind(call.ber)
        .bind(call.rssi)
        .bind(call.has_header)
        .bind(call.has_term)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_call(&self, call: &CallRecord) -> ControlResult<()> {
        let (tg, user, rptr) = call_target_columns(call);
        sqlx::query(
            r#"
            UPDATE calls SET
              dest_talkgroup_id = $2, dest_user_id = $3, dest_repeater_id = $4,
              last_packet_time = $5, duration_ms = $6, active = $7, last_seq = $8,
              last_frame_num = $9, total_packets = $10, lost_sequences = $11,
              loss = $12, jitter = $13, total_bits = $14, total_errors = $15,
              ber = $16, rssi = $17, has_header = $18, has_term = $19
            WHERE id = $1
            "#,
        )
        .bind(call.id.0)
        .bind(tg)
        .bind(user)
        .bind(rptr)
        .bind(call.last_packet_time)
        .bind(call.duration_ms)
        .bind(call.active)
        .bind(call.last_seq.map(|v| v as i16))
        .bind(call.last_frame_num as i16)
        .bind(call.total_packets as i64)
        .bind(call.lost_sequences as i64)
        .bind(call.loss)
        .bind(call.jitter)
        .bind(call.total_bits as i64)
        .bind(call.total_errors as i64)
        .bind(call.ber)
        .bind(call.rssi)
        .bind(call.has_header)
        .bind(call.has_term)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_call(&self, id: CallId) -> ControlResult<()> {
        sqlx::query("DELETE FROM calls WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_call_for_user(&self, user: UserId) -> ControlResult<Option<CallRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, stream_id, user_id, repeater_id, dest_talkgroup_id, dest_user_id,
                   dest_repeater_id, start_time, last_packet_time, duration_ms, active,
                   time_slot, group_call, last_seq, last_frame_num, total_packets,
                   lost_sequences, loss, jitter, total_bits, total_errors, ber, rssi,
                   has_header, has_term
            FROM calls
            WHERE user_id = $1
            ORDER BY start_time DESC
            LIMIT 1
            "#,
        )
        .bind(user.0 as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| call_from_row(&r)))
    }
}
