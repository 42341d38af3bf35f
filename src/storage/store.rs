//! Durable SQLite mapping store.
//!
//! # Schema
//! - `messages`: cross-platform id mappings, unique on (channel, wa_id)
//!   and (channel, signal_id).
//! - `media`: content-addressed attachment rows, keyed by fingerprint.
//! - `contacts`: cached display names with fetch timestamps.
//! - `seen`: per-source-id tombstones written before dispatch.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON. PRAGMA integrity_check runs at open; returns error if
//! it fails.
//!
//! Timestamps are RFC 3339 UTC TEXT with a fixed format, so string
//! comparison orders them correctly.

use crate::envelope::{Direction, MediaKind, Platform};
use crate::error::BridgeError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

/// Rows deleted per sweep transaction; caps lock-hold time.
const SWEEP_BATCH: usize = 1000;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A persistent mapping between a WhatsApp message id and its Signal
/// counterpart within one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMapping {
    pub channel: String,
    pub wa_id: String,
    pub signal_id: String,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub thread_root_wa: Option<String>,
    pub thread_root_signal: Option<String>,
    pub media_fingerprint: Option<String>,
}

impl MessageMapping {
    /// The id the mapping is keyed by on `platform`.
    pub fn id_on(&self, platform: Platform) -> &str {
        match platform {
            Platform::WhatsApp => &self.wa_id,
            Platform::Signal => &self.signal_id,
        }
    }
}

/// A content-addressed media artifact row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaArtifact {
    pub fingerprint: String,
    pub mime: String,
    pub size_bytes: u64,
    pub kind: MediaKind,
    pub local_path: String,
    pub created_at: DateTime<Utc>,
}

/// A cached contact row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRow {
    pub handle: String,
    pub display_name: String,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of a retention sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted_mappings: u64,
    pub deleted_seen: u64,
    pub deleted_contacts: u64,
    /// Fingerprints referenced only by deleted rows; the media cache
    /// garbage-collects these.
    pub orphaned_fingerprints: Vec<String>,
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, BridgeError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| BridgeError::StorageFatal(format!("bad timestamp '{s}': {e}")))
}

// ---------------------------------------------------------------------------
// MessageStore
// ---------------------------------------------------------------------------

/// The durable store for mappings, media rows, contacts, and tombstones.
pub struct MessageStore {
    conn: Connection,
}

impl MessageStore {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables
    /// if needed.
    pub fn open(path: &Path) -> Result<Self, BridgeError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, BridgeError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, BridgeError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        let check: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if check != "ok" {
            return Err(BridgeError::StorageFatal(format!(
                "integrity check failed: {check}"
            )));
        }
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(MessageStore { conn })
    }

    // -----------------------------------------------------------------------
    // Mappings
    // -----------------------------------------------------------------------

    /// Insert a mapping, or refresh `last_seen_at` if the identical pair is
    /// already recorded. Fails with `Conflict` if either id is already
    /// bound to a different counterpart in the channel.
    pub fn record(&mut self, mapping: &MessageMapping) -> Result<(), BridgeError> {
        if let Some(existing) = self.lookup_by_wa(&mapping.channel, &mapping.wa_id)? {
            if existing.signal_id == mapping.signal_id {
                return self.touch(&mapping.channel, Platform::WhatsApp, &mapping.wa_id, mapping.last_seen_at);
            }
            return Err(BridgeError::Conflict(format!(
                "wa_id '{}' already mapped to a different counterpart in channel '{}'",
                mapping.wa_id, mapping.channel
            )));
        }
        if self
            .lookup_by_signal(&mapping.channel, &mapping.signal_id)?
            .is_some()
        {
            // wa_id differs, otherwise the branch above returned.
            return Err(BridgeError::Conflict(format!(
                "signal_id '{}' already mapped to a different counterpart in channel '{}'",
                mapping.signal_id, mapping.channel
            )));
        }
        self.conn.execute(
            "INSERT INTO messages
                 (channel, wa_id, signal_id, direction, created_at, last_seen_at,
                  thread_root_wa, thread_root_signal, media_fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                mapping.channel,
                mapping.wa_id,
                mapping.signal_id,
                mapping.direction.as_str(),
                ts(mapping.created_at),
                ts(mapping.last_seen_at),
                mapping.thread_root_wa,
                mapping.thread_root_signal,
                mapping.media_fingerprint,
            ],
        )?;
        Ok(())
    }

    pub fn lookup_by_wa(
        &self,
        channel: &str,
        wa_id: &str,
    ) -> Result<Option<MessageMapping>, BridgeError> {
        self.lookup("wa_id", channel, wa_id)
    }

    pub fn lookup_by_signal(
        &self,
        channel: &str,
        signal_id: &str,
    ) -> Result<Option<MessageMapping>, BridgeError> {
        self.lookup("signal_id", channel, signal_id)
    }

    /// Lookup by the id native to `platform`.
    pub fn lookup_by_platform(
        &self,
        channel: &str,
        platform: Platform,
        id: &str,
    ) -> Result<Option<MessageMapping>, BridgeError> {
        match platform {
            Platform::WhatsApp => self.lookup_by_wa(channel, id),
            Platform::Signal => self.lookup_by_signal(channel, id),
        }
    }

    fn lookup(
        &self,
        column: &str,
        channel: &str,
        id: &str,
    ) -> Result<Option<MessageMapping>, BridgeError> {
        // `column` is one of two literals above, never user input.
        let sql = format!(
            "SELECT channel, wa_id, signal_id, direction, created_at, last_seen_at,
                    thread_root_wa, thread_root_signal, media_fingerprint
             FROM messages WHERE channel = ?1 AND {column} = ?2"
        );
        let row = self
            .conn
            .query_row(&sql, params![channel, id], map_mapping_row)
            .optional()?;
        row.map(finish_mapping_row).transpose()
    }

    /// Update `last_seen_at` for the row holding `id` on `platform`.
    pub fn touch(
        &mut self,
        channel: &str,
        platform: Platform,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        let column = match platform {
            Platform::WhatsApp => "wa_id",
            Platform::Signal => "signal_id",
        };
        let sql =
            format!("UPDATE messages SET last_seen_at = ?3 WHERE channel = ?1 AND {column} = ?2");
        let n = self.conn.execute(&sql, params![channel, id, ts(now)])?;
        if n == 0 {
            return Err(BridgeError::NotFound(format!(
                "no mapping for {} id '{id}' in channel '{channel}'",
                platform.as_str()
            )));
        }
        Ok(())
    }

    /// Remove the row holding `id` on `platform`. Returns true if a row
    /// was deleted.
    pub fn delete_mapping(
        &mut self,
        channel: &str,
        platform: Platform,
        id: &str,
    ) -> Result<bool, BridgeError> {
        let column = match platform {
            Platform::WhatsApp => "wa_id",
            Platform::Signal => "signal_id",
        };
        let sql = format!("DELETE FROM messages WHERE channel = ?1 AND {column} = ?2");
        let n = self.conn.execute(&sql, params![channel, id])?;
        Ok(n > 0)
    }

    /// Most recent source ids for a channel, newest first. Used to
    /// rehydrate the engine's dedup window after a restart.
    pub fn recent_source_ids(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<(Platform, String)>, BridgeError> {
        let mut stmt = self.conn.prepare(
            "SELECT direction, wa_id, signal_id FROM messages
             WHERE channel = ?1 ORDER BY last_seen_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![channel, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut ids = Vec::new();
        for r in rows {
            let (direction, wa_id, signal_id) = r?;
            let direction = Direction::parse(&direction).ok_or_else(|| {
                BridgeError::StorageFatal(format!("bad direction '{direction}' in messages row"))
            })?;
            let (platform, id) = match direction.source() {
                Platform::WhatsApp => (Platform::WhatsApp, wa_id),
                Platform::Signal => (Platform::Signal, signal_id),
            };
            ids.push((platform, id));
        }
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Seen tombstones
    // -----------------------------------------------------------------------

    /// Record that a source id was accepted. Idempotent.
    pub fn mark_seen(
        &mut self,
        channel: &str,
        platform: Platform,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO seen (channel, platform, source_id, accepted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![channel, platform.as_str(), source_id, ts(now)],
        )?;
        Ok(())
    }

    pub fn is_seen(
        &self,
        channel: &str,
        platform: Platform,
        source_id: &str,
    ) -> Result<bool, BridgeError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM seen WHERE channel = ?1 AND platform = ?2 AND source_id = ?3",
                params![channel, platform.as_str(), source_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // -----------------------------------------------------------------------
    // Contacts
    // -----------------------------------------------------------------------

    pub fn contact_get(&self, handle: &str) -> Result<Option<ContactRow>, BridgeError> {
        let row = self
            .conn
            .query_row(
                "SELECT handle, display_name, fetched_at FROM contacts WHERE handle = ?1",
                params![handle],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(handle, display_name, fetched_at)| {
            Ok(ContactRow {
                handle,
                display_name,
                fetched_at: parse_ts(&fetched_at)?,
            })
        })
        .transpose()
    }

    pub fn contact_put(
        &mut self,
        handle: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        self.conn.execute(
            "INSERT INTO contacts (handle, display_name, fetched_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(handle) DO UPDATE SET display_name = ?2, fetched_at = ?3",
            params![handle, display_name, ts(now)],
        )?;
        Ok(())
    }

    /// Handles whose cache entry is older than `cutoff`, for the periodic
    /// refresh task.
    pub fn contacts_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, BridgeError> {
        let mut stmt = self
            .conn
            .prepare("SELECT handle FROM contacts WHERE fetched_at < ?1")?;
        let rows = stmt.query_map(params![ts(cutoff)], |row| row.get::<_, String>(0))?;
        let mut handles = Vec::new();
        for r in rows {
            handles.push(r?);
        }
        Ok(handles)
    }

    // -----------------------------------------------------------------------
    // Media rows
    // -----------------------------------------------------------------------

    pub fn media_get(&self, fingerprint: &str) -> Result<Option<MediaArtifact>, BridgeError> {
        let row = self
            .conn
            .query_row(
                "SELECT fingerprint, mime, size_bytes, kind, local_path, created_at
                 FROM media WHERE fingerprint = ?1",
                params![fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(fingerprint, mime, size_bytes, kind, local_path, created_at)| {
            let kind = MediaKind::parse(&kind)
                .ok_or_else(|| BridgeError::StorageFatal(format!("bad media kind '{kind}'")))?;
            Ok(MediaArtifact {
                fingerprint,
                mime,
                size_bytes: size_bytes as u64,
                kind,
                local_path,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    pub fn media_insert(&mut self, artifact: &MediaArtifact) -> Result<(), BridgeError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO media
                 (fingerprint, mime, size_bytes, kind, local_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artifact.fingerprint,
                artifact.mime,
                artifact.size_bytes as i64,
                artifact.kind.as_str(),
                artifact.local_path,
                ts(artifact.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn media_delete(&mut self, fingerprint: &str) -> Result<(), BridgeError> {
        self.conn.execute(
            "DELETE FROM media WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Retention sweep
    // -----------------------------------------------------------------------

    /// Delete mappings, tombstones, and stale contacts older than
    /// `now - retention`. Deletion runs in bounded batches, one
    /// transaction each. Returns counts plus media fingerprints no longer
    /// referenced by any surviving mapping.
    pub fn sweep(
        &mut self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<SweepReport, BridgeError> {
        let cutoff = ts(now - retention);
        let mut report = SweepReport::default();
        let mut candidate_fingerprints: Vec<String> = Vec::new();

        loop {
            let tx = self.conn.transaction()?;
            let batch: Vec<(i64, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, media_fingerprint FROM messages
                     WHERE last_seen_at < ?1 ORDER BY id ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![cutoff, SWEEP_BATCH as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
                })?;
                let mut batch = Vec::new();
                for r in rows {
                    batch.push(r?);
                }
                batch
            };
            if batch.is_empty() {
                tx.commit()?;
                break;
            }
            for (id, fingerprint) in &batch {
                tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                if let Some(fp) = fingerprint {
                    candidate_fingerprints.push(fp.clone());
                }
            }
            report.deleted_mappings += batch.len() as u64;
            tx.commit()?;
        }

        report.deleted_seen = self
            .conn
            .execute("DELETE FROM seen WHERE accepted_at < ?1", params![cutoff])?
            as u64;
        report.deleted_contacts = self.conn.execute(
            "DELETE FROM contacts WHERE fetched_at < ?1",
            params![cutoff],
        )? as u64;

        // A fingerprint is orphaned once no surviving mapping references it.
        candidate_fingerprints.sort();
        candidate_fingerprints.dedup();
        for fp in candidate_fingerprints {
            let still_referenced: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM messages WHERE media_fingerprint = ?1 LIMIT 1",
                    params![fp],
                    |row| row.get(0),
                )
                .optional()?;
            if still_referenced.is_none() {
                report.orphaned_fingerprints.push(fp);
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

type RawMappingRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn map_mapping_row(row: &rusqlite::Row<'_>) -> Result<RawMappingRow, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn finish_mapping_row(raw: RawMappingRow) -> Result<MessageMapping, BridgeError> {
    let (
        channel,
        wa_id,
        signal_id,
        direction,
        created_at,
        last_seen_at,
        thread_root_wa,
        thread_root_signal,
        media_fingerprint,
    ) = raw;
    let direction = Direction::parse(&direction)
        .ok_or_else(|| BridgeError::StorageFatal(format!("bad direction '{direction}'")))?;
    Ok(MessageMapping {
        channel,
        wa_id,
        signal_id,
        direction,
        created_at: parse_ts(&created_at)?,
        last_seen_at: parse_ts(&last_seen_at)?,
        thread_root_wa,
        thread_root_signal,
        media_fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn mapping(channel: &str, wa: &str, sig: &str, at: DateTime<Utc>) -> MessageMapping {
        MessageMapping {
            channel: channel.to_owned(),
            wa_id: wa.to_owned(),
            signal_id: sig.to_owned(),
            direction: Direction::WhatsAppToSignal,
            created_at: at,
            last_seen_at: at,
            thread_root_wa: None,
            thread_root_signal: None,
            media_fingerprint: None,
        }
    }

    #[test]
    fn record_then_lookup_both_directions() {
        let mut store = MessageStore::open_in_memory().unwrap();
        store.record(&mapping("main", "A1", "B1", t(0))).unwrap();

        let by_wa = store.lookup_by_wa("main", "A1").unwrap().unwrap();
        assert_eq!(by_wa.signal_id, "B1");
        let by_sig = store.lookup_by_signal("main", "B1").unwrap().unwrap();
        assert_eq!(by_sig.wa_id, "A1");
        assert!(store.lookup_by_wa("other", "A1").unwrap().is_none());
    }

    #[test]
    fn record_same_pair_twice_refreshes_last_seen() {
        let mut store = MessageStore::open_in_memory().unwrap();
        store.record(&mapping("main", "A1", "B1", t(0))).unwrap();
        store.record(&mapping("main", "A1", "B1", t(100))).unwrap();

        let row = store.lookup_by_wa("main", "A1").unwrap().unwrap();
        assert_eq!(row.last_seen_at, t(100));
        // still exactly one row
        assert_eq!(store.recent_source_ids("main", 10).unwrap().len(), 1);
    }

    #[test]
    fn record_conflicting_counterpart_fails() {
        let mut store = MessageStore::open_in_memory().unwrap();
        store.record(&mapping("main", "A1", "B1", t(0))).unwrap();

        let err = store.record(&mapping("main", "A1", "B2", t(1))).unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
        let err = store.record(&mapping("main", "A2", "B1", t(1))).unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
        assert!(!err.retryable());
    }

    #[test]
    fn same_ids_in_different_channels_do_not_conflict() {
        let mut store = MessageStore::open_in_memory().unwrap();
        store.record(&mapping("main", "A1", "B1", t(0))).unwrap();
        store.record(&mapping("side", "A1", "B1", t(0))).unwrap();
    }

    #[test]
    fn touch_updates_last_seen_and_errors_on_missing() {
        let mut store = MessageStore::open_in_memory().unwrap();
        store.record(&mapping("main", "A1", "B1", t(0))).unwrap();

        store.touch("main", Platform::Signal, "B1", t(50)).unwrap();
        let row = store.lookup_by_wa("main", "A1").unwrap().unwrap();
        assert_eq!(row.last_seen_at, t(50));

        let err = store
            .touch("main", Platform::WhatsApp, "missing", t(60))
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[test]
    fn delete_mapping_removes_row() {
        let mut store = MessageStore::open_in_memory().unwrap();
        store.record(&mapping("main", "A1", "B1", t(0))).unwrap();

        assert!(store.delete_mapping("main", Platform::WhatsApp, "A1").unwrap());
        assert!(store.lookup_by_signal("main", "B1").unwrap().is_none());
        assert!(!store.delete_mapping("main", Platform::WhatsApp, "A1").unwrap());
    }

    #[test]
    fn seen_tombstones_round_trip() {
        let mut store = MessageStore::open_in_memory().unwrap();
        assert!(!store.is_seen("main", Platform::WhatsApp, "A1").unwrap());
        store
            .mark_seen("main", Platform::WhatsApp, "A1", t(0))
            .unwrap();
        store
            .mark_seen("main", Platform::WhatsApp, "A1", t(1))
            .unwrap();
        assert!(store.is_seen("main", Platform::WhatsApp, "A1").unwrap());
        assert!(!store.is_seen("main", Platform::Signal, "A1").unwrap());
    }

    #[test]
    fn recent_source_ids_follow_direction() {
        let mut store = MessageStore::open_in_memory().unwrap();
        store.record(&mapping("main", "A1", "B1", t(0))).unwrap();
        let mut reverse = mapping("main", "A2", "B2", t(10));
        reverse.direction = Direction::SignalToWhatsApp;
        store.record(&reverse).unwrap();

        let ids = store.recent_source_ids("main", 10).unwrap();
        assert_eq!(
            ids,
            vec![
                (Platform::Signal, "B2".to_owned()),
                (Platform::WhatsApp, "A1".to_owned()),
            ]
        );
    }

    #[test]
    fn contacts_round_trip_and_staleness_query() {
        let mut store = MessageStore::open_in_memory().unwrap();
        store.contact_put("+1555", "Alice", t(0)).unwrap();
        store.contact_put("+1666", "Bob", t(1000)).unwrap();

        let row = store.contact_get("+1555").unwrap().unwrap();
        assert_eq!(row.display_name, "Alice");
        assert_eq!(row.fetched_at, t(0));

        let stale = store.contacts_older_than(t(500)).unwrap();
        assert_eq!(stale, vec!["+1555".to_owned()]);

        // Upsert replaces name and timestamp.
        store.contact_put("+1555", "Alice Smith", t(2000)).unwrap();
        let row = store.contact_get("+1555").unwrap().unwrap();
        assert_eq!(row.display_name, "Alice Smith");
        assert!(store.contacts_older_than(t(500)).unwrap().is_empty());
    }

    #[test]
    fn sweep_removes_expired_rows_and_reports_orphans() {
        let mut store = MessageStore::open_in_memory().unwrap();
        let mut old = mapping("main", "A1", "B1", t(0));
        old.media_fingerprint = Some("fp-old".to_owned());
        store.record(&old).unwrap();

        let mut fresh = mapping("main", "A2", "B2", t(5000));
        fresh.media_fingerprint = Some("fp-shared".to_owned());
        store.record(&fresh).unwrap();

        let mut old_shared = mapping("main", "A3", "B3", t(1));
        old_shared.media_fingerprint = Some("fp-shared".to_owned());
        store.record(&old_shared).unwrap();

        store
            .mark_seen("main", Platform::WhatsApp, "A1", t(0))
            .unwrap();
        store.contact_put("+1555", "Alice", t(0)).unwrap();

        // retention window ends between t(1) and t(5000)
        let report = store
            .sweep(t(4000), chrono::Duration::seconds(1000))
            .unwrap();
        assert_eq!(report.deleted_mappings, 2);
        assert_eq!(report.deleted_seen, 1);
        assert_eq!(report.deleted_contacts, 1);
        // fp-shared survives through A2/B2; fp-old is orphaned.
        assert_eq!(report.orphaned_fingerprints, vec!["fp-old".to_owned()]);

        assert!(store.lookup_by_wa("main", "A1").unwrap().is_none());
        assert!(store.lookup_by_wa("main", "A2").unwrap().is_some());
    }

    #[test]
    fn sweep_twice_is_idempotent() {
        let mut store = MessageStore::open_in_memory().unwrap();
        let mut m = mapping("main", "A1", "B1", t(0));
        m.media_fingerprint = Some("fp1".to_owned());
        store.record(&m).unwrap();

        let first = store
            .sweep(t(4000), chrono::Duration::seconds(1000))
            .unwrap();
        assert_eq!(first.deleted_mappings, 1);
        assert_eq!(first.orphaned_fingerprints, vec!["fp1".to_owned()]);

        let second = store
            .sweep(t(4000), chrono::Duration::seconds(1000))
            .unwrap();
        assert_eq!(second, SweepReport::default());
    }

    #[test]
    fn sweep_handles_more_rows_than_one_batch() {
        let mut store = MessageStore::open_in_memory().unwrap();
        for i in 0..(super::SWEEP_BATCH + 50) {
            store
                .record(&mapping("main", &format!("A{i}"), &format!("B{i}"), t(0)))
                .unwrap();
        }
        let report = store
            .sweep(t(4000), chrono::Duration::seconds(1000))
            .unwrap();
        assert_eq!(report.deleted_mappings, (super::SWEEP_BATCH + 50) as u64);
    }

    #[test]
    fn media_rows_round_trip() {
        let mut store = MessageStore::open_in_memory().unwrap();
        let artifact = MediaArtifact {
            fingerprint: "abc123".to_owned(),
            mime: "image/png".to_owned(),
            size_bytes: 512,
            kind: MediaKind::Image,
            local_path: "/cache/abc123.png".to_owned(),
            created_at: t(0),
        };
        store.media_insert(&artifact).unwrap();
        assert_eq!(store.media_get("abc123").unwrap().unwrap(), artifact);

        store.media_delete("abc123").unwrap();
        assert!(store.media_get("abc123").unwrap().is_none());
    }

    #[test]
    fn persists_across_reopen() {
        let file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut store = MessageStore::open(file.path()).unwrap();
            store.record(&mapping("main", "A1", "B1", t(0))).unwrap();
        }
        let store = MessageStore::open(file.path()).unwrap();
        assert!(store.lookup_by_wa("main", "A1").unwrap().is_some());
    }
}
