use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use engagement_core::{
    ActorId, EngagementEvent, EntityId, EventId, SignalAggregate, SignalKind,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS engagement_events (
  event_id TEXT PRIMARY KEY,
  entity_id TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('view','rating','comment')),
  value REAL NOT NULL,
  occurred_at TEXT NOT NULL,
  occurred_at_ms INTEGER NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_owners (
  entity_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_engagement_events_entity_kind_time
  ON engagement_events(entity_id, kind, occurred_at_ms);
CREATE INDEX IF NOT EXISTS idx_engagement_events_actor_entity_kind_time
  ON engagement_events(actor_id, entity_id, kind, occurred_at_ms);
";

/// Append-only signal store backed by `SQLite`.
pub struct SqliteSignalStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub event_count: u64,
    pub schema_status: SchemaStatus,
}

/// Inclusive time bounds for an aggregate read; `start = None` means all-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalWindow {
    pub start: Option<OffsetDateTime>,
    pub end: OffsetDateTime,
}

impl SqliteSignalStore {
    /// Open a SQLite-backed signal store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            info!(version = 1, "applied signal store migration");
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Append one validated engagement event.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert fails.
    pub fn append_event(&mut self, event: &EngagementEvent) -> Result<()> {
        event.validate().map_err(|err| anyhow!("event validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO engagement_events(
                event_id, entity_id, actor_id, kind, value, occurred_at, occurred_at_ms, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_id.to_string(),
                event.entity_id.as_str(),
                event.actor_id.as_str(),
                event.kind.as_str(),
                event.value,
                rfc3339(event.occurred_at)?,
                unix_millis(event.occurred_at),
                now_rfc3339()?,
            ],
        )
        .context("failed to insert engagement event")?;
        tx.commit().context("failed to commit event transaction")?;
        Ok(())
    }

    /// Register or replace the owner of an entity.
    ///
    /// # Errors
    /// Returns an error when ids are blank or the upsert fails.
    pub fn set_entity_owner(&mut self, entity_id: &EntityId, owner_id: &ActorId) -> Result<()> {
        if entity_id.as_str().trim().is_empty() || owner_id.as_str().trim().is_empty() {
            return Err(anyhow!("entity_id and owner_id MUST be non-empty"));
        }

        self.conn
            .execute(
                "INSERT INTO entity_owners(entity_id, owner_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_id) DO UPDATE SET
                   owner_id = excluded.owner_id,
                   updated_at = excluded.updated_at",
                params![entity_id.as_str(), owner_id.as_str(), now_rfc3339()?],
            )
            .context("failed to upsert entity owner")?;
        Ok(())
    }

    /// Look up the registered owner of an entity.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn owner_of(&self, entity_id: &EntityId) -> Result<Option<ActorId>> {
        let owner = self
            .conn
            .query_row(
                "SELECT owner_id FROM entity_owners WHERE entity_id = ?1",
                params![entity_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read entity owner")?;
        Ok(owner.map(ActorId))
    }

    /// Check for a view by `actor_id` on `entity_id` at or after `since`.
    ///
    /// # Errors
    /// Returns an error when the indexed lookup fails.
    pub fn has_recent_view(
        &self,
        entity_id: &EntityId,
        actor_id: &ActorId,
        since: OffsetDateTime,
    ) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT EXISTS(
                    SELECT 1 FROM engagement_events
                    WHERE actor_id = ?1 AND entity_id = ?2 AND kind = 'view' AND occurred_at_ms >= ?3
                 )",
            )
            .context("failed to prepare recent view lookup")?;
        let exists = stmt
            .query_row(
                params![actor_id.as_str(), entity_id.as_str(), unix_millis(since)],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to query recent view")?;
        Ok(exists == 1)
    }

    /// Same answer as [`Self::has_recent_view`], reading the latest view row and
    /// comparing its RFC3339 timestamp in process.
    ///
    /// # Errors
    /// Returns an error when the query fails or the stored timestamp is invalid.
    pub fn has_recent_view_raw(
        &self,
        entity_id: &EntityId,
        actor_id: &ActorId,
        since: OffsetDateTime,
    ) -> Result<bool> {
        let latest = self
            .conn
            .query_row(
                "SELECT occurred_at FROM engagement_events
                 WHERE entity_id = ?1 AND actor_id = ?2 AND kind = 'view'
                 ORDER BY occurred_at_ms DESC
                 LIMIT 1",
                params![entity_id.as_str(), actor_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to query latest view row")?;

        match latest {
            Some(raw) => Ok(parse_rfc3339(&raw)? >= since),
            None => Ok(false),
        }
    }

    /// Grouped per-entity, per-kind totals for the candidates inside `window`.
    ///
    /// Events written by the entity's registered owner are excluded. Entities with no
    /// events for a kind produce no row for that kind.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails or returns an unknown kind.
    pub fn aggregate_signals(
        &self,
        candidates: &[EntityId],
        kinds: &[SignalKind],
        window: SignalWindow,
    ) -> Result<Vec<SignalAggregate>> {
        if candidates.is_empty() || kinds.is_empty() {
            return Ok(Vec::new());
        }

        let candidate_json = serde_json::to_string(candidates)
            .context("failed to serialize aggregate candidates")?;
        let kind_json = serde_json::to_string(&kinds.iter().map(|kind| kind.as_str()).collect::<Vec<_>>())
            .context("failed to serialize aggregate kinds")?;
        let start_ms = window.start.map_or(i64::MIN, unix_millis);
        let end_ms = unix_millis(window.end);

        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT e.entity_id, e.kind, COUNT(*), COALESCE(SUM(e.value), 0.0)
                 FROM engagement_events e
                 LEFT JOIN entity_owners o ON o.entity_id = e.entity_id
                 WHERE e.entity_id IN (SELECT value FROM json_each(?1))
                   AND e.kind IN (SELECT value FROM json_each(?2))
                   AND e.occurred_at_ms >= ?3
                   AND e.occurred_at_ms <= ?4
                   AND (o.owner_id IS NULL OR o.owner_id <> e.actor_id)
                 GROUP BY e.entity_id, e.kind
                 ORDER BY e.entity_id ASC, e.kind ASC",
            )
            .context("failed to prepare signal aggregate query")?;

        let rows = stmt.query_map(params![candidate_json, kind_json, start_ms, end_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut aggregates = Vec::new();
        for row in rows {
            let (entity_id, kind_raw, count, sum) = row?;
            let kind = SignalKind::parse(&kind_raw)
                .ok_or_else(|| anyhow!("unknown signal kind: {kind_raw}"))?;
            let count = u64::try_from(count).unwrap_or(0);
            if let Some(aggregate) =
                SignalAggregate::new(EntityId(entity_id), kind, window.start, window.end, count, sum)
            {
                aggregates.push(aggregate);
            }
        }

        aggregates.sort_by(|left, right| {
            left.entity_id.cmp(&right.entity_id).then_with(|| left.kind.cmp(&right.kind))
        });
        Ok(aggregates)
    }

    /// Row-by-row equivalent of [`Self::aggregate_signals`], folded in process.
    ///
    /// # Errors
    /// Returns an error when any per-entity scan fails.
    pub fn aggregate_signals_raw(
        &self,
        candidates: &[EntityId],
        kinds: &[SignalKind],
        window: SignalWindow,
    ) -> Result<Vec<SignalAggregate>> {
        let start_ms = window.start.map_or(i64::MIN, unix_millis);
        let end_ms = unix_millis(window.end);
        let mut totals: BTreeMap<(EntityId, SignalKind), (u64, f64)> = BTreeMap::new();

        let mut unique = candidates.to_vec();
        unique.sort();
        unique.dedup();

        for entity_id in &unique {
            let owner = self.owner_of(entity_id)?;
            let mut stmt = self.conn.prepare(
                "SELECT actor_id, kind, value, occurred_at_ms FROM engagement_events
                 WHERE entity_id = ?1",
            )?;
            let rows = stmt.query_map(params![entity_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            for row in rows {
                let (actor_id, kind_raw, value, occurred_at_ms) = row?;
                if occurred_at_ms < start_ms || occurred_at_ms > end_ms {
                    continue;
                }
                if owner.as_ref().is_some_and(|owner| owner.as_str() == actor_id) {
                    continue;
                }
                let kind = SignalKind::parse(&kind_raw)
                    .ok_or_else(|| anyhow!("unknown signal kind: {kind_raw}"))?;
                if !kinds.contains(&kind) {
                    continue;
                }
                let entry = totals.entry((entity_id.clone(), kind)).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += value;
            }
        }

        Ok(totals
            .into_iter()
            .filter_map(|((entity_id, kind), (count, sum))| {
                SignalAggregate::new(entity_id, kind, window.start, window.end, count, sum)
            })
            .collect())
    }

    /// Count stored events for an entity and kind, owner events included.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_events(&self, entity_id: &EntityId, kind: SignalKind) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM engagement_events WHERE entity_id = ?1 AND kind = ?2",
                params![entity_id.as_str(), kind.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count engagement events")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Load all events for an entity, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_events_for_entity(&self, entity_id: &EntityId) -> Result<Vec<EngagementEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, entity_id, actor_id, kind, value, occurred_at
             FROM engagement_events
             WHERE entity_id = ?1
             ORDER BY occurred_at_ms ASC, event_id ASC",
        )?;
        let mut rows = stmt.query(params![entity_id.as_str()])?;
        let mut events = Vec::new();

        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(0)?;
            let kind_raw: String = row.get(3)?;
            events.push(EngagementEvent {
                event_id: parse_event_id(&event_id_raw)?,
                entity_id: EntityId(row.get(1)?),
                actor_id: ActorId(row.get(2)?),
                kind: SignalKind::parse(&kind_raw)
                    .ok_or_else(|| anyhow!("unknown signal kind: {kind_raw}"))?,
                value: row.get(4)?,
                occurred_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            });
        }

        Ok(events)
    }

    /// Run quick-check and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let event_count = if schema_status.current_version > 0 {
            let count = self
                .conn
                .query_row("SELECT COUNT(*) FROM engagement_events", [], |row| row.get::<_, i64>(0))
                .context("failed to count engagement events")?;
            u64::try_from(count).unwrap_or(0)
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            event_count,
            schema_status,
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn unix_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn parse_event_id(raw: &str) -> Result<EventId> {
    let parsed = Ulid::from_str(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(EventId(parsed))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn migrated_memory_store() -> Result<SqliteSignalStore> {
        let mut store = SqliteSignalStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn entity(value: &str) -> EntityId {
        EntityId::new(value)
    }

    fn actor(value: &str) -> ActorId {
        ActorId::new(value)
    }

    fn all_time(end: OffsetDateTime) -> SignalWindow {
        SignalWindow { start: None, end }
    }

    fn seed_mixed_signals(store: &mut SqliteSignalStore) -> Result<()> {
        let now = fixture_time();
        store.set_entity_owner(&entity("book-a"), &actor("author-a"))?;
        for reader in ["r1", "r2", "r3"] {
            store.append_event(&EngagementEvent::view(entity("book-a"), actor(reader), now))?;
        }
        store.append_event(&EngagementEvent::view(entity("book-a"), actor("author-a"), now))?;
        store.append_event(&EngagementEvent::rating(entity("book-a"), actor("r1"), 4.0, now))?;
        store.append_event(&EngagementEvent::rating(entity("book-a"), actor("r2"), 5.0, now))?;
        store.append_event(&EngagementEvent::rating(entity("book-a"), actor("author-a"), 5.0, now))?;
        store.append_event(&EngagementEvent::comment(entity("book-b"), actor("r1"), now))?;
        store.append_event(&EngagementEvent::view(
            entity("book-b"),
            actor("r9"),
            now - Duration::days(30),
        ))?;
        Ok(())
    }

    #[test]
    fn schema_check_constraint_rejects_unknown_kind() -> Result<()> {
        let store = migrated_memory_store()?;
        let result = store.conn.execute(
            "INSERT INTO engagement_events(
                event_id, entity_id, actor_id, kind, value, occurred_at, occurred_at_ms, recorded_at
            ) VALUES ('x', 'book', 'reader', 'like', 1.0, '2026-01-01T00:00:00Z', 0, '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent_and_reports_status() -> Result<()> {
        let mut store = SqliteSignalStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn append_rejects_invalid_event() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let event = EngagementEvent::rating(entity("book-a"), actor("r1"), 7.0, fixture_time());
        let Err(err) = store.append_event(&event) else {
            return Err(anyhow!("expected validation failure for out-of-range rating"));
        };
        assert!(err.to_string().contains("event validation failed"));
        Ok(())
    }

    #[test]
    fn events_round_trip_in_time_order() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let later = EngagementEvent::comment(entity("book-a"), actor("r1"), fixture_time());
        let earlier = EngagementEvent::rating(
            entity("book-a"),
            actor("r2"),
            3.5,
            fixture_time() - Duration::minutes(5),
        );
        store.append_event(&later)?;
        store.append_event(&earlier)?;

        let events = store.list_events_for_entity(&entity("book-a"))?;
        assert_eq!(events, vec![earlier, later]);
        Ok(())
    }

    #[test]
    fn owner_registry_upserts() -> Result<()> {
        let mut store = migrated_memory_store()?;
        assert_eq!(store.owner_of(&entity("book-a"))?, None);
        store.set_entity_owner(&entity("book-a"), &actor("author-a"))?;
        store.set_entity_owner(&entity("book-a"), &actor("author-b"))?;
        assert_eq!(store.owner_of(&entity("book-a"))?, Some(actor("author-b")));
        Ok(())
    }

    #[test]
    fn aggregates_exclude_owner_and_out_of_window_events() -> Result<()> {
        let mut store = migrated_memory_store()?;
        seed_mixed_signals(&mut store)?;

        let window = SignalWindow {
            start: Some(fixture_time() - Duration::days(14)),
            end: fixture_time(),
        };
        let aggregates = store.aggregate_signals(
            &[entity("book-a"), entity("book-b"), entity("book-c")],
            &SignalKind::ALL,
            window,
        )?;

        let summary = aggregates
            .iter()
            .map(|item| (item.entity_id.as_str().to_string(), item.kind, item.count))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("book-a".to_string(), SignalKind::View, 3),
                ("book-a".to_string(), SignalKind::Rating, 2),
                ("book-b".to_string(), SignalKind::Comment, 1),
            ]
        );

        let rating = aggregates.iter().find(|item| item.kind == SignalKind::Rating);
        let Some(rating) = rating else { return Err(anyhow!("rating aggregate missing")) };
        assert!((rating.avg - 4.5).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn raw_aggregates_match_grouped_query() -> Result<()> {
        let mut store = migrated_memory_store()?;
        seed_mixed_signals(&mut store)?;
        let candidates = [entity("book-b"), entity("book-a"), entity("book-a")];

        for window in [
            all_time(fixture_time()),
            SignalWindow { start: Some(fixture_time() - Duration::days(14)), end: fixture_time() },
        ] {
            let grouped = store.aggregate_signals(&candidates, &SignalKind::ALL, window)?;
            let raw = store.aggregate_signals_raw(&candidates, &SignalKind::ALL, window)?;
            assert_eq!(grouped, raw);
        }

        let ratings_only =
            store.aggregate_signals_raw(&candidates, &[SignalKind::Rating], all_time(fixture_time()))?;
        assert!(ratings_only.iter().all(|item| item.kind == SignalKind::Rating));
        Ok(())
    }

    #[test]
    fn recent_view_lookups_respect_window() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let viewed_at = fixture_time();
        store.append_event(&EngagementEvent::view(entity("ch-1"), actor("r1"), viewed_at))?;

        let inside = viewed_at - Duration::minutes(1);
        let after = viewed_at + Duration::minutes(1);
        assert!(store.has_recent_view(&entity("ch-1"), &actor("r1"), inside)?);
        assert!(store.has_recent_view_raw(&entity("ch-1"), &actor("r1"), inside)?);
        assert!(!store.has_recent_view(&entity("ch-1"), &actor("r1"), after)?);
        assert!(!store.has_recent_view_raw(&entity("ch-1"), &actor("r1"), after)?);
        assert!(!store.has_recent_view(&entity("ch-1"), &actor("r2"), inside)?);
        assert!(!store.has_recent_view_raw(&entity("ch-2"), &actor("r1"), inside)?);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = migrated_memory_store()?;
        seed_mixed_signals(&mut store)?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.event_count, 9);
        assert_eq!(report.schema_status.current_version, 1);
        Ok(())
    }

    #[test]
    fn concurrent_appends_and_reads_preserve_integrity() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("engagement-concurrency-{}.sqlite3", Ulid::new()));
        {
            let mut init = SqliteSignalStore::open(&db_path)?;
            init.migrate()?;
        }

        let writer_threads = 4;
        let writes_per_thread = 20;
        let mut handles = Vec::new();

        for writer in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteSignalStore::open(&writer_path)?;
                for _ in 0..writes_per_thread {
                    store.append_event(&EngagementEvent::view(
                        EntityId::new("shared-chapter"),
                        ActorId::new(format!("reader-{writer}")),
                        OffsetDateTime::now_utc(),
                    ))?;
                }
                Ok(())
            }));
        }

        for _ in 0..2 {
            let reader_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteSignalStore::open(&reader_path)?;
                for _ in 0..30 {
                    let _ = store.count_events(&EntityId::new("shared-chapter"), SignalKind::View)?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteSignalStore::open(&db_path)?;
        let total = store.count_events(&EntityId::new("shared-chapter"), SignalKind::View)?;
        assert_eq!(total, writer_threads * writes_per_thread);
        assert!(store.integrity_check()?.quick_check_ok);

        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }

        Ok(())
    }
}
