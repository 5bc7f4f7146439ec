#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use invoice_memory_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AuditSink, CorrectionMemory, MemoryKind,
    MemoryStore, PatternType, PipelineRuleset, PipelineStage, ResolutionMemory, RunId,
    VendorMemory,
};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS vendor_memory (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  vendor_name TEXT NOT NULL,
  pattern_type TEXT NOT NULL CHECK (pattern_type IN ('field_mapping', 'calculation', 'behavior')),
  pattern_key TEXT NOT NULL,
  pattern_value TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  usage_count INTEGER NOT NULL CHECK (usage_count >= 0),
  last_used TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vendor_memory_lookup
  ON vendor_memory(vendor_name, pattern_key, confidence DESC);

CREATE TABLE IF NOT EXISTS correction_memory (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  correction_type TEXT NOT NULL,
  condition_text TEXT NOT NULL,
  action_text TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  usage_count INTEGER NOT NULL CHECK (usage_count >= 0),
  last_used TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS resolution_memory (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  issue_type TEXT NOT NULL,
  resolution TEXT NOT NULL,
  human_approved INTEGER NOT NULL CHECK (human_approved IN (0, 1)),
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  usage_count INTEGER NOT NULL CHECK (usage_count >= 0),
  last_used TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  invoice_id TEXT NOT NULL,
  stage TEXT NOT NULL CHECK (stage IN ('recall', 'apply', 'decide', 'learn')),
  recorded_at TEXT NOT NULL,
  details TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_invoice
  ON audit_log(invoice_id, id);

CREATE TABLE IF NOT EXISTS processed_invoices (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  invoice_id TEXT NOT NULL UNIQUE,
  vendor TEXT NOT NULL,
  invoice_number TEXT NOT NULL,
  invoice_date TEXT NOT NULL,
  processed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processed_invoices_dedup
  ON processed_invoices(vendor, invoice_number);
";

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")?;

    conn.execute_batch(SCHEMA_V1)
        .context("failed to apply invoice memory schema")?;

    let now = format_rfc3339(now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![MIGRATION_VERSION, now],
    )
    .context("failed to register schema migration")?;

    Ok(())
}

fn memory_table(kind: MemoryKind) -> &'static str {
    match kind {
        MemoryKind::VendorPattern => "vendor_memory",
        MemoryKind::CorrectionPattern => "correction_memory",
        MemoryKind::ResolutionPattern => "resolution_memory",
    }
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<OffsetDateTime>> {
    match value {
        Some(raw) => Ok(Some(parse_rfc3339_utc(&raw)?)),
        None => Ok(None),
    }
}

fn optional_timestamp_text(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    match value {
        Some(timestamp) => Ok(Some(format_rfc3339(timestamp)?)),
        None => Ok(None),
    }
}

fn vendor_memory_from_row(row: &Row<'_>) -> Result<VendorMemory> {
    let pattern_type: String = row.get(2)?;
    let last_used: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok(VendorMemory {
        id: Some(row.get(0)?),
        vendor_name: row.get(1)?,
        pattern_type: PatternType::parse(&pattern_type)
            .ok_or_else(|| anyhow!("invalid stored pattern_type: {pattern_type}"))?,
        pattern_key: row.get(3)?,
        pattern_value: row.get(4)?,
        confidence: row.get(5)?,
        usage_count: row.get(6)?,
        last_used: parse_optional_timestamp(last_used)?,
        created_at: parse_rfc3339_utc(&created_at)?,
    })
}

fn correction_memory_from_row(row: &Row<'_>) -> Result<CorrectionMemory> {
    let last_used: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(CorrectionMemory {
        id: Some(row.get(0)?),
        correction_type: row.get(1)?,
        condition: row.get(2)?,
        action: row.get(3)?,
        confidence: row.get(4)?,
        usage_count: row.get(5)?,
        last_used: parse_optional_timestamp(last_used)?,
        created_at: parse_rfc3339_utc(&created_at)?,
    })
}

fn resolution_memory_from_row(row: &Row<'_>) -> Result<ResolutionMemory> {
    let last_used: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(ResolutionMemory {
        id: Some(row.get(0)?),
        issue_type: row.get(1)?,
        resolution: row.get(2)?,
        human_approved: row.get(3)?,
        confidence: row.get(4)?,
        usage_count: row.get(5)?,
        last_used: parse_optional_timestamp(last_used)?,
        created_at: parse_rfc3339_utc(&created_at)?,
    })
}

/// SQLite-backed [`MemoryStore`]. Filtering and ranking happen in SQL;
/// `last_used DESC` orders NULL (never used) rows last, which is exactly the
/// tie-break the retrieval contract asks for.
pub struct SqliteMemoryStore {
    conn: Connection,
    ruleset: PipelineRuleset,
}

impl SqliteMemoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
            ruleset: PipelineRuleset::v1(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Ok(Self {
            conn,
            ruleset: PipelineRuleset::v1(),
        })
    }

    pub fn with_ruleset(mut self, ruleset: PipelineRuleset) -> Result<Self> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;
        self.ruleset = ruleset;
        Ok(self)
    }

    pub fn migrate(&self) -> Result<()> {
        apply_schema(&self.conn)
    }
}

impl MemoryStore for SqliteMemoryStore {
    fn list_vendor_memories(&self, vendor_name: &str) -> Result<Vec<VendorMemory>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, vendor_name, pattern_type, pattern_key, pattern_value,
                    confidence, usage_count, last_used, created_at
             FROM vendor_memory
             WHERE vendor_name = ?1 COLLATE NOCASE AND confidence > ?2
             ORDER BY confidence DESC, last_used DESC",
        )?;

        let mut rows = stmt.query(params![vendor_name, self.ruleset.usability_floor])?;
        let mut memories = Vec::new();
        while let Some(row) = rows.next()? {
            memories.push(vendor_memory_from_row(row)?);
        }
        Ok(memories)
    }

    fn list_correction_memories(&self) -> Result<Vec<CorrectionMemory>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, correction_type, condition_text, action_text,
                    confidence, usage_count, last_used, created_at
             FROM correction_memory
             WHERE confidence > ?1
             ORDER BY confidence DESC, last_used DESC",
        )?;

        let mut rows = stmt.query(params![self.ruleset.usability_floor])?;
        let mut memories = Vec::new();
        while let Some(row) = rows.next()? {
            memories.push(correction_memory_from_row(row)?);
        }
        Ok(memories)
    }

    fn list_resolution_memories(&self) -> Result<Vec<ResolutionMemory>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_type, resolution, human_approved,
                    confidence, usage_count, last_used, created_at
             FROM resolution_memory
             WHERE confidence > ?1
             ORDER BY confidence DESC, last_used DESC",
        )?;

        let mut rows = stmt.query(params![self.ruleset.usability_floor])?;
        let mut memories = Vec::new();
        while let Some(row) = rows.next()? {
            memories.push(resolution_memory_from_row(row)?);
        }
        Ok(memories)
    }

    fn insert_vendor_memory(&mut self, memory: &VendorMemory) -> Result<i64> {
        let last_used = optional_timestamp_text(memory.last_used)?;
        let created_at = format_rfc3339(memory.created_at)?;

        self.conn
            .execute(
                "INSERT INTO vendor_memory(vendor_name, pattern_type, pattern_key, pattern_value,
                                           confidence, usage_count, last_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    memory.vendor_name,
                    memory.pattern_type.as_str(),
                    memory.pattern_key,
                    memory.pattern_value,
                    memory.confidence,
                    memory.usage_count,
                    last_used,
                    created_at,
                ],
            )
            .context("failed to insert vendor memory")?;

        Ok(self.conn.last_insert_rowid())
    }

    fn insert_correction_memory(&mut self, memory: &CorrectionMemory) -> Result<i64> {
        let last_used = optional_timestamp_text(memory.last_used)?;
        let created_at = format_rfc3339(memory.created_at)?;

        self.conn
            .execute(
                "INSERT INTO correction_memory(correction_type, condition_text, action_text,
                                               confidence, usage_count, last_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    memory.correction_type,
                    memory.condition,
                    memory.action,
                    memory.confidence,
                    memory.usage_count,
                    last_used,
                    created_at,
                ],
            )
            .context("failed to insert correction memory")?;

        Ok(self.conn.last_insert_rowid())
    }

    fn insert_resolution_memory(&mut self, memory: &ResolutionMemory) -> Result<i64> {
        let last_used = optional_timestamp_text(memory.last_used)?;
        let created_at = format_rfc3339(memory.created_at)?;

        self.conn
            .execute(
                "INSERT INTO resolution_memory(issue_type, resolution, human_approved,
                                               confidence, usage_count, last_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    memory.issue_type,
                    memory.resolution,
                    memory.human_approved,
                    memory.confidence,
                    memory.usage_count,
                    last_used,
                    created_at,
                ],
            )
            .context("failed to insert resolution memory")?;

        Ok(self.conn.last_insert_rowid())
    }

    fn reinforce(
        &mut self,
        kind: MemoryKind,
        id: i64,
        new_confidence: f32,
        bump_usage: bool,
    ) -> Result<()> {
        let table = memory_table(kind);
        let now = format_rfc3339(now_utc())?;
        let bump = i64::from(bump_usage);

        let updated = self
            .conn
            .execute(
                &format!(
                    "UPDATE {table}
                     SET confidence = ?1, usage_count = usage_count + ?2, last_used = ?3
                     WHERE id = ?4"
                ),
                params![new_confidence, bump, now, id],
            )
            .with_context(|| format!("failed to reinforce {table} row {id}"))?;

        if updated == 0 {
            return Err(anyhow!("no {} memory with id {id}", kind.as_str()));
        }
        Ok(())
    }

    fn find_vendor_memory(
        &self,
        vendor_name: &str,
        pattern_key: &str,
    ) -> Result<Option<VendorMemory>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, vendor_name, pattern_type, pattern_key, pattern_value,
                    confidence, usage_count, last_used, created_at
             FROM vendor_memory
             WHERE vendor_name = ?1 COLLATE NOCASE AND pattern_key = ?2
             ORDER BY confidence DESC
             LIMIT 1",
        )?;

        let mut rows = stmt.query(params![vendor_name, pattern_key])?;
        match rows.next()? {
            Some(row) => Ok(Some(vendor_memory_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn find_correction_memory(&self, correction_type: &str) -> Result<Option<CorrectionMemory>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, correction_type, condition_text, action_text,
                    confidence, usage_count, last_used, created_at
             FROM correction_memory
             WHERE correction_type = ?1
             ORDER BY confidence DESC
             LIMIT 1",
        )?;

        let mut rows = stmt.query(params![correction_type])?;
        match rows.next()? {
            Some(row) => Ok(Some(correction_memory_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn is_duplicate_invoice(&self, vendor: &str, invoice_number: &str) -> Result<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM processed_invoices
                 WHERE vendor = ?1 AND invoice_number = ?2
             )",
            params![vendor, invoice_number],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    fn mark_invoice_processed(
        &mut self,
        invoice_id: &str,
        vendor: &str,
        invoice_number: &str,
        invoice_date: &str,
    ) -> Result<()> {
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO processed_invoices(invoice_id, vendor, invoice_number,
                                                          invoice_date, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![invoice_id, vendor, invoice_number, invoice_date, now],
            )
            .context("failed to mark invoice processed")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogRow {
    pub id: i64,
    pub run_id: String,
    pub invoice_id: String,
    pub stage: PipelineStage,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub details: String,
}

/// SQLite-backed [`AuditSink`]; owns its own connection so it can share a
/// database file with [`SqliteMemoryStore`].
pub struct SqliteAuditLog {
    conn: Connection,
}

impl SqliteAuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        apply_schema(&self.conn)
    }

    pub fn list_for_invoice(&self, invoice_id: &str) -> Result<Vec<AuditLogRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, invoice_id, stage, recorded_at, details
             FROM audit_log
             WHERE invoice_id = ?1
             ORDER BY id ASC",
        )?;

        let mut rows = stmt.query(params![invoice_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let stage: String = row.get(3)?;
            let recorded_at: String = row.get(4)?;
            entries.push(AuditLogRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                invoice_id: row.get(2)?,
                stage: PipelineStage::parse(&stage)
                    .ok_or_else(|| anyhow!("invalid stored stage: {stage}"))?,
                recorded_at: parse_rfc3339_utc(&recorded_at)?,
                details: row.get(5)?,
            });
        }
        Ok(entries)
    }

}

impl AuditSink for SqliteAuditLog {
    fn append(
        &mut self,
        run_id: RunId,
        subject_id: &str,
        stage: PipelineStage,
        details: &str,
    ) -> Result<()> {
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO audit_log(run_id, invoice_id, stage, recorded_at, details)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id.to_string(), subject_id, stage.as_str(), now, details],
            )
            .context("failed to append audit entry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoice_memory_core::reinforced_confidence;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn open_store() -> SqliteMemoryStore {
        let store = must_ok(SqliteMemoryStore::open_in_memory());
        must_ok(store.migrate());
        store
    }

    fn vendor_memory(key: &str, confidence: f32, last_used: Option<&str>) -> VendorMemory {
        VendorMemory {
            id: None,
            vendor_name: "Supplier GmbH".to_string(),
            pattern_type: PatternType::FieldMapping,
            pattern_key: key.to_string(),
            pattern_value: "serviceDate".to_string(),
            confidence,
            usage_count: 1,
            last_used: last_used.map(|raw| must_ok(parse_rfc3339_utc(raw))),
            created_at: must_ok(parse_rfc3339_utc("2024-02-01T08:00:00Z")),
        }
    }

    #[test]
    fn vendor_roundtrip_preserves_fields() {
        let mut store = open_store();
        let id = must_ok(store.insert_vendor_memory(&vendor_memory(
            "Leistungsdatum",
            0.7,
            Some("2024-03-01T08:00:00Z"),
        )));

        let found = must_some(must_ok(
            store.find_vendor_memory("Supplier GmbH", "Leistungsdatum"),
        ));
        assert_eq!(found.id, Some(id));
        assert_eq!(found.pattern_value, "serviceDate");
        assert_eq!(found.usage_count, 1);
        assert!((found.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn listing_filters_the_usability_floor() {
        let mut store = open_store();
        must_ok(store.insert_vendor_memory(&vendor_memory("weak", 0.2, None)));
        must_ok(store.insert_vendor_memory(&vendor_memory("at-floor", 0.3, None)));
        must_ok(store.insert_vendor_memory(&vendor_memory("usable", 0.31, None)));

        let listed = must_ok(store.list_vendor_memories("Supplier GmbH"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pattern_key, "usable");
    }

    #[test]
    fn listing_orders_by_confidence_then_recency_with_never_used_last() {
        let mut store = open_store();
        must_ok(store.insert_vendor_memory(&vendor_memory("low", 0.5, None)));
        must_ok(store.insert_vendor_memory(&vendor_memory(
            "tied-old",
            0.8,
            Some("2024-01-01T08:00:00Z"),
        )));
        must_ok(store.insert_vendor_memory(&vendor_memory(
            "tied-recent",
            0.8,
            Some("2024-03-01T08:00:00Z"),
        )));
        must_ok(store.insert_vendor_memory(&vendor_memory("tied-never", 0.8, None)));

        let listed = must_ok(store.list_vendor_memories("Supplier GmbH"));
        let keys: Vec<&str> = listed.iter().map(|m| m.pattern_key.as_str()).collect();
        assert_eq!(keys, vec!["tied-recent", "tied-old", "tied-never", "low"]);
    }

    #[test]
    fn vendor_lookup_is_case_insensitive() {
        let mut store = open_store();
        must_ok(store.insert_vendor_memory(&vendor_memory("Leistungsdatum", 0.7, None)));

        let listed = must_ok(store.list_vendor_memories("supplier gmbh"));
        assert_eq!(listed.len(), 1);
        assert!(must_ok(store.find_vendor_memory("SUPPLIER GMBH", "Leistungsdatum")).is_some());
    }

    #[test]
    fn find_vendor_memory_prefers_highest_confidence() {
        let mut store = open_store();
        must_ok(store.insert_vendor_memory(&vendor_memory("Leistungsdatum", 0.5, None)));
        must_ok(store.insert_vendor_memory(&vendor_memory("Leistungsdatum", 0.9, None)));

        let found = must_some(must_ok(
            store.find_vendor_memory("Supplier GmbH", "Leistungsdatum"),
        ));
        assert!((found.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn reinforce_updates_confidence_usage_and_recency() {
        let mut store = open_store();
        let id = must_ok(store.insert_vendor_memory(&vendor_memory("Leistungsdatum", 0.7, None)));

        must_ok(store.reinforce(MemoryKind::VendorPattern, id, 0.8, true));

        let found = must_some(must_ok(
            store.find_vendor_memory("Supplier GmbH", "Leistungsdatum"),
        ));
        assert!((found.confidence - 0.8).abs() < 1e-6);
        assert_eq!(found.usage_count, 2);
        assert!(found.last_used.is_some());
    }

    #[test]
    fn reinforce_unknown_id_fails() {
        let mut store = open_store();
        assert!(store
            .reinforce(MemoryKind::VendorPattern, 999, 0.8, true)
            .is_err());
    }

    #[test]
    fn correction_memory_roundtrip() {
        let mut store = open_store();
        let created_at = must_ok(parse_rfc3339_utc("2024-02-01T08:00:00Z"));
        must_ok(store.insert_correction_memory(&CorrectionMemory {
            id: None,
            correction_type: "tax_included".to_string(),
            condition: "MwSt. inkl. OR incl. VAT in rawText".to_string(),
            action: "recalculate tax from gross total".to_string(),
            confidence: 0.75,
            usage_count: 1,
            last_used: Some(created_at),
            created_at,
        }));

        let found = must_some(must_ok(store.find_correction_memory("tax_included")));
        assert_eq!(found.action, "recalculate tax from gross total");
        let listed = must_ok(store.list_correction_memories());
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn resolution_memory_roundtrip() {
        let mut store = open_store();
        let created_at = must_ok(parse_rfc3339_utc("2024-02-01T08:00:00Z"));
        must_ok(store.insert_resolution_memory(&ResolutionMemory {
            id: None,
            issue_type: "serviceDate".to_string(),
            resolution: "Leistungsdatum in rawText maps to serviceDate".to_string(),
            human_approved: true,
            confidence: 0.7,
            usage_count: 1,
            last_used: Some(created_at),
            created_at,
        }));

        let listed = must_ok(store.list_resolution_memories());
        assert_eq!(listed.len(), 1);
        assert!(listed[0].human_approved);
    }

    #[test]
    fn duplicate_registry_matches_vendor_and_number() {
        let mut store = open_store();
        must_ok(store.mark_invoice_processed(
            "INV-A-001",
            "Supplier GmbH",
            "R-2024-1001",
            "2024-03-07",
        ));

        assert!(must_ok(
            store.is_duplicate_invoice("Supplier GmbH", "R-2024-1001")
        ));
        assert!(!must_ok(
            store.is_duplicate_invoice("Supplier GmbH", "R-2024-1002")
        ));
        assert!(!must_ok(
            store.is_duplicate_invoice("Anderer AG", "R-2024-1001")
        ));
    }

    #[test]
    fn marking_processed_is_idempotent_per_invoice_id() {
        let mut store = open_store();
        for _ in 0..3 {
            must_ok(store.mark_invoice_processed(
                "INV-A-001",
                "Supplier GmbH",
                "R-2024-1001",
                "2024-03-07",
            ));
        }

        let count: i64 = must_ok(store.conn.query_row(
            "SELECT COUNT(*) FROM processed_invoices",
            [],
            |row| row.get(0),
        ));
        assert_eq!(count, 1);
    }

    #[test]
    fn audit_log_appends_and_lists_in_order() {
        let mut log = must_ok(SqliteAuditLog::open_in_memory());
        must_ok(log.migrate());
        let run_id = RunId::new();

        must_ok(log.append(run_id, "INV-A-001", PipelineStage::Recall, "recalled 3"));
        must_ok(log.append(run_id, "INV-A-001", PipelineStage::Apply, "applied 1"));
        must_ok(log.append(run_id, "INV-B-001", PipelineStage::Decide, "other invoice"));

        let rows = must_ok(log.list_for_invoice("INV-A-001"));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stage, PipelineStage::Recall);
        assert_eq!(rows[1].stage, PipelineStage::Apply);
        assert_eq!(rows[0].run_id, run_id.to_string());
        assert!(rows[0].id < rows[1].id);
    }

    mod reinforcement_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn reinforcement_is_monotone_and_capped(
                seed in 0.31f32..0.94,
                steps in 1usize..10,
            ) {
                let mut store = open_store();
                let ruleset = PipelineRuleset::v1();
                let id = must_ok(store.insert_vendor_memory(&vendor_memory(
                    "Leistungsdatum",
                    seed,
                    None,
                )));

                let mut previous = seed;
                for _ in 0..steps {
                    let current = must_some(must_ok(
                        store.find_vendor_memory("Supplier GmbH", "Leistungsdatum"),
                    ));
                    let next = reinforced_confidence(current.confidence, &ruleset);
                    must_ok(store.reinforce(MemoryKind::VendorPattern, id, next, true));
                    prop_assert!(next >= previous);
                    prop_assert!(next <= ruleset.reinforcement_cap + 1e-6);
                    previous = next;
                }

                let final_memory = must_some(must_ok(
                    store.find_vendor_memory("Supplier GmbH", "Leistungsdatum"),
                ));
                prop_assert_eq!(final_memory.usage_count as usize, 1 + steps);
            }
        }
    }
}
