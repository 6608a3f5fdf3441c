// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Write-through persistence.
//!
//! [`UsrlocDb`] is the narrow database capability the store needs.
//! [`Persistence`] maps records and contacts onto the `impu`, `contact` and
//! `impu_contact` tables. Failures after an in-memory change are logged and
//! counted; memory stays authoritative and the change is not rolled back.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::{debug, error};

use crate::contact::Contact;
use crate::impurecord::ImpuRecord;
use crate::metrics::UsrlocMetrics;

pub const IMPU_TABLE: &str = "impu";
pub const CONTACT_TABLE: &str = "contact";
pub const IMPU_CONTACT_TABLE: &str = "impu_contact";

pub mod columns {
    pub const IMPU: &str = "impu";
    pub const BARRING: &str = "barring";
    pub const REG_STATE: &str = "reg_state";
    pub const CCF1: &str = "ccf1";
    pub const CCF2: &str = "ccf2";
    pub const ECF1: &str = "ecf1";
    pub const ECF2: &str = "ecf2";
    pub const SUBSCRIPTION: &str = "ims_subscription_data";
    pub const CONTACT: &str = "contact";
    pub const PARAMS: &str = "params";
    pub const PATH: &str = "path";
    pub const USER_AGENT: &str = "user_agent";
    pub const RECEIVED: &str = "received";
    pub const EXPIRES: &str = "expires";
    pub const CALLID: &str = "callid";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbValue {
    Null,
    Int(i64),
    Str(String),
    Blob(Bytes),
}

impl DbValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            DbValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            DbValue::Blob(b) => Some(b.as_ref()),
            _ => None,
        }
    }

    fn opt_str(value: Option<&str>) -> Self {
        value.map_or(DbValue::Null, |s| DbValue::Str(s.to_owned()))
    }
}

impl fmt::Display for DbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbValue::Null => write!(f, "NULL"),
            DbValue::Int(v) => write!(f, "{}", v),
            DbValue::Str(s) => write!(f, "'{}'", s),
            DbValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// One row as column name to value.
pub type DbRow = BTreeMap<SmolStr, DbValue>;

/// Column/value pairs identifying or filling a row.
pub type Columns<'a> = &'a [(&'a str, DbValue)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    Unavailable(String),
    Query(String),
    Malformed(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Unavailable(msg) => write!(f, "database unavailable: {}", msg),
            DbError::Query(msg) => write!(f, "query failed: {}", msg),
            DbError::Malformed(msg) => write!(f, "malformed row: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

/// Database capability consumed by the store.
pub trait UsrlocDb: Send + Sync {
    fn insert_or_update(&self, table: &str, keys: Columns<'_>, values: Columns<'_>) -> Result<(), DbError>;

    fn delete(&self, table: &str, keys: Columns<'_>) -> Result<(), DbError>;

    fn raw_query(&self, sql: &str) -> Result<Vec<DbRow>, DbError>;

    /// Every row of `table`, used to preload memory at startup.
    fn select_all(&self, table: &str) -> Result<Vec<DbRow>, DbError>;
}

/// In-process table store. Useful for tests and as a mirror when no SQL
/// backend is configured.
#[derive(Default)]
pub struct MemoryUsrlocDb {
    tables: Mutex<HashMap<String, BTreeMap<String, DbRow>>>,
    queries: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl MemoryUsrlocDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw statements seen so far.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn rows(&self, table: &str) -> Vec<DbRow> {
        self.tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), DbError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DbError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn row_key(keys: Columns<'_>) -> String {
        keys.iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl UsrlocDb for MemoryUsrlocDb {
    fn insert_or_update(&self, table: &str, keys: Columns<'_>, values: Columns<'_>) -> Result<(), DbError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let row = tables
            .entry(table.to_owned())
            .or_default()
            .entry(Self::row_key(keys))
            .or_default();
        for (name, value) in keys.iter().chain(values.iter()) {
            row.insert(SmolStr::new(name), value.clone());
        }
        Ok(())
    }

    fn delete(&self, table: &str, keys: Columns<'_>) -> Result<(), DbError> {
        self.check()?;
        let mut tables = self.tables.lock();
        if let Some(rows) = tables.get_mut(table) {
            let matches = |row: &DbRow| {
                keys.iter()
                    .all(|(name, value)| row.get(*name).is_some_and(|v| v == value))
            };
            rows.retain(|_, row| !matches(row));
        }
        Ok(())
    }

    fn raw_query(&self, sql: &str) -> Result<Vec<DbRow>, DbError> {
        self.check()?;
        self.queries.lock().push(sql.to_owned());
        Ok(Vec::new())
    }

    fn select_all(&self, table: &str) -> Result<Vec<DbRow>, DbError> {
        self.check()?;
        Ok(self.rows(table))
    }
}

/// Maps store objects onto the persisted schema.
#[derive(Clone)]
pub struct Persistence {
    db: Arc<dyn UsrlocDb>,
    metrics: UsrlocMetrics,
}

impl Persistence {
    pub fn new(db: Arc<dyn UsrlocDb>, metrics: UsrlocMetrics) -> Self {
        Self { db, metrics }
    }

    pub fn db(&self) -> &Arc<dyn UsrlocDb> {
        &self.db
    }

    /// Logs a write that failed after memory already changed.
    pub fn degraded(&self, op: &str, key: &str, err: &DbError) {
        self.metrics.record_db_error();
        error!(op, key, error = %err, "db write failed, continuing but db will be out of sync!");
    }

    pub fn store_impu(&self, record: &ImpuRecord) -> Result<(), DbError> {
        let blob = match record.subscription() {
            Some(cell) => {
                let doc = cell.read();
                ims_subscription::encode(&doc)
                    .map(|b| DbValue::Blob(Bytes::from(b)))
                    .map_err(|e| DbError::Malformed(e.to_string()))?
            }
            None => DbValue::Null,
        };
        let charging = record.charging();
        self.db.insert_or_update(
            IMPU_TABLE,
            &[(columns::IMPU, DbValue::Str(record.public_identity().to_owned()))],
            &[
                (columns::BARRING, DbValue::Int(record.barring() as i64)),
                (columns::REG_STATE, DbValue::Int(record.reg_state().as_i64())),
                (columns::CCF1, DbValue::opt_str(charging.ccf1.as_deref())),
                (columns::CCF2, DbValue::opt_str(charging.ccf2.as_deref())),
                (columns::ECF1, DbValue::opt_str(charging.ecf1.as_deref())),
                (columns::ECF2, DbValue::opt_str(charging.ecf2.as_deref())),
                (columns::SUBSCRIPTION, blob),
            ],
        )
    }

    pub fn delete_impu(&self, identity: &str) -> Result<(), DbError> {
        self.db.delete(
            IMPU_CONTACT_TABLE,
            &[(columns::IMPU, DbValue::Str(identity.to_owned()))],
        )?;
        self.db
            .delete(IMPU_TABLE, &[(columns::IMPU, DbValue::Str(identity.to_owned()))])
    }

    pub fn store_contact(&self, contact: &Contact) -> Result<(), DbError> {
        self.db.insert_or_update(
            CONTACT_TABLE,
            &[(columns::CONTACT, DbValue::Str(contact.uri().to_owned()))],
            &[
                (columns::PARAMS, DbValue::Str(contact.params_string())),
                (columns::PATH, DbValue::opt_str(contact.path())),
                (columns::USER_AGENT, DbValue::Str(contact.user_agent().to_owned())),
                (columns::RECEIVED, DbValue::opt_str(contact.received())),
                (columns::EXPIRES, DbValue::Int(contact.expires())),
                (columns::CALLID, DbValue::Str(contact.call_id().to_owned())),
            ],
        )
    }

    pub fn delete_contact(&self, uri: &str) -> Result<(), DbError> {
        self.db
            .delete(CONTACT_TABLE, &[(columns::CONTACT, DbValue::Str(uri.to_owned()))])
    }

    pub fn link(&self, identity: &str, uri: &str) -> Result<(), DbError> {
        self.db.insert_or_update(
            IMPU_CONTACT_TABLE,
            &[
                (columns::IMPU, DbValue::Str(identity.to_owned())),
                (columns::CONTACT, DbValue::Str(uri.to_owned())),
            ],
            &[],
        )
    }

    pub fn unlink(&self, identity: &str, uri: &str) -> Result<(), DbError> {
        self.db.delete(
            IMPU_CONTACT_TABLE,
            &[
                (columns::IMPU, DbValue::Str(identity.to_owned())),
                (columns::CONTACT, DbValue::Str(uri.to_owned())),
            ],
        )
    }

    pub fn begin(&self) -> Result<(), DbError> {
        for sql in [
            "SET AUTOCOMMIT=0",
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            "START TRANSACTION",
        ] {
            self.db.raw_query(sql)?;
        }
        debug!("db transaction started");
        Ok(())
    }

    pub fn commit(&self) -> Result<(), DbError> {
        self.db.raw_query("COMMIT")?;
        self.db.raw_query("SET AUTOCOMMIT=1")?;
        Ok(())
    }
}

/// Lazily opened transaction around the DB work of one record.
pub(crate) struct RecordTxn<'a> {
    db: &'a Persistence,
    open: bool,
}

impl<'a> RecordTxn<'a> {
    pub(crate) fn new(db: &'a Persistence) -> Self {
        Self { db, open: false }
    }

    pub(crate) fn db(&mut self) -> &'a Persistence {
        if !self.open {
            if let Err(err) = self.db.begin() {
                self.db.degraded("begin", "", &err);
            }
            self.open = true;
        }
        self.db
    }

    pub(crate) fn finish(self) {
        if self.open {
            if let Err(err) = self.db.commit() {
                self.db.degraded("commit", "", &err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_db_upserts_by_key() {
        let db = MemoryUsrlocDb::new();
        let key = [("impu", DbValue::Str("sip:a@x".into()))];
        db.insert_or_update("impu", &key, &[("barring", DbValue::Int(0))])
            .unwrap();
        db.insert_or_update("impu", &key, &[("barring", DbValue::Int(1))])
            .unwrap();
        let rows = db.rows("impu");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("barring"), Some(&DbValue::Int(1)));
    }

    #[test]
    fn memory_db_delete_matches_partial_key() {
        let db = MemoryUsrlocDb::new();
        for contact in ["sip:c1", "sip:c2"] {
            db.insert_or_update(
                IMPU_CONTACT_TABLE,
                &[
                    ("impu", DbValue::Str("sip:a@x".into())),
                    ("contact", DbValue::Str(contact.into())),
                ],
                &[],
            )
            .unwrap();
        }
        db.delete(IMPU_CONTACT_TABLE, &[("impu", DbValue::Str("sip:a@x".into()))])
            .unwrap();
        assert!(db.rows(IMPU_CONTACT_TABLE).is_empty());
    }

    #[test]
    fn failure_injection_and_degraded_counter() {
        let db = Arc::new(MemoryUsrlocDb::new());
        let metrics = UsrlocMetrics::new();
        let persistence = Persistence::new(db.clone(), metrics.clone());
        db.set_failing(true);
        let err = persistence.link("sip:a@x", "sip:c").unwrap_err();
        persistence.degraded("link", "sip:a@x", &err);
        assert_eq!(metrics.snapshot().db_errors, 1);
        db.set_failing(false);
        assert!(persistence.link("sip:a@x", "sip:c").is_ok());
    }

    #[test]
    fn transaction_is_only_opened_when_used() {
        let db = Arc::new(MemoryUsrlocDb::new());
        let persistence = Persistence::new(db.clone(), UsrlocMetrics::new());
        RecordTxn::new(&persistence).finish();
        assert!(db.queries().is_empty());

        let mut txn = RecordTxn::new(&persistence);
        txn.db().unlink("sip:a@x", "sip:c").unwrap();
        txn.db().unlink("sip:a@x", "sip:d").unwrap();
        txn.finish();
        assert_eq!(
            db.queries(),
            vec![
                "SET AUTOCOMMIT=0",
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
                "START TRANSACTION",
                "COMMIT",
                "SET AUTOCOMMIT=1",
            ]
        );
    }
}
