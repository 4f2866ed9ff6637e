//! JSON documents addressed by `(collection, id)`.

use std::{fmt, thread, time::Duration};

use anyhow::Context;
use chrono::Utc;
use log::warn;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};

use super::Database;
use crate::error::{Result, StudyError};

const RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocRef {
    pub collection: String,
    pub id: String,
}

impl DocRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn session(session_id: &str) -> Self {
        Self::new("sessions", session_id)
    }

    /// Results live in a per-session subcollection keyed by case id.
    pub fn result(session_id: &str, case_id: &str) -> Self {
        Self::new(Self::results_collection(session_id), case_id)
    }

    pub fn results_collection(session_id: &str) -> String {
        format!("sessions/{session_id}/results")
    }

    pub fn facility(facility_id: &str) -> Self {
        Self::new("facilities", facility_id)
    }

    pub fn reader(email: &str) -> Self {
        Self::new("readers", email)
    }

    pub fn case(case_id: &str) -> Self {
        Self::new("cases", case_id)
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

fn decode<T: DeserializeOwned>(body: &str, what: &str) -> Result<T> {
    serde_json::from_str(body)
        .with_context(|| format!("failed to decode {what}"))
        .map_err(StudyError::from)
}

/// Document operations inside one SQLite transaction.
pub struct DocTransaction<'a> {
    conn: &'a Connection,
}

impl<'a> DocTransaction<'a> {
    pub(super) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get<T: DeserializeOwned>(&self, doc: &DocRef) -> Result<Option<T>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![doc.collection, doc.id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| decode(&body, &doc.to_string())).transpose()
    }

    pub fn exists(&self, doc: &DocRef) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM documents WHERE collection = ?1 AND id = ?2",
                params![doc.collection, doc.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Writes `value`, replacing any previous body. Returns whether the
    /// document already existed.
    pub fn put<T: Serialize>(&self, doc: &DocRef, value: &T) -> Result<bool> {
        let existed = self.exists(doc)?;
        let body = serde_json::to_string(value)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO documents (collection, id, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (collection, id)
                 DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![doc.collection, doc.id, body, now],
            )
            .with_context(|| format!("failed to write {doc}"))?;
        Ok(existed)
    }

    pub fn delete(&self, doc: &DocRef) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![doc.collection, doc.id],
        )?;
        Ok(removed > 0)
    }

    pub fn delete_collection(&self, collection: &str) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1",
            params![collection],
        )?;
        Ok(removed)
    }

    /// Every document in `collection`, ordered by id.
    pub fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![collection])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let body: String = row.get(1)?;
            documents.push(decode(&body, &format!("{collection}/{id}"))?);
        }
        Ok(documents)
    }

    /// Documents whose top-level text `field` equals `value`, ordered by id.
    pub fn find_by<T: DeserializeOwned>(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<T>> {
        let path = format!("$.{field}");
        let mut stmt = self.conn.prepare(
            "SELECT id, body FROM documents
             WHERE collection = ?1 AND json_extract(body, ?2) = ?3
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![collection, path, value])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let body: String = row.get(1)?;
            documents.push(decode(&body, &format!("{collection}/{id}"))?);
        }
        Ok(documents)
    }
}

fn is_conflict(err: &StudyError) -> bool {
    let StudyError::Store(inner) = err else {
        return false;
    };
    matches!(
        inner.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(failure, _))
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn try_transaction<F, T>(conn: &mut Connection, body: &mut F) -> Result<T>
where
    F: FnMut(&DocTransaction<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = {
        let doc_tx = DocTransaction::new(&tx);
        body(&doc_tx)?
    };
    tx.commit()?;
    Ok(value)
}

/// Runs `body` in an immediate transaction, re-running it from scratch when
/// another writer holds the database.
pub(super) fn run_transaction<F, T>(conn: &mut Connection, retries: u32, mut body: F) -> Result<T>
where
    F: FnMut(&DocTransaction<'_>) -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match try_transaction(conn, &mut body) {
            Err(err) if is_conflict(&err) && attempt < retries => {
                attempt += 1;
                warn!("Transaction conflict, retrying ({attempt}/{retries}): {err}");
                thread::sleep(RETRY_BACKOFF * attempt);
            }
            other => return other,
        }
    }
}

impl Database {
    /// Atomic multi-document read-modify-write.
    pub async fn transaction<F, T>(&self, body: F) -> Result<T>
    where
        F: FnMut(&DocTransaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let retries = self.transaction_retries;
        self.execute(move |conn| run_transaction(conn, retries, body))
            .await
    }

    /// Read-modify-write of one document. `Ok(None)` when it does not exist.
    pub async fn atomic_update<T, R, F>(&self, doc: DocRef, mut mutator: F) -> Result<Option<R>>
    where
        T: Serialize + DeserializeOwned + 'static,
        R: Send + 'static,
        F: FnMut(&mut T) -> Result<R> + Send + 'static,
    {
        self.transaction(move |tx| {
            let Some(mut value) = tx.get::<T>(&doc)? else {
                return Ok(None);
            };
            let outcome = mutator(&mut value)?;
            tx.put(&doc, &value)?;
            Ok(Some(outcome))
        })
        .await
    }

    pub async fn get<T>(&self, doc: DocRef) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute(move |conn| DocTransaction::new(conn).get(&doc))
            .await
    }

    pub async fn put<T>(&self, doc: DocRef, value: T) -> Result<bool>
    where
        T: Serialize + Send + 'static,
    {
        self.execute(move |conn| DocTransaction::new(conn).put(&doc, &value))
            .await
    }

    pub async fn list<T>(&self, collection: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let collection = collection.to_string();
        self.execute(move |conn| DocTransaction::new(conn).list(&collection))
            .await
    }

    pub async fn find_by<T>(&self, collection: &str, field: &str, value: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let collection = collection.to_string();
        let field = field.to_string();
        let value = value.to_string();
        self.execute(move |conn| DocTransaction::new(conn).find_by(&collection, &field, &value))
            .await
    }

    /// Best-effort batch delete: missing documents are skipped. Returns how
    /// many documents were removed.
    pub async fn delete_many(&self, docs: Vec<DocRef>, collections: Vec<String>) -> Result<usize> {
        self.transaction(move |tx| {
            let mut removed = 0;
            for collection in &collections {
                removed += tx.delete_collection(collection)?;
            }
            for doc in &docs {
                if tx.delete(doc)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }
}
