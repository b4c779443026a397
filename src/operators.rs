//! Credential store: operator identities with hashed secrets

use crate::db::{is_unique_violation, now_timestamp, Database};
use crate::error::{GatewayError, Result};
use crate::password;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Identifier of the operator created on first start
pub const BOOTSTRAP_IDENTIFIER: &str = "admin@localhost";

const MAX_IDENTIFIER_LEN: usize = 254;
const MAX_SECRET_LEN: usize = 1024;

/// An operator as exposed outside the store. The secret hash never leaves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operator {
    pub id: String,
    pub identifier: String,
    pub created_at: String,
}

/// Partial update for an operator
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatorPatch {
    pub identifier: Option<String>,
    pub secret: Option<String>,
}

/// Normalize and validate an email-like identifier
pub fn normalize_identifier(raw: &str) -> Result<String> {
    let identifier = raw.trim().to_lowercase();

    if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(GatewayError::validation(format!(
            "identifier must be 1-{} characters",
            MAX_IDENTIFIER_LEN
        )));
    }
    if identifier.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(GatewayError::validation("identifier must not contain whitespace"));
    }

    match identifier.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(identifier)
        }
        _ => Err(GatewayError::validation(
            "identifier must look like an email address (name@domain)",
        )),
    }
}

fn validate_secret(secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(GatewayError::validation("secret must not be empty"));
    }
    if secret.len() > MAX_SECRET_LEN {
        return Err(GatewayError::validation(format!(
            "secret must be at most {} bytes",
            MAX_SECRET_LEN
        )));
    }
    Ok(())
}

fn operator_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operator> {
    Ok(Operator {
        id: row.get(0)?,
        identifier: row.get(1)?,
        created_at: row.get(2)?,
    })
}

/// Persistent operator table
#[derive(Clone)]
pub struct OperatorStore {
    db: Arc<Database>,
    hash_iterations: u32,
    /// Hash verified when the identifier is unknown, so both failure paths cost the same
    decoy_hash: Arc<String>,
}

impl OperatorStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_hash_iterations(db, password::DEFAULT_ITERATIONS)
    }

    /// Use a custom hashing cost (lower values are only sensible in tests)
    pub fn with_hash_iterations(db: Arc<Database>, hash_iterations: u32) -> Self {
        let decoy_hash = password::hash_secret(&password::generate_secret(), hash_iterations);
        Self {
            db,
            hash_iterations,
            decoy_hash: Arc::new(decoy_hash),
        }
    }

    /// Create an operator. Fails with Conflict if the identifier is taken.
    pub fn create(&self, identifier: &str, secret: &str) -> Result<Operator> {
        let identifier = normalize_identifier(identifier)?;
        validate_secret(secret)?;

        // Hash before taking the lock
        let secret_hash = password::hash_secret(secret, self.hash_iterations);
        let operator = Operator {
            id: uuid::Uuid::new_v4().to_string(),
            identifier,
            created_at: now_timestamp(),
        };

        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO operators (id, identifier, secret_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![operator.id, operator.identifier, secret_hash, operator.created_at],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                GatewayError::conflict(format!("operator '{}' already exists", operator.identifier))
            } else {
                e.into()
            }
        })?;

        Ok(operator)
    }

    /// Verify credentials. Unknown identifiers and wrong secrets fail identically.
    pub fn verify(&self, identifier: &str, secret: &str) -> Result<Operator> {
        let identifier = identifier.trim().to_lowercase();

        let found = {
            let conn = self.db.conn();
            conn.query_row(
                "SELECT id, identifier, created_at, secret_hash FROM operators WHERE identifier = ?1",
                params![identifier],
                |row| Ok((operator_from_row(row)?, row.get::<_, String>(3)?)),
            )
            .optional()?
        };

        match found {
            Some((operator, hash)) if password::verify_secret(secret, &hash) => Ok(operator),
            Some(_) => Err(GatewayError::Unauthorized),
            None => {
                password::verify_secret(secret, &self.decoy_hash);
                Err(GatewayError::Unauthorized)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Operator> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT id, identifier, created_at FROM operators WHERE id = ?1",
            params![id],
            operator_from_row,
        )
        .optional()?
        .ok_or(GatewayError::NotFound)
    }

    pub fn find_by_identifier(&self, identifier: &str) -> Result<Option<Operator>> {
        let conn = self.db.conn();
        Ok(conn
            .query_row(
                "SELECT id, identifier, created_at FROM operators WHERE identifier = ?1",
                params![identifier.trim().to_lowercase()],
                operator_from_row,
            )
            .optional()?)
    }

    pub fn list(&self) -> Result<Vec<Operator>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, identifier, created_at FROM operators ORDER BY created_at, rowid",
        )?;
        let operators = stmt
            .query_map([], operator_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(operators)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM operators", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Change identifier and/or secret
    pub fn update(&self, id: &str, patch: OperatorPatch) -> Result<Operator> {
        let identifier = patch
            .identifier
            .as_deref()
            .map(normalize_identifier)
            .transpose()?;
        let secret_hash = match patch.secret.as_deref() {
            Some(secret) => {
                validate_secret(secret)?;
                Some(password::hash_secret(secret, self.hash_iterations))
            }
            None => None,
        };

        {
            let conn = self.db.conn();
            let rows = conn
                .execute(
                    "UPDATE operators SET
                        identifier = COALESCE(?2, identifier),
                        secret_hash = COALESCE(?3, secret_hash)
                     WHERE id = ?1",
                    params![id, identifier, secret_hash],
                )
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        GatewayError::conflict("identifier already in use")
                    } else {
                        e.into()
                    }
                })?;
            if rows == 0 {
                return Err(GatewayError::NotFound);
            }
        }

        self.get(id)
    }

    /// Delete an operator. The last remaining operator cannot be deleted.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row("SELECT 1 FROM operators WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(GatewayError::NotFound);
        }

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM operators", [], |row| row.get(0))?;
        if count <= 1 {
            return Err(GatewayError::conflict("cannot delete the last operator"));
        }

        tx.execute("DELETE FROM operators WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

/// Seed the first operator when the store is empty.
///
/// Returns the generated secret when an operator was created, `None` when the
/// store already had operators. Calling it again is a no-op.
pub fn ensure_bootstrap_operator(store: &OperatorStore) -> Result<Option<String>> {
    if store.count()? > 0 {
        return Ok(None);
    }

    let secret = password::generate_secret();
    match store.create(BOOTSTRAP_IDENTIFIER, &secret) {
        Ok(operator) => {
            info!(operator_id = %operator.id, identifier = %operator.identifier, "Bootstrap operator created");
            Ok(Some(secret))
        }
        // Another process seeded it between the count and the insert
        Err(GatewayError::Conflict(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
