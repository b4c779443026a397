//! Routing record store
//!
//! Maps a routing key (hostname) to a single backend target and a proxy mode.
//! Records are read on every dispatch decision; there is no cached copy, so a
//! committed mutation is visible to the very next connection.

use crate::db::{is_unique_violation, now_timestamp, Database};
use crate::error::{GatewayError, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const MAX_CERT_REF_LEN: usize = 64;

/// How the dispatch engine forwards traffic for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyMode {
    /// HTTP reverse proxy on the plain listener
    Plain,
    /// TLS terminated here, decrypted HTTP forwarded
    TlsTerminate,
    /// Raw bytes relayed, TLS end to end with the backend
    TlsPassthrough,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Plain => "plain",
            ProxyMode::TlsTerminate => "tls-terminate",
            ProxyMode::TlsPassthrough => "tls-passthrough",
        }
    }

    /// Listener on which records of this mode are resolved
    pub fn listener_class(&self) -> ListenerClass {
        match self {
            ProxyMode::Plain => ListenerClass::Http,
            ProxyMode::TlsTerminate | ProxyMode::TlsPassthrough => ListenerClass::Tls,
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(ProxyMode::Plain),
            "tls-terminate" => Ok(ProxyMode::TlsTerminate),
            "tls-passthrough" => Ok(ProxyMode::TlsPassthrough),
            other => Err(GatewayError::validation(format!("unknown proxy mode '{}'", other))),
        }
    }
}

impl ToSql for ProxyMode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ProxyMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: GatewayError| FromSqlError::Other(Box::new(e)))
    }
}

/// The listener a routing key is unique within
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerClass {
    Http,
    Tls,
}

impl ListenerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerClass::Http => "http",
            ListenerClass::Tls => "tls",
        }
    }
}

impl fmt::Display for ListenerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a routing key: trim, lower-case, drop one trailing dot.
///
/// Rejects anything that is not a syntactically valid hostname.
pub fn normalize_routing_key(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let host = trimmed.strip_suffix('.').unwrap_or(trimmed).to_ascii_lowercase();

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return Err(GatewayError::validation(format!(
            "routing key must be 1-{} characters",
            MAX_HOSTNAME_LEN
        )));
    }

    for label in host.split('.') {
        if !is_valid_label(label) {
            return Err(GatewayError::validation(format!(
                "'{}' is not a valid hostname",
                raw.trim()
            )));
        }
    }

    Ok(host)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Validate a certificate reference (a file stem in the certificate directory)
pub fn validate_cert_ref(cert: &str) -> Result<()> {
    let valid = !cert.is_empty()
        && cert.len() <= MAX_CERT_REF_LEN
        && !cert.contains("..")
        && cert
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(GatewayError::validation(format!(
            "invalid certificate reference '{}'",
            cert
        )))
    }
}

/// A backend address in normalized `host:port` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
}

impl BackendTarget {
    /// Parse `host:port`, `http://host[:port]` or `https://host[:port]`.
    ///
    /// `https://` only makes sense for passthrough, where the backend speaks TLS.
    pub fn parse(raw: &str, mode: ProxyMode) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(GatewayError::validation("target must not be empty"));
        }

        let lower = raw.to_ascii_lowercase();
        let (rest, default_port) = if lower.starts_with("http://") {
            (&raw["http://".len()..], Some(80))
        } else if lower.starts_with("https://") {
            if mode != ProxyMode::TlsPassthrough {
                return Err(GatewayError::validation(
                    "https:// targets are only supported for tls-passthrough records",
                ));
            }
            (&raw["https://".len()..], Some(443))
        } else if raw.contains("://") {
            return Err(GatewayError::validation(format!(
                "unsupported target scheme in '{}'",
                raw
            )));
        } else {
            (raw, None)
        };

        let authority = match rest.split_once('/') {
            Some((authority, "")) => authority,
            Some(_) => {
                return Err(GatewayError::validation(
                    "target must not carry a path",
                ))
            }
            None => rest,
        };

        let (host, port) = split_host_port(authority)?;
        let port = match (port, default_port) {
            (Some(p), _) => p,
            (None, Some(p)) => p,
            (None, None) => {
                return Err(GatewayError::validation(format!(
                    "target '{}' must include a port",
                    raw
                )))
            }
        };

        Ok(Self { host, port })
    }

    /// `host:port` as used for dialing and as the request authority
    pub fn authority(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn split_host_port(authority: &str) -> Result<(String, Option<u16>)> {
    let invalid = || GatewayError::validation(format!("invalid target address '{}'", authority));

    let bracketed = authority.starts_with('[');
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
        let port = match after {
            "" => None,
            p => Some(p.strip_prefix(':').ok_or_else(invalid)?),
        };
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), Some(port)),
            None => (authority.to_string(), None),
        }
    };

    let port = match port {
        Some(p) => match p.parse::<u16>() {
            Ok(0) | Err(_) => return Err(invalid()),
            Ok(p) => Some(p),
        },
        None => None,
    };

    if bracketed {
        return Ok((host, port));
    }
    if host.parse::<Ipv4Addr>().is_ok() {
        return Ok((host, port));
    }
    let host = normalize_routing_key(&host).map_err(|_| invalid())?;
    Ok((host, port))
}

/// A persisted routing record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub id: String,
    pub key: String,
    pub target: String,
    pub mode: ProxyMode,
    pub certificate: Option<String>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl RoutingRecord {
    pub fn listener_class(&self) -> ListenerClass {
        self.mode.listener_class()
    }
}

/// Input for creating a record
#[derive(Debug, Clone, Deserialize)]
pub struct NewRecord {
    pub key: String,
    pub target: String,
    #[serde(default = "default_mode")]
    pub mode: ProxyMode,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewRecord {
    pub fn new(key: impl Into<String>, target: impl Into<String>, mode: ProxyMode) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
            mode,
            certificate: None,
            enabled: true,
        }
    }

    pub fn with_certificate(mut self, certificate: impl Into<String>) -> Self {
        self.certificate = Some(certificate.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn default_mode() -> ProxyMode {
    ProxyMode::Plain
}

fn default_enabled() -> bool {
    true
}

/// Partial update. `certificate: null` clears the reference, omission keeps it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordPatch {
    pub key: Option<String>,
    pub target: Option<String>,
    pub mode: Option<ProxyMode>,
    #[serde(default, deserialize_with = "present_or_null")]
    pub certificate: Option<Option<String>>,
    pub enabled: Option<bool>,
}

fn present_or_null<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Fields after validation, ready to be written
struct ValidFields {
    key: String,
    target: String,
    mode: ProxyMode,
    certificate: Option<String>,
}

fn validate_fields(
    key: &str,
    target: &str,
    mode: ProxyMode,
    certificate: Option<&str>,
) -> Result<ValidFields> {
    let key = normalize_routing_key(key)?;
    let target = BackendTarget::parse(target, mode)?.authority();

    let certificate = certificate.map(str::trim).filter(|c| !c.is_empty());
    match (mode, certificate) {
        (ProxyMode::TlsTerminate, None) => {
            return Err(GatewayError::validation(
                "tls-terminate records require a certificate reference",
            ))
        }
        (ProxyMode::TlsTerminate, Some(cert)) => validate_cert_ref(cert)?,
        (_, Some(_)) => {
            return Err(GatewayError::validation(format!(
                "{} records must not carry a certificate reference",
                mode
            )))
        }
        (_, None) => {}
    }

    Ok(ValidFields {
        key,
        target,
        mode,
        certificate: certificate.map(str::to_string),
    })
}

fn conflict_for(key: &str, mode: ProxyMode) -> GatewayError {
    GatewayError::conflict(format!(
        "an enabled {} record for '{}' already exists",
        mode.listener_class(),
        key
    ))
}

const RECORD_COLUMNS: &str = "id, routing_key, target, mode, certificate, enabled, \
                              created_at, updated_at, created_by, updated_by";

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoutingRecord> {
    Ok(RoutingRecord {
        id: row.get(0)?,
        key: row.get(1)?,
        target: row.get(2)?,
        mode: row.get(3)?,
        certificate: row.get(4)?,
        enabled: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        created_by: row.get(8)?,
        updated_by: row.get(9)?,
    })
}

/// Persistent routing table
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Database>,
}

impl RecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Validate and insert a record on behalf of `actor`
    pub fn create(&self, new: NewRecord, actor: &str) -> Result<RoutingRecord> {
        let fields = validate_fields(&new.key, &new.target, new.mode, new.certificate.as_deref())?;
        let now = now_timestamp();
        let record = RoutingRecord {
            id: uuid::Uuid::new_v4().to_string(),
            key: fields.key,
            target: fields.target,
            mode: fields.mode,
            certificate: fields.certificate,
            enabled: new.enabled,
            created_at: now.clone(),
            updated_at: now,
            created_by: Some(actor.to_string()),
            updated_by: Some(actor.to_string()),
        };

        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO routing_records
                (id, routing_key, listener_class, target, mode, certificate, enabled,
                 created_at, updated_at, created_by, updated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.key,
                record.listener_class().as_str(),
                record.target,
                record.mode,
                record.certificate,
                record.enabled,
                record.created_at,
                record.updated_at,
                record.created_by,
                record.updated_by,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                conflict_for(&record.key, record.mode)
            } else {
                e.into()
            }
        })?;

        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<RoutingRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM routing_records ORDER BY created_at, rowid",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn get(&self, id: &str) -> Result<RoutingRecord> {
        let conn = self.db.conn();
        conn.query_row(
            &format!("SELECT {} FROM routing_records WHERE id = ?1", RECORD_COLUMNS),
            params![id],
            record_from_row,
        )
        .optional()?
        .ok_or(GatewayError::NotFound)
    }

    /// Merge a patch into the stored record, re-validate and write it
    pub fn update(&self, id: &str, patch: RecordPatch, actor: &str) -> Result<RoutingRecord> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                &format!("SELECT {} FROM routing_records WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                record_from_row,
            )
            .optional()?
            .ok_or(GatewayError::NotFound)?;

        let mode = patch.mode.unwrap_or(current.mode);
        let certificate = match patch.certificate {
            Some(cert) => cert,
            None => current.certificate.clone(),
        };
        let fields = validate_fields(
            patch.key.as_deref().unwrap_or(&current.key),
            patch.target.as_deref().unwrap_or(&current.target),
            mode,
            certificate.as_deref(),
        )?;

        let updated = RoutingRecord {
            key: fields.key,
            target: fields.target,
            mode: fields.mode,
            certificate: fields.certificate,
            enabled: patch.enabled.unwrap_or(current.enabled),
            updated_at: now_timestamp(),
            updated_by: Some(actor.to_string()),
            ..current
        };

        tx.execute(
            "UPDATE routing_records SET
                routing_key = ?2, listener_class = ?3, target = ?4, mode = ?5,
                certificate = ?6, enabled = ?7, updated_at = ?8, updated_by = ?9
             WHERE id = ?1",
            params![
                updated.id,
                updated.key,
                updated.listener_class().as_str(),
                updated.target,
                updated.mode,
                updated.certificate,
                updated.enabled,
                updated.updated_at,
                updated.updated_by,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                conflict_for(&updated.key, updated.mode)
            } else {
                GatewayError::from(e)
            }
        })?;
        tx.commit()?;

        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.db.conn();
        let rows = conn.execute("DELETE FROM routing_records WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(GatewayError::NotFound);
        }
        Ok(())
    }

    /// Find the enabled record for a routing key on the given listener.
    ///
    /// Keys that are not valid hostnames never match.
    pub fn resolve(&self, class: ListenerClass, key: &str) -> Result<Option<RoutingRecord>> {
        let Ok(key) = normalize_routing_key(key) else {
            return Ok(None);
        };

        let conn = self.db.conn();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM routing_records
                     WHERE listener_class = ?1 AND routing_key = ?2 AND enabled = 1",
                    RECORD_COLUMNS
                ),
                params![class.as_str(), key],
                record_from_row,
            )
            .optional()?)
    }
}
