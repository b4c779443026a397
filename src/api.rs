//! Control API: token issuance plus CRUD over operators and routing records
//!
//! Everything except `POST /api/token` requires `Authorization: Bearer <token>`.
//! The authenticated [`Identity`] is attached to the request extensions before
//! a handler runs, and record mutations are stamped with its identifier.

use crate::auth::{AuthGate, Identity};
use crate::error::{json_error_response, ErrorCode, GatewayError, Result};
use crate::operators::{OperatorPatch, OperatorStore};
use crate::records::{NewRecord, RecordPatch, RecordStore};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Largest request body accepted by the API
const MAX_BODY_BYTES: usize = 64 * 1024;

pub type ApiResponse = Response<BoxBody<Bytes, hyper::Error>>;

#[derive(Debug, Deserialize)]
struct TokenRequest {
    identifier: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct CreateOperatorRequest {
    identifier: String,
    secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Token,
    Users,
    User(&'a str),
    Records,
    Record(&'a str),
}

impl Route<'_> {
    fn allows(&self, method: &Method) -> bool {
        match self {
            Route::Token => method == Method::POST,
            Route::Users | Route::Records => method == Method::GET || method == Method::POST,
            Route::User(_) | Route::Record(_) => {
                method == Method::GET || method == Method::PUT || method == Method::DELETE
            }
        }
    }
}

fn parse_route(path: &str) -> Option<Route<'_>> {
    let rest = path.strip_prefix("/api/")?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);

    let (collection, id) = match rest.split_once('/') {
        Some((collection, id)) => (collection, Some(id)),
        None => (rest, None),
    };
    if id.is_some_and(|id| id.is_empty() || id.contains('/')) {
        return None;
    }

    match (collection, id) {
        ("token", None) => Some(Route::Token),
        ("users", None) => Some(Route::Users),
        ("users", Some(id)) => Some(Route::User(id)),
        ("records", None) => Some(Route::Records),
        ("records", Some(id)) => Some(Route::Record(id)),
        _ => None,
    }
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<ApiResponse> {
    let body = serde_json::to_vec(value)
        .map_err(|e| GatewayError::Store(format!("response serialization failed: {}", e)))?;
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header"))
}

fn no_content() -> ApiResponse {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

async fn read_json<T, B>(body: B) -> Result<T>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| GatewayError::validation(format!("unreadable request body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::validation(format!("invalid JSON body: {}", e)))
}

/// Run credential hashing on the blocking pool so dispatch workers keep running
async fn hashing<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| GatewayError::Store(format!("hashing task failed: {}", e)))?
}

fn identity<B>(req: &Request<B>) -> Result<Identity> {
    req.extensions()
        .get::<Identity>()
        .cloned()
        .ok_or(GatewayError::Unauthenticated)
}

/// Router and handlers, built from explicit store and gate handles
#[derive(Clone)]
pub struct ControlApi {
    operators: OperatorStore,
    records: RecordStore,
    auth: AuthGate,
}

impl ControlApi {
    pub fn new(operators: OperatorStore, records: RecordStore, auth: AuthGate) -> Self {
        Self {
            operators,
            records,
            auth,
        }
    }

    /// Handle one request under `/api/`. Never fails; errors become JSON bodies.
    pub async fn handle<B>(&self, mut req: Request<B>) -> ApiResponse
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, "Control API request");

        let Some(route) = parse_route(&path) else {
            return json_error_response(ErrorCode::NotFound, "Resource not found");
        };
        if !route.allows(&method) {
            return json_error_response(
                ErrorCode::MethodNotAllowed,
                format!("{} is not allowed on {}", method, path),
            );
        }

        if route != Route::Token {
            let header = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            match self.auth.authenticate_header(header) {
                Ok(identity) => {
                    req.extensions_mut().insert(identity);
                }
                Err(e) => {
                    warn!(%method, %path, "Unauthenticated control API request");
                    return render_error(e);
                }
            }
        }

        let result = match (method, route) {
            (Method::POST, Route::Token) => self.issue_token(req).await,
            (Method::POST, Route::Users) => self.create_operator(req).await,
            (Method::GET, Route::Users) => self.list_operators(),
            (Method::GET, Route::User(id)) => self.show_operator(id),
            (Method::PUT, Route::User(id)) => self.update_operator(id, req).await,
            (Method::DELETE, Route::User(id)) => self.delete_operator(id, &req),
            (Method::POST, Route::Records) => self.create_record(req).await,
            (Method::GET, Route::Records) => self.list_records(),
            (Method::GET, Route::Record(id)) => self.show_record(id),
            (Method::PUT, Route::Record(id)) => self.update_record(id, req).await,
            (Method::DELETE, Route::Record(id)) => self.delete_record(id, &req),
            _ => Err(GatewayError::NotFound),
        };

        result.unwrap_or_else(render_error)
    }

    async fn issue_token<B>(&self, req: Request<B>) -> Result<ApiResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let TokenRequest { identifier, secret } = read_json(req.into_body()).await?;
        let auth = self.auth.clone();
        let attempted = identifier.clone();
        let issued = hashing(move || auth.issue_token(&attempted, &secret)).await;
        match issued {
            Ok(issued) => {
                info!(identifier = %identifier.trim().to_lowercase(), "Token issued");
                json_response(StatusCode::OK, &issued)
            }
            Err(e) => {
                warn!(identifier = %identifier, "Token request rejected");
                Err(e)
            }
        }
    }

    async fn create_operator<B>(&self, req: Request<B>) -> Result<ApiResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let actor = identity(&req)?;
        let CreateOperatorRequest { identifier, secret } = read_json(req.into_body()).await?;
        let operators = self.operators.clone();
        let operator = hashing(move || operators.create(&identifier, &secret)).await?;
        info!(actor = %actor.identifier, operator_id = %operator.id, identifier = %operator.identifier, "Operator created");
        json_response(StatusCode::CREATED, &operator)
    }

    fn list_operators(&self) -> Result<ApiResponse> {
        json_response(StatusCode::OK, &self.operators.list()?)
    }

    fn show_operator(&self, id: &str) -> Result<ApiResponse> {
        json_response(StatusCode::OK, &self.operators.get(id)?)
    }

    async fn update_operator<B>(&self, id: &str, req: Request<B>) -> Result<ApiResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let actor = identity(&req)?;
        let patch: OperatorPatch = read_json(req.into_body()).await?;
        let secret_changed = patch.secret.is_some();
        let operators = self.operators.clone();
        let id = id.to_string();
        let operator = hashing(move || operators.update(&id, patch)).await?;
        info!(actor = %actor.identifier, operator_id = %operator.id, identifier = %operator.identifier, secret_changed, "Operator updated");
        json_response(StatusCode::OK, &operator)
    }

    fn delete_operator<B>(&self, id: &str, req: &Request<B>) -> Result<ApiResponse> {
        let actor = identity(req)?;
        self.operators.delete(id)?;
        info!(actor = %actor.identifier, operator_id = id, "Operator deleted");
        Ok(no_content())
    }

    async fn create_record<B>(&self, req: Request<B>) -> Result<ApiResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let actor = identity(&req)?;
        let new: NewRecord = read_json(req.into_body()).await?;
        let record = self.records.create(new, &actor.identifier)?;
        info!(
            actor = %actor.identifier,
            record_id = %record.id,
            key = %record.key,
            backend = %record.target,
            mode = %record.mode,
            "Record created"
        );
        json_response(StatusCode::CREATED, &record)
    }

    fn list_records(&self) -> Result<ApiResponse> {
        json_response(StatusCode::OK, &self.records.list()?)
    }

    fn show_record(&self, id: &str) -> Result<ApiResponse> {
        json_response(StatusCode::OK, &self.records.get(id)?)
    }

    async fn update_record<B>(&self, id: &str, req: Request<B>) -> Result<ApiResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let actor = identity(&req)?;
        let patch: RecordPatch = read_json(req.into_body()).await?;
        let record = self.records.update(id, patch, &actor.identifier)?;
        info!(
            actor = %actor.identifier,
            record_id = %record.id,
            key = %record.key,
            backend = %record.target,
            mode = %record.mode,
            enabled = record.enabled,
            "Record updated"
        );
        json_response(StatusCode::OK, &record)
    }

    fn delete_record<B>(&self, id: &str, req: &Request<B>) -> Result<ApiResponse> {
        let actor = identity(req)?;
        self.records.delete(id)?;
        info!(actor = %actor.identifier, record_id = id, "Record deleted");
        Ok(no_content())
    }
}

fn render_error(e: GatewayError) -> ApiResponse {
    if let GatewayError::Store(detail) = &e {
        error!(error = %detail, "Control API store failure");
    }
    e.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::db::Database;
    use crate::error::X_GATEWAY_ERROR;
    use std::sync::Arc;

    struct Harness {
        api: ControlApi,
        operators: OperatorStore,
        records: RecordStore,
        token: String,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let operators = OperatorStore::with_hash_iterations(Arc::clone(&db), 10);
        let records = RecordStore::new(db);
        let auth = AuthGate::new(
            AuthConfig {
                secret: "test-secret".to_string(),
                token_ttl_secs: 3600,
            },
            operators.clone(),
        );
        operators.create("ops@example.com", "hunter22").unwrap();
        let token = auth.issue_token("ops@example.com", "hunter22").unwrap().token;
        Harness {
            api: ControlApi::new(operators.clone(), records.clone(), auth),
            operators,
            records,
            token,
        }
    }

    fn request(method: Method, path: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn body_json(resp: ApiResponse) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_route() {
        assert_eq!(parse_route("/api/token"), Some(Route::Token));
        assert_eq!(parse_route("/api/users/"), Some(Route::Users));
        assert_eq!(parse_route("/api/records/abc"), Some(Route::Record("abc")));
        assert_eq!(parse_route("/api/records/abc/extra"), None);
        assert_eq!(parse_route("/api/unknown"), None);
        assert_eq!(parse_route("/health"), None);
    }

    #[tokio::test]
    async fn test_token_issuance() {
        let h = harness();

        let resp = h
            .api
            .handle(request(
                Method::POST,
                "/api/token",
                None,
                r#"{"identifier":"ops@example.com","secret":"hunter22"}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));
        assert!(body["expires_at"].as_i64().is_some());

        let resp = h
            .api
            .handle(request(
                Method::POST,
                "/api/token",
                None,
                r#"{"identifier":"ops@example.com","secret":"wrong"}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[X_GATEWAY_ERROR], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let h = harness();

        let resp = h.api.handle(request(Method::GET, "/api/records", None, "")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[X_GATEWAY_ERROR], "UNAUTHENTICATED");

        // Flip the first signature character
        let sig_start = h.token.rfind('.').unwrap() + 1;
        let mut corrupted = h.token.clone();
        let replacement = if &h.token[sig_start..sig_start + 1] == "A" { "B" } else { "A" };
        corrupted.replace_range(sig_start..sig_start + 1, replacement);
        let resp = h
            .api
            .handle(request(Method::GET, "/api/records", Some(&corrupted), ""))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = h
            .api
            .handle(request(Method::GET, "/api/records", Some(&h.token), ""))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_record_crud() {
        let h = harness();
        let token = Some(h.token.as_str());

        let resp = h
            .api
            .handle(request(
                Method::POST,
                "/api/records",
                token,
                r#"{"key":"API.example.com","target":"10.0.0.5:8080"}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["key"], "api.example.com");
        assert_eq!(created["mode"], "plain");
        assert_eq!(created["created_by"], "ops@example.com");
        let id = created["id"].as_str().unwrap().to_string();

        let resp = h
            .api
            .handle(request(Method::GET, "/api/records", token, ""))
            .await;
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0], created);

        let path = format!("/api/records/{}", id);
        let resp = h
            .api
            .handle(request(Method::PUT, &path, token, r#"{"enabled":false}"#))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["enabled"], false);

        let resp = h.api.handle(request(Method::DELETE, &path, token, "")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(h.records.list().unwrap().is_empty());

        let resp = h.api.handle(request(Method::GET, &path, token, "")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_record_conflict_and_validation() {
        let h = harness();
        let token = Some(h.token.as_str());
        let body = r#"{"key":"app.example.com","target":"127.0.0.1:3000"}"#;

        let first = h.api.handle(request(Method::POST, "/api/records", token, body)).await;
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = h.api.handle(request(Method::POST, "/api/records", token, body)).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let resp = h
            .api
            .handle(request(Method::POST, "/api/records", token, "{not json"))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()[X_GATEWAY_ERROR], "VALIDATION_ERROR");

        let resp = h
            .api
            .handle(request(
                Method::POST,
                "/api/records",
                token,
                r#"{"key":"bad host","target":"127.0.0.1:3000"}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_operator_crud_hides_hash() {
        let h = harness();
        let token = Some(h.token.as_str());

        let resp = h
            .api
            .handle(request(
                Method::POST,
                "/api/users",
                token,
                r#"{"identifier":"second@example.com","secret":"s3cret-value"}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert!(created.get("secret_hash").is_none());
        let id = created["id"].as_str().unwrap().to_string();

        let resp = h.api.handle(request(Method::GET, "/api/users", token, "")).await;
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);

        let path = format!("/api/users/{}", id);
        let resp = h
            .api
            .handle(request(Method::PUT, &path, token, r#"{"secret":"rotated-secret"}"#))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(h.operators.verify("second@example.com", "rotated-secret").is_ok());

        let resp = h.api.handle(request(Method::DELETE, &path, token, "")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(h.operators.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deleted_operator_loses_access() {
        let h = harness();
        let op = h.operators.find_by_identifier("ops@example.com").unwrap().unwrap();
        h.operators.create("other@example.com", "another-secret").unwrap();
        h.operators.delete(&op.id).unwrap();

        let resp = h
            .api
            .handle(request(Method::GET, "/api/users", Some(&h.token), ""))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_path_and_wrong_method() {
        let h = harness();

        let resp = h
            .api
            .handle(request(Method::GET, "/api/nothing", Some(&h.token), ""))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = h.api.handle(request(Method::GET, "/api/token", None, "")).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let resp = h
            .api
            .handle(request(Method::PATCH, "/api/records", Some(&h.token), ""))
            .await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()[X_GATEWAY_ERROR], "METHOD_NOT_ALLOWED");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_token_hashing_leaves_runtime_free() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let operators = OperatorStore::with_hash_iterations(Arc::clone(&db), 50_000);
        operators.create("slow@example.com", "hunter22").unwrap();
        let auth = AuthGate::new(
            AuthConfig {
                secret: "test-secret".to_string(),
                token_ttl_secs: 3600,
            },
            operators.clone(),
        );
        let api = ControlApi::new(operators, RecordStore::new(db), auth);

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::task::yield_now().await;
            }
        });

        let resp = api
            .handle(request(
                Method::POST,
                "/api/token",
                None,
                r#"{"identifier":"slow@example.com","secret":"hunter22"}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        // The only runtime thread kept polling other tasks during verification
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) > 0);
        ticker.abort();
    }
}
