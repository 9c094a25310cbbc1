//! HTTP transfer server
//!
//! Serves files to peers, accepts files for storage, quotes storage prices and
//! takes payment transactions. Every send and store waits for the operator's
//! answer through the [`ConfirmationGate`].

use crate::api::{
    StoreFileRequest, TransactionStatus, HEADER_CHUNK_FRAMING, HEADER_MESSAGE, HEADER_PUBLIC_KEY,
    HEADER_SIGNATURE, ROUTE_QUOTE, ROUTE_REQUEST_FILE, ROUTE_SEND_TRANSACTION, ROUTE_STORE_FILE,
};
use crate::config::Config;
use crate::confirm::{ConfirmationGate, Decision, TransferKind};
use crate::content_store::ContentStore;
use crate::ledger::{Ledger, SignedSubmission, Wallet};
use crate::name_index::NameIndex;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use orca_core::chunk::{chunk_ranges, content_type_for, encode_frame, FRAME_DELIMITER};
use orca_core::{sha256, ContentKey, Error, Result, StorageQuote};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything the handlers share
pub struct ServerState {
    pub store: Arc<ContentStore>,
    names: Mutex<NameIndex>,
    pub gate: Arc<ConfirmationGate>,
    pub ledger: Arc<Ledger>,
    /// Signs the digests of served files
    pub wallet: Wallet,
    pub chunk_threshold: usize,
    pub price_per_byte: f64,
    /// Address put in storage quotes
    public_addr: RwLock<String>,
    /// Told about every key accepted through `/storeFile`
    pub on_stored: Option<mpsc::UnboundedSender<ContentKey>>,
}

impl ServerState {
    pub fn new(
        store: Arc<ContentStore>,
        names: NameIndex,
        gate: Arc<ConfirmationGate>,
        ledger: Arc<Ledger>,
        wallet: Wallet,
    ) -> Self {
        Self {
            store,
            names: Mutex::new(names),
            gate,
            ledger,
            wallet,
            chunk_threshold: orca_core::CHUNK_THRESHOLD,
            price_per_byte: 0.0,
            public_addr: RwLock::new(String::new()),
            on_stored: None,
        }
    }

    /// Open the store, name index, ledger and wallet under the data directory
    pub fn open(config: &Config, gate: Arc<ConfirmationGate>) -> Result<Self> {
        let store = Arc::new(ContentStore::open(&config.store_dir(), config.store_limits())?);
        let names = NameIndex::open(&config.names_db()).map_err(db_error)?;
        let ledger = Arc::new(Ledger::open(&config.transactions_dir())?);
        let wallet = Wallet::load_or_generate(&config.wallet_key_path())?;

        let mut state = Self::new(store, names, gate, ledger, wallet);
        state.chunk_threshold = config.transfer.chunk_threshold.max(1);
        state.price_per_byte = config.transfer.price_per_byte;
        state.set_public_addr(&config.transfer.http_addr);
        Ok(state)
    }

    pub fn names(&self) -> MutexGuard<'_, NameIndex> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn public_addr(&self) -> String {
        self.public_addr
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_public_addr(&self, addr: &str) {
        *self.public_addr.write().unwrap_or_else(|e| e.into_inner()) = addr.to_string();
    }

    /// Map a request name to a stored key and the filename to present
    ///
    /// `name` is either a hex key held by the store or a filename recorded in
    /// the name index.
    fn resolve(&self, name: &str) -> Result<(ContentKey, String)> {
        if let Ok(key) = name.parse::<ContentKey>() {
            if self.store.contains(&key) {
                let filename = self.names().name_for(&key).map_err(db_error)?;
                return Ok((key, filename.unwrap_or_else(|| name.to_string())));
            }
        }

        match self.names().get(name).map_err(db_error)? {
            Some(entry) if self.store.contains(&entry.content_key) => {
                Ok((entry.content_key, entry.filename))
            }
            _ => Err(Error::NotFound(format!("File '{}' not found", name))),
        }
    }
}

pub(crate) fn db_error(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

/// Run blocking store or ledger work off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Protocol(format!("blocking task failed: {}", e)))?
}

fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

fn error_status(e: &Error) -> StatusCode {
    StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Plain-text error whose body is the message a peer should see
fn error_response(e: Error) -> Response {
    let status = error_status(&e);
    match e {
        Error::NotFound(message) | Error::Declined(message) => response_error(status, message),
        other => response_error(status, other.to_string()),
    }
}

/// Hold the request until the operator answers
async fn confirm(state: &ServerState, kind: TransferKind, filename: &str) -> Result<()> {
    match state.gate.ask(kind, filename).await {
        Decision::Accepted => Ok(()),
        Decision::Declined => Err(Error::Declined(format!(
            "Client declined to {} file '{}'.",
            kind, filename
        ))),
    }
}

/// `attachment; filename="..."` with quotes and backslashes escaped
fn content_disposition(filename: &str) -> String {
    let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
    format!("attachment; filename=\"{}\"", escaped)
}

/// Build the transfer router
pub fn router(state: Arc<ServerState>) -> Router {
    let body_limit = store_body_limit(state.store.drive_capacity());
    Router::new()
        .route(&format!("{}/:name", ROUTE_REQUEST_FILE), get(request_file))
        .route(ROUTE_STORE_FILE, post(store_file))
        .route(&format!("{}/", ROUTE_STORE_FILE), post(store_file))
        .route(&format!("{}/:key", ROUTE_QUOTE), get(quote))
        .route(ROUTE_SEND_TRANSACTION, post(send_transaction))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Slack for the JSON envelope and filename around the base64 content
const STORE_BODY_SLACK: usize = 64 * 1024;

/// Largest `/storeFile` body that can carry a blob the drive tier accepts
fn store_body_limit(drive_cap: usize) -> usize {
    drive_cap
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(STORE_BODY_SLACK)
}

/// Bind `addr` and serve in a background task
///
/// Returns the bound address, which differs from `addr` when it names port 0.
pub async fn spawn(addr: &str, state: Arc<ServerState>) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Startup(format!("bind {}: {}", addr, e)))?;
    let local = listener.local_addr()?;

    if local.ip().is_unspecified() {
        state.set_public_addr(&format!("127.0.0.1:{}", local.port()));
    } else {
        state.set_public_addr(&local.to_string());
    }
    tracing::info!("Transfer server listening on {}", local);

    let app = router(state);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Transfer server stopped: {}", e);
        }
    });
    Ok((local, task))
}

#[derive(Debug, Deserialize)]
struct RequestFileQuery {
    chunksize: Option<String>,
}

async fn request_file(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(query): Query<RequestFileQuery>,
) -> Response {
    let chunk_size = match query.chunksize.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                return response_error(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid chunksize '{}'", raw),
                )
            }
        },
    };

    let (key, filename) = match state.resolve(&name) {
        Ok(found) => found,
        Err(e) => return error_response(e),
    };

    tracing::info!("Peer requests '{}' ({})", name, key);
    if let Err(e) = confirm(&state, TransferKind::Send, &name).await {
        return error_response(e);
    }

    let store = state.store.clone();
    let bytes = match blocking(move || store.get(&key)).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(e),
    };

    let digest = sha256(&bytes);
    let signature = state.wallet.sign(&digest);

    let mut response = Response::new(file_body(bytes, chunk_size, state.chunk_threshold));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&filename)),
    );
    match HeaderValue::from_str(&content_disposition(&filename)) {
        Ok(value) => {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        Err(e) => tracing::warn!("Cannot send filename {:?} as a header: {}", filename, e),
    }
    if let Ok(value) = HeaderValue::from_str(&hex::encode(digest)) {
        headers.insert(HEADER_MESSAGE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&hex::encode(signature)) {
        headers.insert(HEADER_SIGNATURE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.wallet.keypair().public_key_hex()) {
        headers.insert(HEADER_PUBLIC_KEY, value);
    }
    if chunk_size.is_some() {
        if let Ok(value) = HeaderValue::from_bytes(FRAME_DELIMITER) {
            headers.insert(HEADER_CHUNK_FRAMING, value);
        }
    }

    response
}

/// Body for a served file: framed chunks on request, plain chunks above the
/// threshold, one piece otherwise
fn file_body(bytes: Vec<u8>, chunk_size: Option<usize>, threshold: usize) -> Body {
    let bytes = Bytes::from(bytes);

    let pieces: Vec<Bytes> = match chunk_size {
        Some(size) => chunk_ranges(bytes.len(), size)
            .map(|range| Bytes::from(encode_frame(&bytes[range])))
            .collect(),
        None if bytes.len() > threshold => chunk_ranges(bytes.len(), threshold)
            .map(|range| bytes.slice(range))
            .collect(),
        None => return Body::from(bytes),
    };

    Body::from_stream(futures::stream::iter(
        pieces.into_iter().map(Ok::<_, std::io::Error>),
    ))
}

async fn store_file(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let request: StoreFileRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Bad store request: {}", e);
            return response_error(StatusCode::BAD_REQUEST, "Failed to parse JSON data");
        }
    };

    tracing::info!(
        "Peer asks to store '{}' ({} bytes)",
        request.filename,
        request.content.len()
    );
    if let Err(e) = confirm(&state, TransferKind::Store, &request.filename).await {
        return error_response(e);
    }

    let size = request.content.len() as u64;
    let store = state.store.clone();
    let content = request.content;
    let key = match blocking(move || store.put(&content)).await {
        Ok(key) => key,
        Err(e @ Error::TooLarge { .. }) => {
            return response_error(StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
        }
        Err(e) => {
            tracing::error!("Failed to store '{}': {}", request.filename, e);
            return response_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create file");
        }
    };

    if let Err(e) = state.names().put(&request.filename, &key, size) {
        tracing::error!("Failed to record name '{}': {}", request.filename, e);
        return response_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create file");
    }

    tracing::info!("Stored '{}' as {}", request.filename, key);
    if let Some(tx) = &state.on_stored {
        let _ = tx.send(key);
    }
    (StatusCode::OK, key.to_hex()).into_response()
}

async fn quote(State(state): State<Arc<ServerState>>, Path(raw_key): Path<String>) -> Response {
    let Ok(key) = raw_key.parse::<ContentKey>() else {
        return response_error(StatusCode::BAD_REQUEST, format!("Invalid key '{}'", raw_key));
    };
    let Some(size) = state.store.size_of(&key) else {
        return response_error(StatusCode::NOT_FOUND, format!("File '{}' not found", raw_key));
    };

    let quote = StorageQuote {
        address: state.public_addr(),
        price: state.price_per_byte * size as f64,
        size: size as u64,
        is_last_candidate: false,
    };
    (StatusCode::OK, Json(quote)).into_response()
}

fn transaction_status(status: StatusCode, value: &str) -> Response {
    (
        status,
        Json(TransactionStatus {
            status: value.to_string(),
        }),
    )
        .into_response()
}

async fn send_transaction(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let ledger = state.ledger.clone();
    let parsed = serde_json::from_slice::<SignedSubmission>(&body);
    let outcome = match parsed {
        Ok(submission) => blocking(move || ledger.submit(&submission)).await,
        Err(e) => {
            tracing::warn!("Unparsable transaction submission: {}", e);
            blocking(move || ledger.record_unparsable(&body)).await
        }
    };

    match outcome {
        Ok(receipt) => {
            let status = if receipt.outcome == crate::ledger::Outcome::Accepted {
                StatusCode::OK
            } else {
                StatusCode::BAD_REQUEST
            };
            transaction_status(status, receipt.outcome.as_str())
        }
        Err(e) => {
            tracing::error!("Failed to write audit record: {}", e);
            transaction_status(StatusCode::INTERNAL_SERVER_ERROR, "audit_failed")
        }
    }
}
