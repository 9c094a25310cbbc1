//! HTTP transfer client
//!
//! Fetches files from peers with streaming verification, pushes files to
//! peers for storage, asks for storage quotes and submits payments.

use crate::api::{
    StoreFileRequest, TransactionStatus, HEADER_CHUNK_FRAMING, HEADER_MESSAGE, HEADER_PUBLIC_KEY,
    HEADER_SIGNATURE, ROUTE_QUOTE, ROUTE_REQUEST_FILE, ROUTE_SEND_TRANSACTION, ROUTE_STORE_FILE,
};
use crate::ledger::Wallet;
use crate::name_index::NameIndex;
use crate::server::db_error;
use orca_core::chunk::FrameDecoder;
use orca_core::keys::{public_key_from_hex, verify};
use orca_core::{ContentKey, Error, Result, StorageQuote};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

fn network_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

/// Keep only the final path component so a name cannot escape the target dir
fn safe_filename(name: &str) -> Result<String> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("unusable file name '{}'", name)))
}

/// Turn a non-2xx response into [`Error::Remote`] carrying the server's text
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(Error::Remote {
        status: status.as_u16(),
        message,
    })
}

fn header_str<'a>(resp: &'a reqwest::Response, name: &str) -> Result<&'a str> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Validation(format!("missing {} header", name)))
}

/// Signature material sent with a file
struct Provenance {
    digest: Vec<u8>,
    signature: Vec<u8>,
    public_key: ed25519_dalek::VerifyingKey,
}

impl Provenance {
    fn from_headers(resp: &reqwest::Response) -> Result<Self> {
        let digest = hex::decode(header_str(resp, HEADER_MESSAGE)?)
            .map_err(|e| Error::Validation(format!("bad {} header: {}", HEADER_MESSAGE, e)))?;
        let signature = hex::decode(header_str(resp, HEADER_SIGNATURE)?)
            .map_err(|e| Error::Validation(format!("bad {} header: {}", HEADER_SIGNATURE, e)))?;
        let public_key = public_key_from_hex(header_str(resp, HEADER_PUBLIC_KEY)?)?;
        Ok(Self {
            digest,
            signature,
            public_key,
        })
    }

    fn check(&self, received_digest: &[u8]) -> Result<()> {
        if !verify(&self.signature, &self.digest, &self.public_key) {
            return Err(Error::Validation("signature does not match".to_string()));
        }
        if received_digest != self.digest.as_slice() {
            return Err(Error::Validation(format!(
                "content hash {} does not match signed hash {}",
                hex::encode(received_digest),
                hex::encode(&self.digest)
            )));
        }
        Ok(())
    }
}

/// Client side of the transfer protocol
pub struct TransferClient {
    http: reqwest::Client,
    names: Mutex<NameIndex>,
    requested_dir: PathBuf,
}

impl TransferClient {
    pub fn new(requested_dir: &Path, names: NameIndex, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(network_error)?;
        Ok(Self {
            http,
            names: Mutex::new(names),
            requested_dir: requested_dir.to_path_buf(),
        })
    }

    pub fn names(&self) -> MutexGuard<'_, NameIndex> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch `name` from the peer at `addr` into `requested/<name>`
    ///
    /// `name` is sent as its content key when the local name index knows it.
    /// The body is hashed while it is written; the file is only moved into
    /// place once the signature and hash check out.
    pub async fn request_file(
        &self,
        addr: &str,
        name: &str,
        chunk_size: Option<usize>,
    ) -> Result<PathBuf> {
        let local_name = safe_filename(name)?;
        let target = match self.names().get(name).map_err(db_error)? {
            Some(entry) => entry.content_key.to_hex(),
            None => name.to_string(),
        };

        let mut url = format!("http://{}{}/{}", addr, ROUTE_REQUEST_FILE, target);
        if let Some(size) = chunk_size {
            url.push_str(&format!("?chunksize={}", size));
        }
        tracing::info!("Requesting '{}' from {}", name, addr);

        let resp = self.http.get(&url).send().await.map_err(network_error)?;
        let resp = check_status(resp).await?;

        tokio::fs::create_dir_all(&self.requested_dir).await?;
        let final_path = self.requested_dir.join(&local_name);
        let part_path = self.requested_dir.join(format!("{}.part", local_name));

        match self.receive(resp, &part_path).await {
            Ok(()) => {
                tokio::fs::rename(&part_path, &final_path).await?;
                tracing::info!("Saved {}", final_path.display());
                Ok(final_path)
            }
            Err(e) => {
                tracing::warn!("Discarding '{}': {}", name, e);
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(e)
            }
        }
    }

    async fn receive(&self, mut resp: reqwest::Response, part_path: &Path) -> Result<()> {
        let provenance = Provenance::from_headers(&resp)?;
        let mut decoder = resp
            .headers()
            .contains_key(HEADER_CHUNK_FRAMING)
            .then(FrameDecoder::new);

        let mut file = tokio::fs::File::create(part_path).await?;
        let mut hasher = Sha256::new();
        let mut received = 0usize;

        while let Some(chunk) = resp.chunk().await.map_err(network_error)? {
            let data = match decoder.as_mut() {
                Some(decoder) => decoder.push(&chunk)?,
                None => chunk.to_vec(),
            };
            hasher.update(&data);
            file.write_all(&data).await?;
            received += data.len();
        }
        if let Some(decoder) = decoder {
            decoder.finish()?;
        }
        file.flush().await?;
        drop(file);

        tracing::debug!("Received {} bytes", received);
        provenance.check(&hasher.finalize())
    }

    /// Ask the peer at `addr` to store the file at `path`
    ///
    /// Records the returned key under the file's name in the local index.
    pub async fn store_file(&self, addr: &str, path: &Path) -> Result<ContentKey> {
        let filename = safe_filename(&path.to_string_lossy())?;
        let content = tokio::fs::read(path).await?;
        let expected = ContentKey::of(&content);
        let size = content.len() as u64;

        let url = format!("http://{}{}/", addr, ROUTE_STORE_FILE);
        let request = StoreFileRequest {
            filename: filename.clone(),
            content,
        };
        tracing::info!("Asking {} to store '{}' ({} bytes)", addr, filename, size);

        let resp = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(network_error)?;
        let body = check_status(resp)
            .await?
            .text()
            .await
            .map_err(network_error)?;

        let key: ContentKey = body
            .trim()
            .parse()
            .map_err(|e| Error::Validation(format!("server returned bad key {:?}: {}", body, e)))?;
        if key != expected {
            return Err(Error::Validation(format!(
                "server stored under {} but content hashes to {}",
                key, expected
            )));
        }

        self.names().put(&filename, &key, size).map_err(db_error)?;
        Ok(key)
    }

    /// Sign and submit a payment to the peer at `addr`
    ///
    /// Rejections come back as the server's status string, not as an error.
    pub async fn send_transaction(
        &self,
        addr: &str,
        wallet: &Wallet,
        price: f64,
        receiver_id: &str,
    ) -> Result<TransactionStatus> {
        let (transaction, submission) = wallet.pay(price, receiver_id)?;
        tracing::info!("Sending transaction {} ({}) to {}", transaction.uuid, price, addr);

        let url = format!("http://{}{}", addr, ROUTE_SEND_TRANSACTION);
        let resp = self
            .http
            .post(&url)
            .json(&submission)
            .send()
            .await
            .map_err(network_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(network_error)?;
        match serde_json::from_str::<TransactionStatus>(&body) {
            Ok(reply) => {
                if !status.is_success() {
                    tracing::warn!("Transaction {} rejected: {}", transaction.uuid, reply.status);
                }
                Ok(reply)
            }
            Err(_) => Err(Error::Remote {
                status: status.as_u16(),
                message: body,
            }),
        }
    }

    /// Ask the peer at `addr` what storing `key` costs
    pub async fn fetch_quote(&self, addr: &str, key: &ContentKey) -> Result<StorageQuote> {
        let url = format!("http://{}{}/{}", addr, ROUTE_QUOTE, key);
        let resp = self.http.get(&url).send().await.map_err(network_error)?;
        check_status(resp)
            .await?
            .json::<StorageQuote>()
            .await
            .map_err(|e| Error::Protocol(format!("bad quote from {}: {}", addr, e)))
    }
}
