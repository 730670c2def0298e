//! Part exchange between replicas.
//!
//! The payload is a framed multi-file stream:
//! `u32 file_count, then per file { u32 name_len, name, u64 size, bytes,
//! u32 crc32 }`, all little-endian. HTTP is the binding: GET
//! `/?endpoint=DataPartsExchange&part=<name>&compress=<bool>` with Basic
//! auth against the interserver credential set; `compress=true` wraps the
//! body in gzip. 401 on bad credentials, 503 above the send limit, 500 with
//! a text message otherwise; "aborted" errors are demoted on the client.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::watch;

use crate::action_lock::{ActionKind, ActionLocks};
use crate::error::{EngineError, Result};
use crate::part::PartInfo;
use crate::settings::TableSettings;
use crate::storage::{LocalStore, Part};

pub const ENDPOINT: &str = "DataPartsExchange";
/// 500-body prefix marking an abort the client should not treat as an error.
const ABORTED_MARKER: &str = "ABORTED:";

/// Valid (user, password) pairs for inbound transfers, plus the back-compat
/// empty-credential mode.
#[derive(Clone, Debug, Default)]
pub struct InterserverCredentials {
    pairs: Vec<(String, String)>,
    allow_empty: bool,
}

impl InterserverCredentials {
    pub fn from_settings(settings: &TableSettings) -> Self {
        Self {
            pairs: settings.interserver_credentials.clone(),
            allow_empty: settings.allow_empty_interserver_credentials,
        }
    }

    pub fn is_valid(&self, user: &str, password: &str) -> bool {
        if user.is_empty() && password.is_empty() {
            return self.allow_empty || self.pairs.iter().any(|(u, p)| u.is_empty() && p.is_empty());
        }
        self.pairs
            .iter()
            .any(|(u, p)| u == user && p == password)
    }

    /// Credentials this replica presents to peers.
    pub fn outbound(&self) -> Option<(String, String)> {
        self.pairs.first().cloned()
    }
}

/// Encode a part into the framed stream.
pub fn encode_part(part: &Part) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(part.files.len() as u32).to_le_bytes());
    for (name, bytes) in &part.files {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(bytes);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytes);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
    }
    out
}

fn take<'a>(data: &'a [u8], cursor: &mut usize, len: usize, part_name: &str) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| EngineError::FetchFailed {
            replica: String::new(),
            message: format!("truncated part stream for {part_name}"),
        })?;
    let slice = &data[*cursor..end];
    *cursor = end;
    Ok(slice)
}

/// Decode and verify a framed stream back into a part.
pub fn decode_part(info: PartInfo, data: &[u8]) -> Result<Part> {
    let mut cursor = 0usize;
    let part_name = info.name();

    let count = u32::from_le_bytes(take(data, &mut cursor, 4, &part_name)?.try_into().unwrap());
    let mut files = std::collections::BTreeMap::new();
    for _ in 0..count {
        let name_len =
            u32::from_le_bytes(take(data, &mut cursor, 4, &part_name)?.try_into().unwrap())
                as usize;
        let name = String::from_utf8(take(data, &mut cursor, name_len, &part_name)?.to_vec())
            .map_err(|_| EngineError::FetchFailed {
                replica: String::new(),
                message: "non-utf8 file name in part stream".into(),
            })?;
        let size =
            u64::from_le_bytes(take(data, &mut cursor, 8, &part_name)?.try_into().unwrap())
                as usize;
        let bytes = take(data, &mut cursor, size, &part_name)?.to_vec();
        let expected =
            u32::from_le_bytes(take(data, &mut cursor, 4, &part_name)?.try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        if hasher.finalize() != expected {
            return Err(EngineError::ChecksumMismatch(format!("{part_name}/{name}")));
        }
        files.insert(name, bytes);
    }
    let columns = columns_from_files(&files);
    Ok(Part::build(info, columns, files))
}

fn columns_from_files(files: &std::collections::BTreeMap<String, Vec<u8>>) -> Vec<String> {
    files
        .get("columns.txt")
        .map(|bytes| {
            String::from_utf8_lossy(bytes)
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip to memory");
    encoder.finish().expect("gzip finish")
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| EngineError::FetchFailed {
            replica: String::new(),
            message: format!("bad compressed part stream: {err}"),
        })?;
    Ok(out)
}

struct ServerState {
    store: Arc<dyn LocalStore>,
    credentials: InterserverCredentials,
    sends: tokio::sync::Semaphore,
    locks: Option<Arc<ActionLocks>>,
}

/// Part-exchange HTTP server for one table.
pub struct ExchangeServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ExchangeServer {
    /// Bind and serve. `addr` may carry port 0 for an ephemeral port.
    pub async fn start(
        addr: SocketAddr,
        store: Arc<dyn LocalStore>,
        settings: &TableSettings,
        locks: Option<Arc<ActionLocks>>,
    ) -> Result<Self> {
        let state = Arc::new(ServerState {
            store,
            credentials: InterserverCredentials::from_settings(settings),
            sends: tokio::sync::Semaphore::new(settings.max_parallel_sends_per_table.max(1)),
            locks,
        });
        let router = Router::new()
            .route("/", get(handle_fetch))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| EngineError::FetchFailed {
                replica: String::new(),
                message: format!("bind {addr}: {err}"),
            })?;
        let local_addr = listener.local_addr().map_err(|err| EngineError::FetchFailed {
            replica: String::new(),
            message: format!("local_addr: {err}"),
        })?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            });
            if let Err(err) = serve.await {
                tracing::warn!(error = %err, "part exchange server exited with error");
            }
        });

        tracing::info!(addr = %local_addr, "part exchange server listening");
        Ok(Self {
            addr: local_addr,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

fn check_auth(credentials: &InterserverCredentials, headers: &HeaderMap) -> bool {
    let Some(raw) = headers.get(axum::http::header::AUTHORIZATION) else {
        return credentials.is_valid("", "");
    };
    let Ok(value) = raw.to_str() else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    let (user, password) = text.split_once(':').unwrap_or((text.as_str(), ""));
    credentials.is_valid(user, password)
}

async fn handle_fetch(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !check_auth(&state.credentials, &headers) {
        tracing::warn!("part exchange request rejected: authentication failed");
        return (StatusCode::UNAUTHORIZED, "authentication failed".to_string()).into_response();
    }

    if params.get("endpoint").map(String::as_str) != Some(ENDPOINT) {
        return (StatusCode::BAD_REQUEST, "unknown endpoint".to_string()).into_response();
    }
    let Some(part_name) = params.get("part") else {
        return (StatusCode::BAD_REQUEST, "missing part parameter".to_string()).into_response();
    };
    let compress = params.get("compress").map(String::as_str) == Some("true");

    if state
        .locks
        .as_ref()
        .map(|locks| locks.is_blocked(ActionKind::Sends))
        .unwrap_or(false)
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "part sends are paused".to_string(),
        )
            .into_response();
    }
    let Ok(_permit) = state.sends.try_acquire() else {
        tracing::debug!(part = %part_name, "part exchange refusing: too many transfers");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "too many concurrent transfers".to_string(),
        )
            .into_response();
    };

    match state.store.get_part(part_name) {
        Ok(part) => {
            let mut body = encode_part(&part);
            if compress {
                body = gzip(&body);
            }
            tracing::debug!(part = %part_name, bytes = body.len(), compress, "sending part");
            (StatusCode::OK, body).into_response()
        }
        Err(err) => {
            let message = if err.is_aborted() {
                format!("{ABORTED_MARKER} {err}")
            } else {
                err.to_string()
            };
            if err.is_aborted() {
                tracing::info!(part = %part_name, "part send aborted");
            } else {
                tracing::error!(part = %part_name, error = %err, "part send failed");
            }
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
    }
}

/// Part-exchange client.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl Fetcher {
    pub fn new(settings: &TableSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials: InterserverCredentials::from_settings(settings).outbound(),
        }
    }

    /// Download `part_name` from the peer at `host` ("ip:port").
    pub async fn fetch_part(&self, host: &str, part_name: &str, compress: bool) -> Result<Part> {
        let info = PartInfo::parse(part_name)?;
        let url = format!(
            "http://{host}/?endpoint={ENDPOINT}&part={part_name}&compress={compress}"
        );
        let mut request = self.client.get(&url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        let response = request.send().await.map_err(|err| EngineError::FetchFailed {
            replica: host.to_string(),
            message: err.to_string(),
        })?;

        match response.status() {
            reqwest::StatusCode::OK => {}
            reqwest::StatusCode::UNAUTHORIZED => return Err(EngineError::AuthFailed),
            reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                return Err(EngineError::TooManyConcurrentOperations(format!(
                    "peer {host} is sending too many parts"
                )))
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                if let Some(rest) = message.strip_prefix(ABORTED_MARKER) {
                    return Err(EngineError::Aborted(rest.trim().to_string()));
                }
                return Err(EngineError::FetchFailed {
                    replica: host.to_string(),
                    message: format!("{status}: {message}"),
                });
            }
        }

        let body: bytes::Bytes = response
            .bytes()
            .await
            .map_err(|err| EngineError::FetchFailed {
                replica: host.to_string(),
                message: err.to_string(),
            })?;
        let body = if compress {
            gunzip(&body)?
        } else {
            body.to_vec()
        };
        let part = decode_part(info, &body)?;
        part.verify()?;
        Ok(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn sample_part() -> Part {
        Part::from_rows(
            PartInfo::parse("2024_0_0_0").unwrap(),
            vec!["user".into(), "visits".into()],
            &["u1,5".into(), "u2,7".into()],
        )
    }

    #[test]
    fn framing_round_trip() {
        let part = sample_part();
        let encoded = encode_part(&part);
        let decoded = decode_part(part.info.clone(), &encoded).unwrap();
        assert_eq!(decoded, part);
    }

    #[test]
    fn framing_detects_corruption() {
        let part = sample_part();
        let mut encoded = encode_part(&part);
        let len = encoded.len();
        encoded[len - 10] ^= 0xff;
        let err = decode_part(part.info.clone(), &encoded).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ChecksumMismatch(_) | EngineError::FetchFailed { .. }
        ));
    }

    #[test]
    fn credentials_accept_configured_pairs_and_empty_mode() {
        let creds = InterserverCredentials {
            pairs: vec![("repl".into(), "secret".into())],
            allow_empty: false,
        };
        assert!(creds.is_valid("repl", "secret"));
        assert!(!creds.is_valid("repl", "wrong"));
        assert!(!creds.is_valid("", ""));

        let open = InterserverCredentials {
            pairs: vec![],
            allow_empty: true,
        };
        assert!(open.is_valid("", ""));
        assert!(!open.is_valid("anyone", "pw"));
    }

    #[tokio::test]
    async fn http_fetch_round_trip_with_auth_and_compression() {
        let store = Arc::new(MemoryStore::new());
        store.commit_part(sample_part()).unwrap();

        let settings = TableSettings {
            interserver_credentials: vec![("repl".into(), "secret".into())],
            allow_empty_interserver_credentials: false,
            ..TableSettings::default()
        };
        let server = ExchangeServer::start(
            "127.0.0.1:0".parse().unwrap(),
            store.clone(),
            &settings,
            None,
        )
        .await
        .unwrap();
        let host = server.addr().to_string();

        let fetcher = Fetcher::new(&settings);
        for compress in [false, true] {
            let part = fetcher
                .fetch_part(&host, "2024_0_0_0", compress)
                .await
                .unwrap();
            assert_eq!(part, sample_part());
        }

        // Wrong credentials fail with AuthFailed.
        let wrong = Fetcher {
            client: reqwest::Client::new(),
            credentials: Some(("repl".into(), "wrong".into())),
        };
        let err = wrong.fetch_part(&host, "2024_0_0_0", false).await.unwrap_err();
        assert!(matches!(err, EngineError::AuthFailed));

        // Unknown parts surface as fetch failures with the message.
        let err = fetcher.fetch_part(&host, "2024_9_9_0", false).await.unwrap_err();
        assert!(matches!(err, EngineError::FetchFailed { .. }));

        server.stop().await;
    }
}
