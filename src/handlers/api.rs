use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
};
use base64::{Engine as _, engine::general_purpose};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::decrypt::{AesCtrDecryptor, DecryptJob};
use crate::facade::DownloadSource;
use crate::notify::Notifier;
use crate::record::DownloadRecord;
use crate::state::AppState;

const DECRYPT_SUFFIX: &str = "decrypting";

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() })))
}

#[derive(Debug, Deserialize)]
pub struct AddDownload {
    pub uri: Option<String>,
    /// Base64 of the .torrent file.
    pub torrent: Option<String>,
    pub decrypt: Option<DecryptRequest>,
    pub options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DecryptRequest {
    /// Base64 of `key || nonce`.
    pub key: String,
    pub file_name: String,
}

pub async fn server_info(State(state): State<AppState>) -> Json<Value> {
    let ips = local_ip_address::list_afinet_netifas()
        .map(|list| {
            list.into_iter()
                .filter(|(_, ip)| ip.is_ipv4() && !ip.is_loopback())
                .map(|(_, ip)| ip.to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Json(json!({
        "ips": ips,
        "port": state.settings.server_port,
        "downloads": state.registry.count().await,
    }))
}

pub async fn list_downloads(State(state): State<AppState>) -> Json<Vec<DownloadRecord>> {
    let mut records = state.registry.lock().await.records();
    records.sort_by(|a, b| a.gid.cmp(&b.gid));
    Json(records)
}

pub async fn get_download(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<Json<DownloadRecord>, ApiError> {
    state
        .registry
        .lock()
        .await
        .query(&gid)
        .cloned()
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("no tracked download '{gid}'") })),
            )
        })
}

pub async fn add_download(
    State(state): State<AppState>,
    Json(request): Json<AddDownload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let source = match (request.uri, request.torrent) {
        (Some(uri), None) => DownloadSource::Uri(uri),
        (None, Some(torrent)) => DownloadSource::Torrent(
            general_purpose::STANDARD
                .decode(torrent)
                .map_err(|e| bad_request(format!("torrent is not valid base64: {e}")))?,
        ),
        _ => return Err(bad_request("exactly one of 'uri' or 'torrent' is required")),
    };
    let decrypt = request
        .decrypt
        .map(|d| decrypt_job(&state, d))
        .transpose()?;

    let label = match &source {
        DownloadSource::Uri(uri) => uri.clone(),
        DownloadSource::Torrent(bytes) => format!("torrent ({} bytes)", bytes.len()),
    };
    let message = state
        .notifier
        .send(&format!("Mirror requested: `{label}`"), None)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() }))))?;

    match state
        .orchestrator
        .add_download(source, message, decrypt, request.options)
        .await
    {
        Ok(gid) => {
            info!("Mirror requested: {label} [gid: '{gid}']");
            Ok((StatusCode::CREATED, Json(json!({ "gid": gid }))))
        }
        Err(text) => {
            warn!("Mirror request rejected: {label}");
            Err(bad_request(text))
        }
    }
}

fn decrypt_job(state: &AppState, request: DecryptRequest) -> Result<DecryptJob, ApiError> {
    let material = general_purpose::STANDARD
        .decode(&request.key)
        .map_err(|e| bad_request(format!("key is not valid base64: {e}")))?;
    let cipher =
        AesCtrDecryptor::from_key_material(&material).map_err(|e| bad_request(e.to_string()))?;
    let file_name = std::path::Path::new(&request.file_name)
        .file_name()
        .ok_or_else(|| bad_request("file_name must name a file"))?;

    let mut destination = state.settings.download_path.join(file_name);
    destination.as_mut_os_string().push(format!(".{DECRYPT_SUFFIX}"));
    Ok(DecryptJob {
        destination,
        cipher: Box::new(cipher),
    })
}

pub async fn pause_download(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .pause_download(&gid)
        .await
        .map(|gid| Json(json!({ "gid": gid })))
        .map_err(|e| bad_request(e.user_message()))
}

pub async fn remove_download(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .remove_download(&gid)
        .await
        .map(|gid| Json(json!({ "gid": gid })))
        .map_err(|e| bad_request(e.user_message()))
}

pub async fn cancel_mirror(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Json<Value> {
    let message = state.orchestrator.cancel_mirror(&gid).await;
    Json(json!({ "message": message }))
}

pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.notifier.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        Ok(msg) => Ok(Event::default().data(msg)),
        Err(_) => Ok(Event::default().comment("keepalive")),
    });

    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}
