//! Local HTTP server handing HLS manifests and segments to the player.
//!
//! Only files sitting directly inside the shared output directory are served.
//! The port is picked by scanning upwards from the configured start port and
//! is published once through [`ServerPort`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{self, HeaderValue};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerSection;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no free port between {start} and {end}")]
    PortsExhausted { start: u16, end: u16 },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),
}

/// Write-once cell holding the port the segment server bound.
#[derive(Debug, Clone, Default)]
pub struct ServerPort(Arc<OnceLock<u16>>);

impl ServerPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<u16> {
        self.0.get().copied()
    }

    /// Returns false if a port was already published.
    pub fn publish(&self, port: u16) -> bool {
        self.0.set(port).is_ok()
    }
}

#[derive(Debug)]
pub struct SegmentServer {
    listener: TcpListener,
    port: u16,
    root: PathBuf,
}

impl SegmentServer {
    pub async fn bind(config: &ServerSection, root: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let ip: IpAddr = config
            .bind_addr
            .parse()
            .map_err(|_| ServerError::InvalidAddress(config.bind_addr.clone()))?;
        let start = config.start_port;
        let mut last = start;
        for attempt in 0..config.max_attempts.max(1) {
            let Some(port) = start.checked_add(attempt) else {
                break;
            };
            last = port;
            let addr = SocketAddr::new(ip, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let port = listener
                        .local_addr()
                        .map(|local| local.port())
                        .unwrap_or(port);
                    return Ok(Self {
                        listener,
                        port,
                        root: root.into(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    info!(port, "port in use, trying next");
                }
                Err(source) => return Err(ServerError::Bind { addr, source }),
            }
        }
        Err(ServerError::PortsExhausted { start, end: last })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let app = router(self.root.clone());
        let port = self.port;
        tokio::spawn(async move {
            if let Err(err) = axum::serve(self.listener, app).await {
                error!(port, error = %err, "segment server stopped");
            }
        })
    }
}

pub fn router(root: PathBuf) -> Router {
    Router::new()
        .fallback(serve_file)
        .with_state(Arc::new(root))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, HEAD"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("*"),
        ))
}

/// Binds, publishes the port and serves in the background.
///
/// Failure leaves the server down and is only logged; transcode requests then
/// fail with a server-unavailable error.
pub async fn start_segment_server(
    config: &ServerSection,
    root: PathBuf,
    port: &ServerPort,
) -> Option<JoinHandle<()>> {
    if let Err(err) = tokio::fs::create_dir_all(&root).await {
        warn!(path = %root.display(), error = %err, "failed to create segment directory");
    }
    match SegmentServer::bind(config, root).await {
        Ok(server) => {
            if !port.publish(server.port()) {
                warn!(port = ?port.get(), "segment server port already published");
                return None;
            }
            info!(port = server.port(), root = %server.root().display(), "segment server listening");
            Some(server.spawn())
        }
        Err(err) => {
            error!(error = %err, "segment server unavailable");
            None
        }
    }
}

async fn serve_file(State(root): State<Arc<PathBuf>>, method: Method, uri: Uri) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(name) = plain_file_name(uri.path()) else {
        return not_found();
    };
    let path = root.join(name);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "segment not found");
            return not_found();
        }
    };
    let metadata = match file.metadata().await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return not_found(),
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, metadata.len());
    if let Some(content_type) = content_type_for(name) {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(file))
    };
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "File not found").into_response()
}

/// Accepts exactly one normal path component.
fn plain_file_name(path: &str) -> Option<&str> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() || name.contains(['/', '\\']) {
        return None;
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(name),
        _ => None,
    }
}

fn content_type_for(name: &str) -> Option<&'static str> {
    match Path::new(name).extension().and_then(|ext| ext.to_str()) {
        Some("m3u8") => Some("application/vnd.apple.mpegurl"),
        Some("ts") => Some("video/MP2T"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_single_names_are_served() {
        assert_eq!(plain_file_name("/X.m3u8"), Some("X.m3u8"));
        assert_eq!(plain_file_name("/X_001.ts"), Some("X_001.ts"));
        assert_eq!(plain_file_name("/"), None);
        assert_eq!(plain_file_name("/../etc/passwd"), None);
        assert_eq!(plain_file_name("/.."), None);
        assert_eq!(plain_file_name("/sub/X.ts"), None);
        assert_eq!(plain_file_name("/..\\secret"), None);
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(
            content_type_for("X.m3u8"),
            Some("application/vnd.apple.mpegurl")
        );
        assert_eq!(content_type_for("X_000.ts"), Some("video/MP2T"));
        assert_eq!(content_type_for("notes.txt"), None);
    }

    #[test]
    fn port_is_published_once() {
        let port = ServerPort::new();
        assert_eq!(port.get(), None);
        assert!(port.publish(8081));
        assert!(!port.publish(8082));
        assert_eq!(port.clone().get(), Some(8081));
    }
}
