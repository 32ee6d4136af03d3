//! The editor RPC port. Editor plug-ins drive the server through four
//! operations: `get_client`, `start_render`, `stop_client` and `ping`.
//! Frames are a 4-byte big-endian length followed by a JSON document; the
//! same framing serves the in-process server and the small blocking
//! client the CLI subcommands use.

use std::io::{Read, Write};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::constants::{LOCALHOST, RPC_PORT};
use crate::errors::*;
use crate::manager::{ClientId, Created, RenderManager};
use crate::utils::Hosting;

/// Frames larger than this are a protocol violation.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Everything an editor can ask of the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    GetClient {
        location: i32,
    },
    StartRender {
        text: String,
        path: String,
        id: ClientId,
        is_dirty: bool,
    },
    StopClient {
        id: ClientId,
    },
    Ping,
}

/// The result of `get_client`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderClientReturn {
    pub html: String,
    pub id: ClientId,
    pub error: String,
}

/// Where `get_client` should surface the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLocation {
    Url = 0,
    Html = 1,
    Browser = 2,
}

impl ClientLocation {
    fn from_wire(value: i32) -> Option<ClientLocation> {
        match value {
            0 => Some(ClientLocation::Url),
            1 => Some(ClientLocation::Html),
            2 => Some(ClientLocation::Browser),
            _ => None,
        }
    }
}

fn unknown_client(id: ClientId) -> String {
    format!("Unknown client id {}.", id)
}

const SHUTTING_DOWN: &str = "The server is shutting down.";

/// The RPC operations, bound to a manager and the hosting environment.
/// One instance is constructed at startup and shared by every
/// connection.
#[derive(Clone)]
pub struct EditorRpc {
    manager: RenderManager,
    hosting: Hosting,
}

impl EditorRpc {
    pub fn new(manager: RenderManager, hosting: Hosting) -> EditorRpc {
        EditorRpc { manager, hosting }
    }

    /// Allocate a viewer and tell the editor how to show it.
    pub fn get_client(&self, location: i32) -> RenderClientReturn {
        let Some(location) = ClientLocation::from_wire(location) else {
            return RenderClientReturn {
                html: String::new(),
                id: -1,
                error: format!("Invalid location {}", location),
            };
        };
        let id = match self.manager.create_client(None) {
            Created::Id(id) => id,
            Created::ShuttingDown => {
                return RenderClientReturn {
                    html: String::new(),
                    id: -1,
                    error: SHUTTING_DOWN.to_string(),
                }
            }
            Created::Duplicate => unreachable!("server-allocated ids cannot collide"),
        };
        let url = self.hosting.viewer_url(id);
        let (html, error) = match location {
            ClientLocation::Url => (url, String::new()),
            ClientLocation::Html => (
                format!(
                    "<!DOCTYPE html>\n<html>\n<head>\n    <meta http-equiv=\"refresh\" \
                     content=\"0; url={}\">\n</head>\n<body></body>\n</html>\n",
                    url
                ),
                String::new(),
            ),
            ClientLocation::Browser => match opener::open(&url) {
                Ok(()) => (String::new(), String::new()),
                Err(e) => (String::new(), format!("Unable to open a browser: {}", e)),
            },
        };
        RenderClientReturn { html, id, error }
    }

    /// Submit one render. A negative, not-yet-known id is created on the
    /// fly with a browser window opened on its viewer.
    pub fn start_render(&self, text: String, path: String, id: ClientId, is_dirty: bool) -> String {
        if self.manager.start_render(text.clone(), path.clone(), id, is_dirty) {
            return String::new();
        }
        if id < 0 && !self.manager.client_exists(id) {
            if let Created::Id(id) = self.manager.create_client(Some(id)) {
                let url = self.hosting.viewer_url(id);
                if let Err(e) = opener::open(&url) {
                    warn!("unable to open a browser on {}: {}", url, e);
                }
                if self.manager.start_render(text, path, id, is_dirty) {
                    return String::new();
                }
            }
        }
        unknown_client(id)
    }

    /// First step of the per-client shutdown choreography.
    pub fn stop_client(&self, id: ClientId) -> String {
        if self.manager.shutdown_client(id) {
            String::new()
        } else {
            unknown_client(id)
        }
    }

    /// Empty when healthy, non-empty while shutting down.
    pub fn ping(&self) -> String {
        if self.manager.is_shutting_down() {
            SHUTTING_DOWN.to_string()
        } else {
            String::new()
        }
    }

    fn dispatch(&self, request: Request) -> serde_json::Value {
        match request {
            Request::GetClient { location } => {
                serde_json::to_value(self.get_client(location)).expect("serializable")
            }
            Request::StartRender {
                text,
                path,
                id,
                is_dirty,
            } => serde_json::Value::String(self.start_render(text, path, id, is_dirty)),
            Request::StopClient { id } => serde_json::Value::String(self.stop_client(id)),
            Request::Ping => serde_json::Value::String(self.ping()),
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len).await {
        Ok(_) => {}
        // A clean disconnect between frames.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds the limit", len);
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn serve_connection(mut stream: TcpStream, rpc: EditorRpc) -> Result<()> {
    while let Some(body) = read_frame(&mut stream).await? {
        let request: Request = serde_json::from_slice(&body)
            .with_context(|| "Malformed RPC request")?;
        debug!("rpc request: {:?}", request);
        let response = rpc.dispatch(request);
        write_frame(&mut stream, &serde_json::to_vec(&response)?).await?;
    }
    Ok(())
}

/// Accept editor connections until the shutdown signal fires. A failing
/// accept loop is fatal for the whole service; the caller reacts to this
/// function returning.
pub async fn rpc_server(
    listener: TcpListener,
    rpc: EditorRpc,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("rpc server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.with_context(|| "RPC accept failed")?;
                debug!("editor connected from {}", peer);
                let rpc = rpc.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, rpc).await {
                        // Transport errors cost this connection only.
                        error!("rpc connection: {:#}", e);
                    }
                });
            }
        }
    }
}

/// Blocking RPC client for the CLI subcommands (`render`, `watch`,
/// `ping` checks). Runs outside the server's runtime.
pub struct RpcClient {
    stream: std::net::TcpStream,
}

impl RpcClient {
    pub fn connect() -> Result<RpcClient> {
        Self::connect_to(&format!("{}:{}", LOCALHOST, RPC_PORT))
    }

    pub fn connect_to(addr: &str) -> Result<RpcClient> {
        let stream = std::net::TcpStream::connect(addr)
            .with_context(|| format!("Unable to reach the CodeChat Server at {}", addr))?;
        Ok(RpcClient { stream })
    }

    fn call(&mut self, request: &Request) -> Result<serde_json::Value> {
        let body = serde_json::to_vec(request)?;
        self.stream.write_all(&(body.len() as u32).to_be_bytes())?;
        self.stream.write_all(&body)?;
        self.stream.flush()?;

        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len);
        if len > MAX_FRAME_LEN {
            bail!("frame of {} bytes exceeds the limit", len);
        }
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn call_string(&mut self, request: &Request) -> Result<String> {
        match self.call(request)? {
            serde_json::Value::String(s) => Ok(s),
            other => bail!("unexpected RPC response: {}", other),
        }
    }

    pub fn get_client(&mut self, location: i32) -> Result<RenderClientReturn> {
        let value = self.call(&Request::GetClient { location })?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn start_render(
        &mut self,
        text: String,
        path: String,
        id: ClientId,
        is_dirty: bool,
    ) -> Result<String> {
        self.call_string(&Request::StartRender {
            text,
            path,
            id,
            is_dirty,
        })
    }

    pub fn stop_client(&mut self, id: ClientId) -> Result<String> {
        self.call_string(&Request::StopClient { id })
    }

    pub fn ping(&mut self) -> Result<String> {
        self.call_string(&Request::Ping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rpc() -> EditorRpc {
        EditorRpc::new(RenderManager::new(), Hosting::Localhost)
    }

    #[test]
    fn get_client_returns_the_viewer_url() {
        let rpc = rpc();
        let ret = rpc.get_client(0);
        assert_eq!(ret.id, 0);
        assert_eq!(ret.html, "http://127.0.0.1:9091/client?id=0");
        assert_eq!(ret.error, "");
    }

    #[test]
    fn get_client_html_embeds_a_redirect() {
        let ret = rpc().get_client(1);
        assert!(ret.html.contains("http-equiv=\"refresh\""));
        assert!(ret.html.contains("client?id=0"));
    }

    #[test]
    fn invalid_locations_are_rejected() {
        let ret = rpc().get_client(3);
        assert_eq!(
            ret,
            RenderClientReturn {
                html: String::new(),
                id: -1,
                error: "Invalid location 3".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unknown_ids_yield_the_canonical_error() {
        let rpc = rpc();
        assert_eq!(
            rpc.start_render("".into(), "".into(), 0, false),
            "Unknown client id 0."
        );
        assert_eq!(rpc.stop_client(0), "Unknown client id 0.");
    }

    #[test]
    fn ping_is_empty_while_healthy() {
        assert_eq!(rpc().ping(), "");
    }

    #[tokio::test]
    async fn ping_reports_shutdown() {
        let manager = RenderManager::new();
        let rpc = EditorRpc::new(manager.clone(), Hosting::Localhost);
        manager.spawn_workers();
        manager.shutdown().await;
        assert_ne!(rpc.ping(), "");
        assert_eq!(rpc.get_client(0).id, -1);
    }

    #[test]
    fn requests_round_trip_through_json() {
        let request = Request::StartRender {
            text: "x".into(),
            path: "a.md".into(),
            id: 3,
            is_dirty: true,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("start_render"), "got: {}", json);
        let back: Request = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Request::StartRender { id: 3, .. }));
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let rpc = rpc();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = tokio::spawn(rpc_server(listener, rpc, shutdown_rx));

        let addr_str = addr.to_string();
        let client = tokio::task::spawn_blocking(move || {
            let mut client = RpcClient::connect_to(&addr_str).unwrap();
            let ping = client.ping().unwrap();
            let ret = client.get_client(0).unwrap();
            (ping, ret)
        });
        let (ping, ret) = client.await.unwrap();
        assert_eq!(ping, "");
        assert_eq!(ret.id, 0);

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
