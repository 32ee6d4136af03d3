//! The HTTP port: serves the viewer page, rendered results and bundled
//! static assets to the browser. Everything is marked uncacheable; the
//! browser must always see the latest render.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;

use log::debug;
use tokio::sync::oneshot;
use warp::http::Response;
use warp::hyper::Body;
use warp::{Filter, Rejection};

use crate::errors::*;
use crate::manager::{ClientId, RenderManager, RenderResults};
use crate::utils::{self, Hosting};
use crate::viewer;

/// Bind the HTTP server with graceful shutdown. Returns the bound
/// address and the server future to spawn.
pub fn http_server(
    manager: RenderManager,
    hosting: Hosting,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let manager = warp::any().map(move || manager.clone());
    let hosting = warp::any().map(move || hosting.clone());

    // GET /client?id=<n> => the viewer page
    let viewer_page = warp::path!("client")
        .and(warp::query::<HashMap<String, String>>())
        .and(hosting)
        .and_then(viewer_page);

    // GET /client/<id>/<path> => rendered HTML, on-disk result or asset
    let client_file = warp::path("client")
        .and(warp::path::param::<ClientId>())
        .and(warp::path::tail())
        .and(manager)
        .and_then(client_file);

    // GET /static/<file> => bundled viewer assets
    let static_file = warp::path!("static" / String).and_then(static_file);

    // GET /insecure => warning page shown in insecure mode
    let insecure =
        warp::path!("insecure").map(|| page(200, "text/html", viewer::INSECURE.to_vec()));

    let routes = warp::get()
        .and(viewer_page.or(client_file).or(static_file).or(insecure))
        .with(warp::reply::with::header(
            "Cache-Control",
            "no-store, max-age=0",
        ));

    warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.await;
        })
        .map_err(|e| anyhow!("{}", e))
}

fn page(status: u16, content_type: &str, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Body::from(body))
        .expect("static response builds")
}

async fn viewer_page(
    query: HashMap<String, String>,
    hosting: Hosting,
) -> Result<Response<Body>, Rejection> {
    let Some(id) = query.get("id").and_then(|id| id.parse::<ClientId>().ok()) else {
        return Ok(page(
            400,
            "text/plain",
            b"Missing or invalid id query parameter.".to_vec(),
        ));
    };
    match viewer::render_index(id, &hosting.websocket_url()) {
        Ok(html) => Ok(page(200, "text/html", html.into_bytes())),
        Err(e) => Ok(page(500, "text/plain", format!("{:#}", e).into_bytes())),
    }
}

async fn client_file(
    id: ClientId,
    tail: warp::path::Tail,
    manager: RenderManager,
) -> Result<Response<Body>, Rejection> {
    let url_path = tail.as_str();
    match manager.get_render_results(id, url_path) {
        RenderResults::Html(html) => Ok(page(200, "text/html", html.into_bytes())),
        RenderResults::OnDisk(path) => Ok(serve_disk_file(&path).await),
        RenderResults::NoMatch => {
            // Not the rendered document; treat the URL as a filesystem
            // path (static assets next to the source). The routing layer
            // stripped the leading slash of native absolute paths.
            let decoded = utils::url_to_path(url_path);
            let fs_path = if cfg!(windows) {
                decoded
            } else {
                format!("/{}", decoded)
            };
            debug!("client {}: static fallback for {}", id, fs_path);
            Ok(serve_disk_file(Path::new(&fs_path)).await)
        }
    }
}

async fn serve_disk_file(path: &Path) -> Response<Body> {
    match tokio::fs::read(path).await {
        Ok(bytes) => page(200, content_type_of(path), bytes),
        Err(_) => page(404, "text/plain", b"File not found.".to_vec()),
    }
}

fn content_type_of(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "htm" | "html" | "xhtml" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

async fn static_file(name: String) -> Result<Response<Body>, Rejection> {
    match viewer::static_asset(&name) {
        Some((bytes, content_type)) => Ok(page(200, content_type, bytes.to_vec())),
        None => Ok(page(404, "text/plain", b"File not found.".to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_follow_the_extension() {
        assert_eq!(content_type_of(Path::new("a.html")), "text/html");
        assert_eq!(content_type_of(Path::new("a.svg")), "image/svg+xml");
        assert_eq!(content_type_of(Path::new("a.bin")), "application/octet-stream");
    }

    #[tokio::test]
    async fn rendered_html_is_served_inline() {
        let manager = RenderManager::new();
        manager.create_client(None);
        manager.start_render("*hi*", "x.md", 0, false);
        // One worker pass completes the render.
        while manager.get_render_results(0, "/x.md") == RenderResults::NoMatch {
            assert!(manager_process(&manager).await);
        }

        let response = client_file(0, test_tail("x.md").await, manager.clone())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let bytes = warp::hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body = String::from_utf8_lossy(&bytes).into_owned();
        assert!(body.contains("<em>hi</em>"), "got: {}", body);
    }

    #[tokio::test]
    async fn unknown_paths_fall_back_to_404() {
        let manager = RenderManager::new();
        manager.create_client(None);
        let response = client_file(0, test_tail("no/such/file.png").await, manager)
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    // Tails cannot be constructed directly; go through a filter.
    async fn test_tail(path: &str) -> warp::path::Tail {
        warp::test::request()
            .path(&format!("/{}", path))
            .filter(&warp::path::tail())
            .await
            .unwrap()
    }

    async fn manager_process(manager: &RenderManager) -> bool {
        // Drive the manager's queue without spawning workers.
        tokio::time::timeout(std::time::Duration::from_secs(5), manager.test_process_one())
            .await
            .unwrap_or(false)
    }
}
