//! Assembles the service: the render manager and worker pool, the editor
//! RPC port, the HTTP port and the websocket port, plus the shutdown
//! choreography that drains them in order.

use std::net::SocketAddr;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::constants::{
    HTTP_PORT, INSECURE_ADDRESS, LOCALHOST, READY_BANNER, READY_MARKER, RPC_PORT, WEBSOCKET_PORT,
};
use crate::errors::*;
use crate::manager::RenderManager;
use crate::rpc::{rpc_server, EditorRpc};
use crate::utils::Hosting;
use crate::web::http_server;
use crate::websocket::ws_server;

/// Options for a foreground `serve`.
#[derive(Debug, Clone, Default)]
pub struct ServeOpts {
    /// Bind every port on all interfaces instead of loopback.
    pub insecure: bool,
    /// Accepted for CLI compatibility; coverage is collected by external
    /// tooling, not in-process.
    pub coverage: bool,
}

/// Run the server until a signal arrives or a fatal error brings it
/// down. Prints the ready marker to stderr once all three ports listen.
pub async fn run(opts: ServeOpts) -> Result<()> {
    let hosting = Hosting::detect();
    let insecure = opts.insecure || hosting.requires_insecure();
    if opts.coverage {
        info!("--coverage requested; use external tooling to collect it");
    }
    if insecure {
        warn!("binding on all interfaces; see http://127.0.0.1:{}/insecure", HTTP_PORT);
    }
    let bind_ip = if insecure { INSECURE_ADDRESS } else { LOCALHOST };

    let manager = RenderManager::new();
    let workers = manager.spawn_workers();
    let rpc = EditorRpc::new(manager.clone(), hosting.clone());

    // Bind all three ports before announcing readiness; report every
    // conflict in one message.
    let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
    let (ws_shutdown_tx, ws_shutdown_rx) = oneshot::channel();
    let (rpc_shutdown_tx, rpc_shutdown_rx) = oneshot::channel();

    let mut port_errors: Vec<u16> = Vec::new();
    let rpc_listener = match TcpListener::bind(addr(bind_ip, RPC_PORT)).await {
        Ok(listener) => Some(listener),
        Err(_) => {
            port_errors.push(RPC_PORT);
            None
        }
    };
    let http = match http_server(
        manager.clone(),
        hosting.clone(),
        addr(bind_ip, HTTP_PORT),
        http_shutdown_rx,
    ) {
        Ok(bound) => Some(bound),
        Err(_) => {
            port_errors.push(HTTP_PORT);
            None
        }
    };
    let ws = match ws_server(manager.clone(), addr(bind_ip, WEBSOCKET_PORT), ws_shutdown_rx) {
        Ok(bound) => Some(bound),
        Err(_) => {
            port_errors.push(WEBSOCKET_PORT);
            None
        }
    };
    if !port_errors.is_empty() {
        let ports: Vec<String> = port_errors.iter().map(u16::to_string).collect();
        let message = format!(
            "Error: port(s) {} already in use. Is another CodeChat Server running?",
            ports.join(", ")
        );
        eprintln!("{}", message);
        bail!(message);
    }

    let (_, http_future) = http.expect("bound above");
    let (_, ws_future) = ws.expect("bound above");
    let http_handle = tokio::spawn(http_future);
    let ws_handle = tokio::spawn(ws_future);
    let mut rpc_handle = tokio::spawn(rpc_server(
        rpc_listener.expect("bound above"),
        rpc,
        rpc_shutdown_rx,
    ));

    // Peer tooling parses this, so it must appear exactly once and only
    // after every port accepts connections.
    eprint!("{}\n{}\n", READY_BANNER, READY_MARKER);
    info!("listening on {} (rpc {}, http {}, websocket {})", bind_ip, RPC_PORT, HTTP_PORT, WEBSOCKET_PORT);

    let mut fatal: Option<Error> = None;
    let mut rpc_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received; shutting down"),
        result = &mut rpc_handle => {
            rpc_done = true;
            // The RPC server only returns early on a fatal error; that
            // brings the whole service down.
            match result {
                Ok(Ok(())) => warn!("rpc server exited unexpectedly"),
                Ok(Err(e)) => {
                    error!("rpc server failed: {:#}", e);
                    fatal = Some(e);
                }
                Err(e) => {
                    error!("rpc server panicked: {}", e);
                    fatal = Some(anyhow!("rpc server panicked: {}", e));
                }
            }
        }
    }

    // Drain: no new clients, tear down the viewers, wait for the
    // registry to empty, then stop the workers and the listeners.
    manager.shutdown().await;
    let _ = rpc_shutdown_tx.send(());
    let _ = http_shutdown_tx.send(());
    let _ = ws_shutdown_tx.send(());
    if !rpc_done {
        let _ = rpc_handle.await;
    }
    let _ = http_handle.await;
    let _ = ws_handle.await;
    for worker in workers {
        let _ = worker.await;
    }
    info!("all tasks stopped");

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn addr(ip: &str, port: u16) -> SocketAddr {
    format!("{}:{}", ip, port)
        .parse()
        .expect("static address parses")
}
