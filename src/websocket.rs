//! The websocket port: one push loop per viewer connection. The first
//! inbound frame names the client id; afterwards the loop drains the
//! client's mailbox to the socket while accepting viewer messages
//! (`save_file`, `navigate_to_error`) in the other direction.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::oneshot;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::errors::*;
use crate::manager::{ClientId, EventKind, RenderManager, ViewerEvent};
use crate::project::Project;

/// Bind the websocket server with graceful shutdown.
pub fn ws_server(
    manager: RenderManager,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let manager = warp::any().map(move || manager.clone());
    let routes = warp::ws()
        .and(manager)
        .map(|ws: warp::ws::Ws, manager: RenderManager| {
            ws.on_upgrade(move |socket| viewer_connection(socket, manager))
        });

    warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.await;
        })
        .map_err(|e| anyhow!("{}", e))
}

/// Run one viewer connection to completion.
pub async fn viewer_connection(mut socket: WebSocket, manager: RenderManager) {
    // Handshake: the first frame is the JSON-encoded client id.
    let id = loop {
        match socket.next().await {
            Some(Ok(frame)) if frame.is_text() => {
                break frame
                    .to_str()
                    .ok()
                    .and_then(|text| serde_json::from_str::<ClientId>(text).ok());
            }
            Some(Ok(frame)) if frame.is_ping() || frame.is_pong() => continue,
            _ => return,
        }
    };

    let mut mailbox = match id {
        Some(id) => match manager.take_queue(id) {
            Some(mailbox) => mailbox,
            None => {
                let text = format!("error: unknown client {}.", id);
                return reject_viewer(socket, text).await;
            }
        },
        None => return reject_viewer(socket, "error: unknown client None.".to_string()).await,
    };
    let id = id.expect("checked above");
    info!("viewer connected for client {}", id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            event = mailbox.recv() => match event {
                // The sender is gone: the client was removed.
                None => break,
                Some(event) => {
                    let is_shutdown = event.is_shutdown();
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("client {}: unencodable event: {}", id, e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::text(json)).await {
                        debug!("client {}: websocket send failed: {}", id, e);
                        manager.return_queue(id, mailbox);
                        return;
                    }
                    if is_shutdown {
                        // Drain complete; finish the teardown.
                        manager.delete_client(id);
                        break;
                    }
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(frame)) if frame.is_text() => {
                    if let Ok(text) = frame.to_str() {
                        handle_viewer_message(&manager, id, text);
                    }
                }
                Some(Ok(frame)) if frame.is_close() => {
                    debug!("client {}: viewer closed the socket", id);
                    manager.return_queue(id, mailbox);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("client {}: websocket receive failed: {}", id, e);
                    manager.return_queue(id, mailbox);
                    return;
                }
                None => {
                    manager.return_queue(id, mailbox);
                    return;
                }
            },
        }
    }
    let _ = ws_tx.close().await;
    info!("viewer for client {} disconnected", id);
}

async fn reject_viewer(mut socket: WebSocket, text: String) {
    warn!("{}", text);
    let event = ViewerEvent::new(EventKind::Command, text);
    if let Ok(json) = serde_json::to_string(&event) {
        let _ = socket.send(Message::text(json)).await;
    }
    let _ = socket.close().await;
}

/// Viewer frames are tagged `[msg, data]`.
fn handle_viewer_message(manager: &RenderManager, id: ClientId, text: &str) {
    let parsed: std::result::Result<(String, serde_json::Value), _> = serde_json::from_str(text);
    let (msg, data) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("client {}: malformed viewer message ({}): {}", id, e, text);
            return;
        }
    };
    match msg.as_str() {
        "save_file" => {
            let xml_node = data["xml_node"].as_str().unwrap_or_default().to_string();
            let file_contents = data["file_contents"].as_str().unwrap_or_default();
            if let Err(e) = save_file(manager, id, &xml_node, file_contents) {
                error!("client {}: save_file failed: {:#}", id, e);
            }
        }
        "navigate_to_error" => {
            // No editor surface for this yet; record it.
            info!(
                "client {}: navigate_to_error line={} file={}",
                id, data["line"], data["file_path"]
            );
        }
        other => warn!("client {}: unknown viewer message {:?}", id, other),
    }
}

static XML_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").unwrap());

/// Write edited PreTeXt content back to its source file: find the file
/// that produced `xml_node` via `mapping.json`, then replace the element
/// whose `xml:id` matches. The node name is matched literally; anything
/// that is not an XML identifier is rejected.
fn save_file(manager: &RenderManager, id: ClientId, xml_node: &str, file_contents: &str) -> Result<()> {
    if !XML_IDENTIFIER.is_match(xml_node) {
        bail!("refusing non-identifier xml node {:?}", xml_node);
    }
    let (project_path, _) = manager
        .last_render_paths(id)
        .ok_or_else(|| anyhow!("no completed render for this client"))?;
    let project_path = project_path.ok_or_else(|| anyhow!("the last render was not a project"))?;
    let project = Project::load(&project_path)?;

    let source_path = source_for_xml_id(&project.output_path, xml_node)?;
    // The replacement must itself be well-formed before anything is
    // written back.
    validate_xml(file_contents)?;

    let text = std::fs::read_to_string(&source_path)
        .with_context(|| format!("Unable to read {}", source_path.display()))?;
    let (start, end) = element_span(&text, xml_node)?;
    let patched = format!("{}{}{}", &text[..start], file_contents, &text[end..]);
    std::fs::write(&source_path, patched)
        .with_context(|| format!("Unable to write {}", source_path.display()))?;
    info!("client {}: saved {} into {}", id, xml_node, source_path.display());
    Ok(())
}

fn source_for_xml_id(output_path: &Path, xml_node: &str) -> Result<PathBuf> {
    let mapping_path = output_path.join("mapping.json");
    let mapping: HashMap<String, Vec<String>> =
        serde_json::from_slice(&std::fs::read(&mapping_path).with_context(|| {
            format!("Unable to read {}", mapping_path.display())
        })?)
        .with_context(|| format!("Malformed {}", mapping_path.display()))?;
    mapping
        .into_iter()
        .find(|(_, ids)| ids.iter().any(|id| id == xml_node))
        .map(|(path, _)| PathBuf::from(path))
        .ok_or_else(|| anyhow!("no source file maps to xml id {:?}", xml_node))
}

fn validate_xml(text: &str) -> Result<()> {
    let mut reader = quick_xml::Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Eof) => return Ok(()),
            Ok(_) => {}
            Err(e) => bail!("replacement content is not well-formed XML: {}", e),
        }
    }
}

/// Byte span of the element carrying `xml:id="<xml_node>"`, including its
/// end tag.
fn element_span(text: &str, xml_node: &str) -> Result<(usize, usize)> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(text);
    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                if has_xml_id(&start, xml_node) {
                    // Skip to the matching end tag.
                    let name = start.name().as_ref().to_vec();
                    let mut depth = 0usize;
                    loop {
                        match reader.read_event() {
                            Ok(Event::Start(inner)) if inner.name().as_ref() == name => depth += 1,
                            Ok(Event::End(end)) if end.name().as_ref() == name => {
                                if depth == 0 {
                                    return Ok((before, reader.buffer_position() as usize));
                                }
                                depth -= 1;
                            }
                            Ok(Event::Eof) => bail!("unclosed element for {:?}", xml_node),
                            Ok(_) => {}
                            Err(e) => bail!("malformed source XML: {}", e),
                        }
                    }
                }
            }
            Ok(Event::Empty(start)) => {
                if has_xml_id(&start, xml_node) {
                    return Ok((before, reader.buffer_position() as usize));
                }
            }
            Ok(Event::Eof) => bail!("no element with xml:id {:?}", xml_node),
            Ok(_) => {}
            Err(e) => bail!("malformed source XML: {}", e),
        }
    }
}

fn has_xml_id(start: &quick_xml::events::BytesStart<'_>, xml_node: &str) -> bool {
    start.attributes().flatten().any(|attr| {
        attr.key.as_ref() == b"xml:id" && attr.value.as_ref() == xml_node.as_bytes()
    })
}
