//! The render manager: registry of per-viewer client state, the job
//! queue feeding the render worker pool, and the thread-safe façade the
//! RPC, HTTP and WebSocket handlers call into.
//!
//! Scheduling contract, per client: at most one entry in the job queue at
//! any moment (`in_job_queue` gates enqueues); a worker clears
//! `needs_processing` before snapshotting the pending slot, renders
//! without holding any lock, then re-enqueues the client iff
//! `needs_processing` was set again while it worked. This yields
//! at-most-one in-flight render per client and coalesces bursts of
//! submissions down to the most recent one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::constants::{RENDER_WORKER_COUNT, SHUTDOWN_FALLBACK_MS};
use crate::renderer::render_file;
use crate::utils;

/// Identifies one viewer session. Positive ids are server-allocated,
/// monotonic from 0; negative ids may be pre-declared by the editor.
pub type ClientId = i32;

/// Wire values of the event tag; they match what the CodeChat Client
/// expects in the `getResultType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Url = 0,
    Build = 1,
    Errors = 2,
    Command = 3,
}

/// One outbound event for a viewer's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerEvent {
    pub kind: EventKind,
    pub text: String,
}

impl ViewerEvent {
    pub fn new(kind: EventKind, text: impl Into<String>) -> ViewerEvent {
        ViewerEvent {
            kind,
            text: text.into(),
        }
    }

    /// The terminal event; after it is enqueued the viewer sees nothing
    /// else for this client.
    pub fn shutdown() -> ViewerEvent {
        ViewerEvent::new(EventKind::Command, "shutdown")
    }

    pub fn is_shutdown(&self) -> bool {
        self.kind == EventKind::Command && self.text == "shutdown"
    }
}

impl Serialize for ViewerEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ViewerEvent", 2)?;
        s.serialize_field("getResultType", &(self.kind as u8))?;
        s.serialize_field("text", &self.text)?;
        s.end()
    }
}

/// The next render to perform for a client. Overwritten unconditionally
/// by every submission; only the latest editor state matters.
#[derive(Debug, Clone)]
struct PendingRender {
    editor_text: String,
    file_path: String,
    is_dirty: bool,
}

/// The most recent completed render for a client.
#[derive(Debug, Clone)]
struct CompletedRender {
    /// POSIX-slash path of the rendered result.
    file_path: String,
    /// Set for project renders: the project's config-file path.
    project_path: Option<PathBuf>,
    /// In-band HTML; absent when the render produced a file on disk.
    html: Option<String>,
}

struct ClientState {
    mailbox_tx: mpsc::UnboundedSender<ViewerEvent>,
    /// Held here between viewer connections; the WebSocket loop checks
    /// it out and returns it on disconnect.
    mailbox_rx: Option<mpsc::UnboundedReceiver<ViewerEvent>>,
    last_render: Option<CompletedRender>,
    pending: Option<PendingRender>,
    in_job_queue: bool,
    needs_processing: bool,
    deleting: bool,
    /// Latched once the shutdown command is enqueued; suppresses every
    /// later event so shutdown is the last thing the viewer sees.
    shutdown_enqueued: bool,
}

impl ClientState {
    fn new() -> ClientState {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        ClientState {
            mailbox_tx,
            mailbox_rx: Some(mailbox_rx),
            last_render: None,
            pending: None,
            in_job_queue: false,
            needs_processing: false,
            deleting: false,
            shutdown_enqueued: false,
        }
    }

    fn post(&mut self, event: ViewerEvent) {
        if self.shutdown_enqueued {
            return;
        }
        if event.is_shutdown() {
            self.shutdown_enqueued = true;
        }
        // A send fails only when the receiver is gone, which means the
        // client is being torn down anyway.
        let _ = self.mailbox_tx.send(event);
    }
}

enum Job {
    Render(ClientId),
    Shutdown,
}

struct Registry {
    clients: HashMap<ClientId, ClientState>,
    next_id: ClientId,
    shutting_down: bool,
}

struct Inner {
    registry: Mutex<Registry>,
    job_tx: mpsc::UnboundedSender<Job>,
    job_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    shutdown_tx: watch::Sender<bool>,
    all_deleted: Notify,
}

/// Result of [`RenderManager::create_client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    Id(ClientId),
    /// The preferred id is already live.
    Duplicate,
    ShuttingDown,
}

/// What [`RenderManager::get_render_results`] found for a URL path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderResults {
    /// The latest render's HTML, held in-band.
    Html(String),
    /// The latest render wrote this file on disk; serve it from there.
    OnDisk(PathBuf),
    /// The path does not correspond to the latest render.
    NoMatch,
}

/// Thread-safe façade over the client registry and worker pool. Cloning
/// is cheap and shares the instance. Registry mutations happen inside
/// short critical sections that never suspend.
#[derive(Clone)]
pub struct RenderManager {
    inner: Arc<Inner>,
}

impl Default for RenderManager {
    fn default() -> RenderManager {
        RenderManager::new()
    }
}

impl RenderManager {
    pub fn new() -> RenderManager {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        RenderManager {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    clients: HashMap::new(),
                    next_id: 0,
                    shutting_down: false,
                }),
                job_tx,
                job_rx: tokio::sync::Mutex::new(job_rx),
                shutdown_tx,
                all_deleted: Notify::new(),
            }),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.registry.lock().expect("registry mutex poisoned")
    }

    /// Create a client, optionally with an editor-chosen (negative) id.
    pub fn create_client(&self, preferred: Option<ClientId>) -> Created {
        let mut registry = self.registry();
        if registry.shutting_down {
            return Created::ShuttingDown;
        }
        let id = match preferred {
            Some(id) => {
                if registry.clients.contains_key(&id) {
                    return Created::Duplicate;
                }
                id
            }
            None => {
                let id = registry.next_id;
                registry.next_id += 1;
                id
            }
        };
        registry.clients.insert(id, ClientState::new());
        info!("created client {}", id);
        Created::Id(id)
    }

    /// Mark a client for removal. The tombstone is observed by the next
    /// worker pass, which erases the entry.
    pub fn delete_client(&self, id: ClientId) -> bool {
        let mut registry = self.registry();
        let Some(client) = registry.clients.get_mut(&id) else {
            return false;
        };
        if client.deleting {
            return false;
        }
        client.deleting = true;
        if !client.in_job_queue {
            client.in_job_queue = true;
            let _ = self.inner.job_tx.send(Job::Render(id));
        }
        info!("client {} scheduled for deletion", id);
        true
    }

    /// Overwrite the client's pending slot and make sure a worker will
    /// pick it up. Returns false for unknown or deleting clients.
    pub fn start_render(
        &self,
        editor_text: impl Into<String>,
        file_path: impl Into<String>,
        id: ClientId,
        is_dirty: bool,
    ) -> bool {
        let mut registry = self.registry();
        let Some(client) = registry.clients.get_mut(&id) else {
            return false;
        };
        if client.deleting {
            return false;
        }
        client.pending = Some(PendingRender {
            editor_text: editor_text.into(),
            file_path: file_path.into(),
            is_dirty,
        });
        client.needs_processing = true;
        if !client.in_job_queue {
            client.in_job_queue = true;
            let _ = self.inner.job_tx.send(Job::Render(id));
        }
        true
    }

    /// Check out the client's mailbox receiver. At most one WebSocket
    /// loop may hold it; it is returned via [`Self::return_queue`].
    pub fn take_queue(&self, id: ClientId) -> Option<mpsc::UnboundedReceiver<ViewerEvent>> {
        self.registry().clients.get_mut(&id)?.mailbox_rx.take()
    }

    /// Hand the mailbox receiver back after a viewer disconnect so a
    /// reconnecting browser can resume.
    pub fn return_queue(&self, id: ClientId, rx: mpsc::UnboundedReceiver<ViewerEvent>) {
        if let Some(client) = self.registry().clients.get_mut(&id) {
            client.mailbox_rx = Some(rx);
        }
    }

    pub fn client_exists(&self, id: ClientId) -> bool {
        self.registry().clients.contains_key(&id)
    }

    /// The latest render's project config path and source path, for the
    /// viewer's save-file round trip.
    pub fn last_render_paths(&self, id: ClientId) -> Option<(Option<PathBuf>, String)> {
        let registry = self.registry();
        let last = registry.clients.get(&id)?.last_render.as_ref()?;
        Some((last.project_path.clone(), last.file_path.clone()))
    }

    /// Decide how the HTTP handler should answer `GET /client/<id>/<path>`.
    pub fn get_render_results(&self, id: ClientId, url_path: &str) -> RenderResults {
        let registry = self.registry();
        let Some(last) = registry
            .clients
            .get(&id)
            .and_then(|client| client.last_render.as_ref())
        else {
            return RenderResults::NoMatch;
        };
        if !utils::url_matches_path(url_path, &last.file_path) {
            return RenderResults::NoMatch;
        }
        match &last.html {
            Some(html) => RenderResults::Html(html.clone()),
            None => RenderResults::OnDisk(PathBuf::from(&last.file_path)),
        }
    }

    /// Begin the per-client shutdown choreography: enqueue the terminal
    /// shutdown command and arm a fallback delete in case the viewer
    /// never consumes it. Must be called from within the runtime.
    pub fn shutdown_client(&self, id: ClientId) -> bool {
        {
            let mut registry = self.registry();
            let Some(client) = registry.clients.get_mut(&id) else {
                return false;
            };
            if client.deleting {
                return false;
            }
            client.post(ViewerEvent::shutdown());
        }
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_FALLBACK_MS)).await;
            if manager.delete_client(id) {
                warn!("viewer for client {} never acknowledged the shutdown", id);
            }
        });
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.registry().shutting_down
    }

    /// A receiver that flips to true when service-wide shutdown begins.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Service-wide shutdown: refuse new clients, tear down every live
    /// viewer, wait for the registry to drain, then stop the workers by
    /// feeding one sentinel per worker into the job queue.
    pub async fn shutdown(&self) {
        let ids: Vec<ClientId> = {
            let mut registry = self.registry();
            registry.shutting_down = true;
            registry.clients.keys().copied().collect()
        };
        let _ = self.inner.shutdown_tx.send(true);
        info!("shutting down; draining {} client(s)", ids.len());
        for id in ids {
            self.shutdown_client(id);
        }
        loop {
            // Register for the wakeup before checking emptiness, so a
            // removal between the check and the await is not lost.
            let mut notified = std::pin::pin!(self.inner.all_deleted.notified());
            notified.as_mut().enable();
            if self.registry().clients.is_empty() {
                break;
            }
            notified.await;
        }
        for _ in 0..RENDER_WORKER_COUNT {
            let _ = self.inner.job_tx.send(Job::Shutdown);
        }
    }

    /// Spawn the render worker pool.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..RENDER_WORKER_COUNT)
            .map(|n| {
                let manager = self.clone();
                tokio::spawn(async move { manager.worker_loop(n).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize) {
        debug!("render worker {} started", worker);
        while self.process_one_job().await {}
        debug!("render worker {} observed the shutdown sentinel", worker);
    }

    /// Block for the next job and process it. Returns false once the
    /// shutdown sentinel (or a closed queue) is observed.
    async fn process_one_job(&self) -> bool {
        let job = self.inner.job_rx.lock().await.recv().await;
        let id = match job {
            Some(Job::Render(id)) => id,
            Some(Job::Shutdown) | None => return false,
        };
        self.process_client(id).await;
        true
    }

    async fn process_client(&self, id: ClientId) {
        // Claim the work: clear needs_processing before snapshotting the
        // pending slot, so submissions arriving during the render are
        // detected afterwards.
        let pending = {
            let mut registry = self.registry();
            let Some(client) = registry.clients.get_mut(&id) else {
                return;
            };
            if client.deleting {
                self.remove_client(&mut registry, id);
                return;
            }
            client.needs_processing = false;
            match client.pending.clone() {
                Some(pending) => pending,
                None => {
                    client.in_job_queue = false;
                    return;
                }
            }
        };

        let manager = self.clone();
        let mut co_build =
            move |chunk: String| manager.post_event(id, ViewerEvent::new(EventKind::Build, chunk));
        let outcome = render_file(
            &pending.editor_text,
            Path::new(&pending.file_path),
            &mut co_build,
            pending.is_dirty,
        )
        .await;

        let mut registry = self.registry();
        let Some(client) = registry.clients.get_mut(&id) else {
            return;
        };
        if outcome.was_performed {
            client.last_render = Some(CompletedRender {
                file_path: outcome.rendered_file_path.clone(),
                project_path: outcome.project_path,
                html: outcome.html,
            });
            client.post(ViewerEvent::new(EventKind::Errors, outcome.errors));
            client.post(ViewerEvent::new(
                EventKind::Url,
                utils::path_to_url(&outcome.rendered_file_path),
            ));
        }
        if client.deleting {
            self.remove_client(&mut registry, id);
        } else if client.needs_processing {
            // A newer submission arrived mid-render; keep the queue slot.
            let _ = self.inner.job_tx.send(Job::Render(id));
        } else {
            client.in_job_queue = false;
        }
    }

    fn remove_client(&self, registry: &mut Registry, id: ClientId) {
        registry.clients.remove(&id);
        info!("removed client {}", id);
        if registry.shutting_down && registry.clients.is_empty() {
            self.inner.all_deleted.notify_waiters();
        }
    }

    /// Drive one job queue entry from a test, without spawning workers.
    #[cfg(test)]
    pub(crate) async fn test_process_one(&self) -> bool {
        self.process_one_job().await
    }

    /// Post one event through the client's ordering latch.
    fn post_event(&self, id: ClientId, event: ViewerEvent) {
        if let Some(client) = self.registry().clients.get_mut(&id) {
            client.post(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collect_events(rx: &mut mpsc::UnboundedReceiver<ViewerEvent>) -> Vec<ViewerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn ids_are_allocated_monotonically_from_zero() {
        let manager = RenderManager::new();
        assert_eq!(manager.create_client(None), Created::Id(0));
        assert_eq!(manager.create_client(None), Created::Id(1));
        assert_eq!(manager.create_client(Some(-7)), Created::Id(-7));
        assert_eq!(manager.create_client(None), Created::Id(2));
    }

    #[test]
    fn duplicate_preferred_ids_are_rejected() {
        let manager = RenderManager::new();
        assert_eq!(manager.create_client(Some(-1)), Created::Id(-1));
        assert_eq!(manager.create_client(Some(-1)), Created::Duplicate);
    }

    #[test]
    fn unknown_clients_cannot_start_renders() {
        let manager = RenderManager::new();
        assert!(!manager.start_render("", "x.md", 0, false));
    }

    #[test]
    fn events_serialize_with_wire_tags() {
        let event = ViewerEvent::new(EventKind::Errors, "oops");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"getResultType":2,"text":"oops"}"#);
        let url = ViewerEvent::new(EventKind::Url, "/x.md");
        assert_eq!(
            serde_json::to_string(&url).unwrap(),
            r#"{"getResultType":0,"text":"/x.md"}"#
        );
    }

    #[tokio::test]
    async fn a_render_cycle_emits_errors_then_url() {
        let manager = RenderManager::new();
        assert_eq!(manager.create_client(None), Created::Id(0));
        let mut rx = manager.take_queue(0).unwrap();

        assert!(manager.start_render("*hi*", "x.md", 0, false));
        assert!(manager.process_one_job().await);

        let events = collect_events(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Errors);
        assert_eq!(events[0].text, "");
        assert_eq!(events[1].kind, EventKind::Url);
        assert_eq!(events[1].text, "/x.md");

        assert_eq!(
            manager.get_render_results(0, "/x.md"),
            RenderResults::Html("<p><em>hi</em></p>\n".to_string())
        );
        assert_eq!(manager.get_render_results(0, "/y.md"), RenderResults::NoMatch);
    }

    #[tokio::test]
    async fn burst_submissions_coalesce_to_the_latest() {
        let manager = RenderManager::new();
        manager.create_client(None);
        let mut rx = manager.take_queue(0).unwrap();

        // Three submissions while no worker runs: one queue entry, and
        // the snapshot sees only the last text.
        assert!(manager.start_render("*A*", "x.md", 0, false));
        assert!(manager.start_render("*B*", "x.md", 0, false));
        assert!(manager.start_render("*C*", "x.md", 0, false));
        assert!(manager.process_one_job().await);

        let events = collect_events(&mut rx);
        assert_eq!(events.len(), 2, "one render cycle only: {:?}", events);
        assert_eq!(
            manager.get_render_results(0, "/x.md"),
            RenderResults::Html("<p><em>C</em></p>\n".to_string())
        );

        // The queue is empty again: the next recv would block.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), manager.process_one_job()).await;
        assert!(blocked.is_err(), "job queue should be empty");
    }

    #[tokio::test]
    async fn deletion_is_handled_by_the_worker_pass() {
        let manager = RenderManager::new();
        manager.create_client(None);
        assert!(manager.delete_client(0));
        assert!(!manager.delete_client(0), "deleting is monotonic");
        assert!(!manager.start_render("", "x.md", 0, false));
        assert!(manager.process_one_job().await);
        assert!(!manager.client_exists(0));
    }

    #[tokio::test]
    async fn shutdown_command_is_the_last_event() {
        let manager = RenderManager::new();
        manager.create_client(None);
        let mut rx = manager.take_queue(0).unwrap();

        assert!(manager.shutdown_client(0));
        // Anything after the shutdown command is suppressed.
        assert!(manager.start_render("*late*", "x.md", 0, false));
        assert!(manager.process_one_job().await);

        let events = collect_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_shutdown());
    }

    #[tokio::test]
    async fn queue_checkout_is_exclusive_and_returnable() {
        let manager = RenderManager::new();
        manager.create_client(None);
        let rx = manager.take_queue(0).unwrap();
        assert!(manager.take_queue(0).is_none());
        manager.return_queue(0, rx);
        assert!(manager.take_queue(0).is_some());
    }

    #[tokio::test]
    async fn service_shutdown_drains_clients_and_stops_workers() {
        let manager = RenderManager::new();
        manager.create_client(None);
        manager.create_client(None);
        let workers = manager.spawn_workers();

        manager.shutdown().await;
        assert_eq!(manager.create_client(None), Created::ShuttingDown);
        for worker in workers {
            worker.await.unwrap();
        }
        assert!(!manager.client_exists(0));
        assert!(!manager.client_exists(1));
    }

    #[tokio::test]
    async fn dirty_project_sources_produce_no_events() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(crate::constants::PROJECT_CONFIG_FILE),
            "output_path: _build\nargs: false\n",
        )
        .unwrap();
        let file = dir.path().join("ch.rst");
        std::fs::write(&file, "text").unwrap();

        let manager = RenderManager::new();
        manager.create_client(None);
        let mut rx = manager.take_queue(0).unwrap();
        assert!(manager.start_render("text", file.to_string_lossy(), 0, true));
        assert!(manager.process_one_job().await);
        assert!(collect_events(&mut rx).is_empty());
    }
}
