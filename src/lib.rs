//! The CodeChat Server turns editor buffers and on-disk documents into a
//! live, browser-rendered HTML view. An editor plug-in submits buffers over
//! the [RPC port](rpc); the [`RenderManager`](manager::RenderManager)
//! queues, coalesces and renders them; the results reach the browser
//! through the [HTTP](web) and [WebSocket](websocket) ports.

pub mod constants;
pub mod manager;
pub mod project;
pub mod renderer;
pub mod rpc;
pub mod server;
pub mod subprocess;
pub mod utils;
pub mod viewer;
pub mod web;
pub mod websocket;

/// The current version of the CodeChat Server.
///
/// This is provided as a way for editor plug-ins to do compatibility checks.
pub const CODECHAT_SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use crate::manager::{ClientId, RenderManager};
pub use crate::renderer::render_file;

/// The error types used through out this crate.
pub mod errors {
    pub(crate) use anyhow::{anyhow, bail, Context};
    pub use anyhow::{Error, Result};
}
