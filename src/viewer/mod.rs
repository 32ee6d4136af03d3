#![allow(missing_docs)]

//! The embedded CodeChat Client: the page a browser opens for one viewer
//! session, plus its script and stylesheet. The page is a handlebars
//! template; the server fills in the client id and the websocket URL.

use handlebars::Handlebars;
use serde_json::json;

use crate::errors::*;

pub static INDEX: &str = include_str!("index.hbs");
pub static CLIENT_JS: &[u8] = include_bytes!("client.js");
pub static CLIENT_CSS: &[u8] = include_bytes!("style.css");
pub static INSECURE: &[u8] = include_bytes!("insecure.html");

/// Render the viewer page for one client id.
pub fn render_index(client_id: i32, websocket_url: &str) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars
        .register_template_string("index", INDEX)
        .with_context(|| "Invalid embedded viewer template")?;
    handlebars
        .render(
            "index",
            &json!({ "client_id": client_id, "websocket_url": websocket_url }),
        )
        .with_context(|| "Unable to render the viewer page")
}

/// Look up a bundled asset served under `/static/`.
pub fn static_asset(name: &str) -> Option<(&'static [u8], &'static str)> {
    match name {
        "client.js" => Some((CLIENT_JS, "application/javascript")),
        "style.css" => Some((CLIENT_CSS, "text/css")),
        _ => None,
    }
}
