#![allow(missing_docs)] // FIXME: Document this

pub mod fs;

use std::env;
use std::process::Command;

use log::error;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::constants::{HTTP_PORT, WEBSOCKET_PORT};
use crate::errors::Error;

/// Convert a filesystem path to the URL path under which the rendered
/// result is served. Internally paths are stored with POSIX slashes; the
/// HTTP routing layer strips the leading slash, so it is re-prepended
/// here.
pub fn path_to_url(path: &str) -> String {
    let path = fs::normalize_path(path);
    if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    }
}

/// Decode a percent-encoded URL path received from the HTTP or WebSocket
/// layer back to a POSIX-slash path. Invalid escapes are kept verbatim.
pub fn url_to_path(url_path: &str) -> String {
    let bytes = url_path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let escape = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(escape, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Compare two paths for equality after normalisation and URL decoding,
/// ignoring a leading slash on either side.
pub fn url_matches_path(url_path: &str, fs_path: &str) -> bool {
    let url = url_to_path(url_path);
    let url = url.trim_start_matches('/');
    let path = fs::normalize_path(fs_path);
    url == path.trim_start_matches('/')
}

/// Hosting environments where the browser cannot reach plain localhost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hosting {
    Localhost,
    /// GitHub Codespaces; the viewer URL uses the forwarded-port hostname.
    Codespaces { name: String, domain: String },
    /// A CoCalc project; the viewer URL goes through the project's proxy.
    CoCalc { project_id: String },
}

impl Hosting {
    /// Auto-detect the hosting environment from the process environment.
    pub fn detect() -> Hosting {
        if env::var("CODESPACES").as_deref() == Ok("true") {
            if let (Ok(name), Ok(domain)) = (
                env::var("CODESPACE_NAME"),
                env::var("GITHUB_CODESPACES_PORT_FORWARDING_DOMAIN"),
            ) {
                return Hosting::Codespaces { name, domain };
            }
        }
        if let Some(project_id) = cocalc_project_id() {
            return Hosting::CoCalc { project_id };
        }
        Hosting::Localhost
    }

    /// Both forwarded-port environments require binding beyond loopback.
    pub fn requires_insecure(&self) -> bool {
        !matches!(self, Hosting::Localhost)
    }

    /// The URL a browser must open to show the viewer for `id`.
    pub fn viewer_url(&self, id: i32) -> String {
        match self {
            Hosting::Localhost => {
                format!("http://127.0.0.1:{}/client?id={}", HTTP_PORT, id)
            }
            Hosting::Codespaces { name, domain } => {
                format!("https://{}-{}.{}/client?id={}", name, HTTP_PORT, domain, id)
            }
            Hosting::CoCalc { project_id } => format!(
                "https://cocalc.com/{}/server/{}/client?id={}",
                project_id, HTTP_PORT, id
            ),
        }
    }

    /// The URL the viewer page uses to reach the websocket port.
    pub fn websocket_url(&self) -> String {
        match self {
            Hosting::Localhost => format!("ws://127.0.0.1:{}", WEBSOCKET_PORT),
            Hosting::Codespaces { name, domain } => {
                format!("wss://{}-{}.{}", name, WEBSOCKET_PORT, domain)
            }
            Hosting::CoCalc { project_id } => {
                format!("wss://cocalc.com/{}/server/{}", project_id, WEBSOCKET_PORT)
            }
        }
    }
}

/// CoCalc project hosts are named `project-<uuid>`; the id is parsed from
/// `uname -n`.
fn cocalc_project_id() -> Option<String> {
    static PROJECT_HOST: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"^project-([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})$",
        )
        .unwrap()
    });

    let output = Command::new("uname").arg("-n").output().ok()?;
    let hostname = String::from_utf8_lossy(&output.stdout);
    PROJECT_HOST
        .captures(hostname.trim())
        .map(|cap| cap[1].to_string())
}

/// Prints a "backtrace" of some `Error`.
pub fn log_backtrace(e: &Error) {
    error!("Error: {}", e);

    for cause in e.chain().skip(1) {
        error!("\tCaused By: {}", cause);
    }
}
