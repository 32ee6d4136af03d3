//! Network addresses and process-wide constants. Editor plug-ins and the
//! CodeChat Client hard-code these values; change them in lock step with
//! the peer tooling.

/// The port used for the RPC connection between editor/IDE plug-ins and
/// the CodeChat Server. All plug-ins must use this port to reach the
/// server.
pub const RPC_PORT: u16 = 9090;

/// The port used for HTTP connections from the CodeChat Client to the
/// CodeChat Server.
pub const HTTP_PORT: u16 = 9091;

/// The port used for the websocket connection between the CodeChat Server
/// and the CodeChat Client.
pub const WEBSOCKET_PORT: u16 = 9092;

/// The loopback address all servers bind by default.
pub const LOCALHOST: &str = "127.0.0.1";

/// The address bound in `--insecure` mode.
pub const INSECURE_ADDRESS: &str = "0.0.0.0";

/// Written to stderr when all three ports are listening. The `start`
/// subcommand and editor plug-ins parse this marker; it must appear
/// exactly once, verbatim.
pub const READY_MARKER: &str = "CODECHAT_READY";

/// Banner preceding the ready marker on stderr.
pub const READY_BANNER: &str = "The CodeChat Server is ready.";

/// Number of render worker tasks. Renders for one client are serialised,
/// so parallelism beyond the number of live viewers buys nothing.
pub const RENDER_WORKER_COUNT: usize = 2;

/// How long `start` waits for the ready marker before killing the child.
pub const STARTUP_TIMEOUT_SECS: u64 = 10;

/// How long `stop_client` waits for the viewer to acknowledge the
/// shutdown before deleting the client anyway.
pub const SHUTDOWN_FALLBACK_MS: u64 = 1000;

/// The name of the per-project configuration file searched for in a
/// source file's ancestor directories.
pub const PROJECT_CONFIG_FILE: &str = "codechat_config.yaml";
