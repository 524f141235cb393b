use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// LSP/MCP multiplexed server for Crush and Neovim.
#[derive(Parser, Debug)]
#[command(name = "neocrush", version, about, long_about = LONG_ABOUT)]
struct Cli {
    /// Log file path (defaults to $NEOCRUSH_LOG, otherwise stderr)
    #[arg(long)]
    log: Option<PathBuf>,

    /// Run as daemon (internal use)
    #[arg(long, hide = true)]
    daemon: bool,
}

const LONG_ABOUT: &str = "\
Runs as an LSP server that synchronizes state between Neovim and Crush,
and as an MCP server providing editor context to AI tools.

Protocol is auto-detected from the first message:
  - LSP: Content-Length header (from Neovim/Crush LSP clients)
  - MCP: Newline-delimited JSON (from AI tools)

On first run, starts a background daemon and connects to it. Subsequent
clients connect to the same daemon. The daemon exits when all clients
disconnect.

Client identification is automatic via the LSP initialize request.
Messages from Neovim are forwarded to Crush and vice versa.

MCP Tools:
  editor_context   Get cursor position, surrounding code, and active file
  show_locations   Display code locations with AI explanations in the editor

Configuration:
  Neovim: cmd = { \"neocrush\" }
  Crush:  { \"lsp\": { \"command\": \"neocrush\" } }
  MCP:    { \"command\": \"neocrush\" }

Files:
  .crush/session               Session info (workspace root)
  $XDG_RUNTIME_DIR/neocrush/   Sockets (Linux)
  $TMPDIR/neocrush-$UID/       Sockets (macOS)";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log.clone());

    let result = if cli.daemon {
        neocrush_core::daemon::run().await
    } else {
        neocrush_core::launcher::run().await
    };

    if let Err(err) = result {
        error!("{err:#}");
        eprintln!("neocrush: {err:#}");
        std::process::exit(1);
    }
}

/// Sends logs to the file named by `--log` or `$NEOCRUSH_LOG`, falling back
/// to stderr. Stdout is never used: it belongs to the wire protocol.
fn init_logging(path: Option<PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = std::env::var("NEOCRUSH_LOG_FILTER")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let path = path.or_else(|| std::env::var("NEOCRUSH_LOG").ok().map(PathBuf::from));

    let Some(path) = path else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
    if let Err(err) = std::fs::create_dir_all(dir) {
        eprintln!("neocrush: cannot create log directory {}: {err}", dir.display());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "neocrush.log".to_string());

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    debug!(log = %path.display(), "logging to file");
    Some(guard)
}
