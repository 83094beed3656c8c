//! Background listener that turns operator input into abort requests.

use std::io::BufRead;
use std::thread::{self, JoinHandle};

use power_core::orchestrator::AbortHandle;
use tracing::{debug, warn};

/// Reason reported when the operator gives none.
pub const DEFAULT_ABORT_REASON: &str = "Aborted by operator";

/// Parses an operator line. `abort` or `abort <reason>` requests an abort.
pub fn parse_abort(line: &str) -> Option<String> {
    let line = line.trim();
    let (command, reason) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if !command.eq_ignore_ascii_case("abort") {
        return None;
    }
    let reason = reason.trim();
    Some(if reason.is_empty() {
        DEFAULT_ABORT_REASON.to_string()
    } else {
        reason.to_string()
    })
}

/// Spawns a thread that reads `input` line by line and forwards the first
/// abort request to `handle`. The thread ends at end of input, on a read
/// error, or once an abort was delivered.
pub fn spawn_listener<R>(input: R, handle: AbortHandle) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("abort-listener".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(error) => {
                        warn!(%error, "abort listener stopped");
                        return;
                    }
                };
                if let Some(reason) = parse_abort(&line) {
                    debug!(%reason, "abort requested");
                    handle.abort(reason);
                    return;
                }
            }
        })
}
