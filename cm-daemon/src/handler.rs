//! Bus request handling
//!
//! Requests reach the handler thread over a channel, each carrying its own reply
//! sender. The console adapter reads one JSON request per line from stdin and
//! writes one JSON response per line.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cm_core::{handle_request, NotificationSink, SharedCache};
use cm_protocol::{Request, Response};
use tracing::{debug, info, warn};

const RECV_TIMEOUT: Duration = Duration::from_millis(200);

pub struct BusRequest {
    pub request: Request,
    pub reply: Sender<Response>,
}

/// Serve requests until shutdown or until every sender is gone
pub fn run_handler(
    cache: SharedCache,
    sink: Arc<dyn NotificationSink>,
    requests: Receiver<BusRequest>,
    shutdown: Arc<AtomicBool>,
) {
    info!("Request handler started");
    while !shutdown.load(Ordering::SeqCst) {
        match requests.recv_timeout(RECV_TIMEOUT) {
            Ok(BusRequest { request, reply }) => {
                let response = handle_request(&cache, sink.as_ref(), request);
                if reply.send(response).is_err() {
                    debug!("Requester went away before the reply");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("Request handler stopped");
}

/// Forward JSON requests from `input` to the handler, writing each response to `output`
pub fn run_console(
    requests: &Sender<BusRequest>,
    input: impl BufRead,
    mut output: impl Write,
) -> anyhow::Result<()> {
    for line in input.lines() {
        let line = line.context("reading console input")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let (reply, response) = mpsc::channel();
                requests
                    .send(BusRequest { request, reply })
                    .context("request handler is not running")?;
                response.recv().context("request handler dropped the reply")?
            }
            Err(e) => {
                warn!("Malformed console request: {}", e);
                Response::error("invalid", format!("malformed request: {}", e))
            }
        };

        writeln!(output, "{}", serde_json::to_string(&response)?)?;
        output.flush()?;
    }
    Ok(())
}
