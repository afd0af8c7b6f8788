use crate::{config::OperationalMode, error::Result, system::CommandRunner};
use bytes::Bytes;
use futures_util::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use std::sync::Arc;
use tracing::{info, warn};

pub const PLACEHOLDER: &str = "No data in simulated mode";

/// Stream of server-push frames, one per log line.
pub type EventStream = BoxStream<'static, Bytes>;

/// Frames one line as a server-push event.
pub fn frame(line: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", line))
}

/// Relays `journalctl -f` to a browser as `text/event-stream` frames.
#[derive(Clone)]
pub struct LogRelay {
    mode: OperationalMode,
    runner: Arc<dyn CommandRunner>,
}

impl LogRelay {
    pub fn new(mode: OperationalMode, runner: Arc<dyn CommandRunner>) -> Self {
        Self { mode, runner }
    }

    /// Each call starts its own tail process, killed when the stream drops.
    /// Frames are never dropped or bounded; a slow reader lets them queue in
    /// the transport.
    pub fn open(&self) -> Result<EventStream> {
        if !self.mode.is_live() {
            info!("No journal data in simulated mode");
            return Ok(stream::once(future::ready(frame(PLACEHOLDER))).boxed());
        }

        let lines = self.runner.stream_lines("journalctl", &["-f"])?;
        let frames = lines.scan((), |_, line| {
            future::ready(match line {
                Ok(line) => Some(frame(&line)),
                Err(e) => {
                    warn!("Journal stream ended on read error: {}", e);
                    None
                }
            })
        });
        Ok(frames.boxed())
    }
}
