use crate::models::TelegramBlock;
use log::debug;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

/// A telegram starts with the hexdump followed by a gap of ten spaces
pub const BLOCK_MARKER: &str = "          ";

/// Shortest poll timeout and cycle, shorter ones are raised to this
pub const MIN_WAIT: Duration = Duration::from_secs(1);

pub fn is_block_start(line: &str) -> bool {
    line.contains(BLOCK_MARKER)
}

/// Groups raw lines into telegram blocks.
///
/// Blocks are handed out per cycle. A cycle ends after `cycle_limit`, or
/// when the line queue closed; the lines gathered so far are then flushed
/// and the following call returns `None` so the caller gets a chance to
/// look after the process. Whenever no line arrives within `poll_timeout`
/// the pending lines are flushed as well, even if there are none.
pub struct TelegramFramer {
    poll_timeout: Duration,
    cycle_limit: Duration,
    pending: Vec<String>,
    cycle_start: Option<Instant>,
    cycle_done: bool,
    closed: bool,
}

impl TelegramFramer {
    pub fn new(poll_timeout: Duration, cycle_limit: Duration) -> Self {
        TelegramFramer {
            poll_timeout: poll_timeout.max(MIN_WAIT),
            cycle_limit: cycle_limit.max(MIN_WAIT),
            pending: Vec::new(),
            cycle_start: None,
            cycle_done: false,
            closed: false,
        }
    }

    /// The line queue was closed by its producer
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn take_pending(&mut self) -> TelegramBlock {
        TelegramBlock::new(std::mem::take(&mut self.pending))
    }

    /// Next block of the running cycle, `None` once the cycle is over
    pub async fn next_block(&mut self, lines: &mut UnboundedReceiver<String>) -> Option<TelegramBlock> {
        if self.cycle_done {
            self.cycle_done = false;
            self.cycle_start = None;
            return None;
        }

        let started = *self.cycle_start.get_or_insert_with(Instant::now);
        loop {
            if self.closed || started.elapsed() >= self.cycle_limit {
                self.cycle_done = true;
                return Some(self.take_pending());
            }

            match timeout(self.poll_timeout, lines.recv()).await {
                Ok(Some(line)) => {
                    if is_block_start(&line) && !self.pending.is_empty() {
                        let block = self.take_pending();
                        self.pending.push(line);
                        return Some(block);
                    }
                    self.pending.push(line);
                }
                Ok(None) => {
                    debug!("line queue closed");
                    self.closed = true;
                }
                Err(_) => return Some(self.take_pending()),
            }
        }
    }

    /// Every block of one cycle, the final flush included
    pub async fn read_cycle(&mut self, lines: &mut UnboundedReceiver<String>) -> Vec<TelegramBlock> {
        let mut blocks = Vec::new();
        while let Some(block) = self.next_block(lines).await {
            blocks.push(block);
        }
        blocks
    }
}
