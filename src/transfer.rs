use tokio::sync::mpsc;
use tracing::info;

/// Block size used for binary transfers unless configured otherwise
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Progress snapshot emitted when a transfer crosses a new percentage point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub name: String,
    pub bytes_written: u64,
    pub total_size: u64,
    pub percent: u8,
}

/// Receiver of progress notifications
pub trait ProgressSink: Send {
    fn on_progress(&mut self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressUpdate) + Send,
{
    fn on_progress(&mut self, update: &ProgressUpdate) {
        self(update)
    }
}

/// Discards every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&mut self, _update: &ProgressUpdate) {}
}

/// Logs `name @ [NN%]` lines at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_progress(&mut self, update: &ProgressUpdate) {
        info!("{} @ [{}%]", update.name, update.percent);
    }
}

/// Forwards updates to an async consumer; a closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelProgress(pub mpsc::UnboundedSender<ProgressUpdate>);

impl ProgressSink for ChannelProgress {
    fn on_progress(&mut self, update: &ProgressUpdate) {
        let _ = self.0.send(update.clone());
    }
}

/// Byte accounting for one file transfer.
///
/// Notifications are throttled to percentage changes, so a transfer emits
/// at most 101 of them however many blocks it is split into.
pub struct TransferProgress<'a> {
    name: String,
    bytes_written: u64,
    total_size: u64,
    last_percent: Option<u8>,
    sink: &'a mut dyn ProgressSink,
}

impl<'a> TransferProgress<'a> {
    pub fn new(name: impl Into<String>, total_size: u64, sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            name: name.into(),
            bytes_written: 0,
            total_size,
            last_percent: None,
            sink,
        }
    }

    /// Account for one block of `len` bytes.
    pub fn record(&mut self, len: usize) {
        self.bytes_written += len as u64;
        let percent = self.percent();
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            self.sink.on_progress(&ProgressUpdate {
                name: self.name.clone(),
                bytes_written: self.bytes_written,
                total_size: self.total_size,
                percent,
            });
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total_size == 0 {
            return 100;
        }
        let ratio = (self.bytes_written as u128 * 100) / self.total_size as u128;
        ratio.min(100) as u8
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(total: u64, blocks: &[usize]) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut sink = |u: &ProgressUpdate| seen.push(u.percent);
        {
            let mut progress = TransferProgress::new("file.bin", total, &mut sink);
            for block in blocks {
                progress.record(*block);
            }
        }
        seen
    }

    #[test]
    fn test_emits_only_on_percentage_change() {
        // 1000 blocks of 1 byte over 1000 bytes: one emission per whole percent
        let percents = collect(1000, &[1; 1000]);
        assert_eq!(percents.len(), 101);
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_zero_total_is_complete() {
        assert_eq!(collect(0, &[0]), vec![100]);
        assert_eq!(collect(0, &[10, 10]), vec![100]);
    }

    #[test]
    fn test_overshoot_is_capped() {
        let percents = collect(100, &[8192, 8192]);
        assert_eq!(percents, vec![100]);
    }

    #[test]
    fn test_floor_rounding() {
        let percents = collect(3, &[1, 1, 1]);
        assert_eq!(percents, vec![33, 66, 100]);
    }

    #[test]
    fn test_bounded_emissions_for_many_blocks() {
        let percents = collect(1_000_000, &vec![1; 1_000_000]);
        assert!(percents.len() <= 101);
    }

    #[test]
    fn test_channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tx = ChannelProgress(tx);
        {
            let mut progress = TransferProgress::new("a", 2, &mut tx);
            progress.record(1);
            progress.record(1);
        }
        assert_eq!(rx.try_recv().unwrap().percent, 50);
        assert_eq!(rx.try_recv().unwrap().percent, 100);
    }
}
