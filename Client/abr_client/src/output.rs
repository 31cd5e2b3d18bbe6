use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use abr_player::{PlayerCallback, PlayerEvent, SegmentDownloadRecord};
use tracing::{debug, info, warn};

/// Writes one JSON object per downloaded segment.
pub struct SegmentLog<W: Write + Send> {
    writer: Mutex<W>,
}

impl SegmentLog<BufWriter<File>> {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> SegmentLog<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn write(&self, record: &SegmentDownloadRecord) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().unwrap().flush()
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap()
    }
}

/// Routes player events to the log output and, when given, the segment log.
pub fn event_callback<W: Write + Send + 'static>(log: Option<Arc<SegmentLog<W>>>) -> PlayerCallback {
    Arc::new(move |event| match event {
        PlayerEvent::Segment(record) => {
            debug!(
                "{} segment {} at index {} ({} bps, buffer {} ms)",
                record.track, record.segment_number, record.representation_index, record.throughput_bps, record.buffer_level_ms
            );
            if let Some(log) = &log {
                if let Err(e) = log.write(&record) {
                    warn!("Failed to write segment record: {}", e);
                }
            }
        }
        PlayerEvent::StallPredicted {
            track,
            segment_number,
            estimated_finish_ms,
            buffer_ms,
        } => info!(
            "Stall predicted on {} segment {}: finish in {:.0} ms, buffer {:.0} ms",
            track, segment_number, estimated_finish_ms, buffer_ms
        ),
        PlayerEvent::Info(message) => info!("{}", message),
        PlayerEvent::Warning(message) => warn!("{}", message),
    })
}
