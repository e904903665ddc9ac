//! Item persistence: the record-writer capability and the CSV sink

use std::fs::File;
use std::path::Path;

use tracing::warn;

use crate::error::Result;
use crate::item::SaveableItem;
use crate::stats::StatsRegistry;

/// Capability for appending item records somewhere durable
pub trait RecordWriter: Send {
    fn write(&mut self, record: &[String]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// CSV file sink. The output file is truncated when the sink opens and every
/// write is flushed through to disk.
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Open `path` for writing. Names without a `.csv` suffix are refused
    /// with a warning and `None` is returned, leaving the engine sinkless.
    pub fn open(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            warn!(
                "Output file {} does not end in .csv, refusing to write items",
                path.display()
            );
            return Ok(None);
        }

        let file = File::create(path)?;
        Ok(Some(Self {
            writer: csv::Writer::from_writer(file),
        }))
    }
}

impl RecordWriter for CsvSink {
    fn write(&mut self, record: &[String]) -> Result<()> {
        self.writer.write_record(record)?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Validate an item and, if it passes, count it as saved and hand it to the
/// record writer. With no writer configured this is a no-op; the Redis
/// extension counts the items it persists itself.
pub fn save_item(
    item: &dyn SaveableItem,
    writer: Option<&mut dyn RecordWriter>,
    stats: &StatsRegistry,
) {
    if !item.validate() {
        warn!("Item is not valid. Skipping...");
        return;
    }

    let Some(writer) = writer else {
        return;
    };

    stats.incr_saved(item.scraper_name());
    if let Err(err) = writer.write(&item.record_fields()) {
        warn!("Failed to write item record: {}", err);
    }
}
