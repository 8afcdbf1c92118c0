//! Writes depacketized access units to disk, one file per access unit
//! (SPEC_FULL.md §6 "Frame sink").

use std::path::{Path, PathBuf};

use log::info;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::h264::depacketizer::AccessUnit;

/// Destination for emitted access units. A trait so the orchestrator's
/// receive loop doesn't care whether frames land on disk, in a test buffer,
/// or (conceivably) on a socket.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    async fn write(&mut self, unit: &AccessUnit) -> Result<()>;
}

/// Writes each access unit as `<output_dir>/<timestamp>.h264`, Annex B bytes
/// verbatim. The RTP timestamp, not wall-clock time, is the filename key —
/// it's what ties a frame back to the stream's own clock.
pub struct FileFrameSink {
    output_dir: PathBuf,
    dir_ready: bool,
}

impl FileFrameSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        FileFrameSink {
            output_dir: output_dir.into(),
            dir_ready: false,
        }
    }

    async fn ensure_dir(&mut self) -> Result<()> {
        if self.dir_ready {
            return Ok(());
        }
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| Error::TransportError(format!("create output dir {}: {e}", self.output_dir.display())))?;
        self.dir_ready = true;
        Ok(())
    }

    fn path_for(&self, unit: &AccessUnit) -> PathBuf {
        Path::new(&self.output_dir).join(format!("{}.h264", unit.timestamp))
    }
}

#[async_trait::async_trait]
impl FrameSink for FileFrameSink {
    async fn write(&mut self, unit: &AccessUnit) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.path_for(unit);
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| Error::TransportError(format!("create {}: {e}", path.display())))?;
        file.write_all(&unit.data)
            .await
            .map_err(|e| Error::TransportError(format!("write {}: {e}", path.display())))?;

        if unit.is_keyframe {
            info!("wrote keyframe {} ({} bytes)", path.display(), unit.data.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_access_unit_to_timestamped_file() {
        let dir = std::env::temp_dir().join(format!("rtsp-capture-rs-sink-test-{}", std::process::id()));
        let mut sink = FileFrameSink::new(&dir);
        let unit = AccessUnit {
            timestamp: 12345,
            data: vec![0, 0, 0, 1, 0x67, 0xAA],
            is_keyframe: true,
        };
        sink.write(&unit).await.unwrap();

        let path = dir.join("12345.h264");
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, unit.data);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
