//! TS file input: plays a recorded transport stream in a loop.
//!
//! Selected with `msys=file&uri=/path/to/recording.ts`. Mostly used for
//! bench setups and tests; it needs no PID filtering because the file
//! already is the wanted stream.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, SatipError};
use crate::input::{InputSystem, TunerSource};
use crate::mpegts::PacketBuffer;
use crate::protocol::SatipQuery;

/// Pacing delay per buffer; keeps a looping file from busy-spinning the
/// reader thread.
const READ_PACING: Duration = Duration::from_millis(2);

#[derive(Default)]
struct Inner {
    path: Option<PathBuf>,
    file: Option<File>,
}

/// A looping TS file player behind the [`TunerSource`] contract.
pub struct FileSource {
    stream_id: usize,
    inner: Mutex<Inner>,
}

impl FileSource {
    pub fn new(stream_id: usize) -> Self {
        FileSource {
            stream_id,
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl TunerSource for FileSource {
    fn stream_id(&self) -> usize {
        self.stream_id
    }

    fn capable_of(&self, system: InputSystem) -> bool {
        system == InputSystem::File
    }

    fn parse_stream_parameters(&self, query: &SatipQuery) -> Result<()> {
        if let Some(uri) = query.get("uri") {
            let mut inner = self.inner.lock();
            inner.path = Some(PathBuf::from(uri));
            inner.file = None;
        }
        Ok(())
    }

    fn update(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_some() {
            return Ok(());
        }
        let path = inner
            .path
            .clone()
            .ok_or_else(|| SatipError::Tuner("file input without uri".to_string()))?;
        let file = File::open(&path)
            .map_err(|e| SatipError::Tuner(format!("open {} failed: {e}", path.display())))?;
        tracing::info!(stream = self.stream_id, path = %path.display(), "file input opened");
        inner.file = Some(file);
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file = None;
        Ok(())
    }

    fn is_data_available(&self) -> bool {
        let open = self.inner.lock().file.is_some();
        if open {
            thread::sleep(READ_PACING);
        }
        open
    }

    fn read_full_ts_packet(&self, buffer: &mut PacketBuffer) -> bool {
        let mut inner = self.inner.lock();
        let Some(file) = inner.file.as_mut() else {
            return false;
        };
        while !buffer.full() {
            match file.read(buffer.free_space()) {
                Ok(0) => {
                    // loop the recording
                    if file.seek(SeekFrom::Start(0)).is_err() {
                        return false;
                    }
                }
                Ok(n) => buffer.add_written(n),
                Err(e) => {
                    tracing::error!(stream = self.stream_id, error = %e, "file read failed");
                    return false;
                }
            }
        }
        buffer.try_syncing();
        buffer.full()
    }

    fn attribute_describe_string(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner.file.as_ref()?;
        let path = inner.path.as_ref()?;
        Some(format!(
            "ver=1.5;tuner={};file={}",
            self.stream_id + 1,
            path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpegts::TS_PACKET_SIZE;
    use std::io::Write;

    fn write_ts_file(packets: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!("satip-file-input-{packets}.ts"));
        let mut file = File::create(&path).unwrap();
        for i in 0..packets {
            let mut pkt = [0u8; TS_PACKET_SIZE];
            pkt[0] = 0x47;
            pkt[1] = 0x01;
            pkt[2] = 0x00;
            pkt[3] = 0x10 | (i as u8 & 0x0F);
            file.write_all(&pkt).unwrap();
        }
        path
    }

    #[test]
    fn loops_file_into_full_buffers() {
        // 3 packets on disk, the loop must still fill 7-packet buffers
        let path = write_ts_file(3);
        let source = FileSource::new(0);
        let uri = format!("rtsp://h/?msys=file&uri={}", path.display());
        source
            .parse_stream_parameters(&SatipQuery::from_uri(&uri))
            .unwrap();
        source.update().unwrap();

        let mut buffer = PacketBuffer::new();
        buffer.initialize(1, 0);
        assert!(source.read_full_ts_packet(&mut buffer));
        assert!(buffer.full());
        assert!(buffer.is_synced());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn update_without_uri_fails() {
        let source = FileSource::new(0);
        assert!(source.update().is_err());
    }

    #[test]
    fn describe_only_when_open() {
        let path = write_ts_file(1);
        let source = FileSource::new(2);
        assert!(source.attribute_describe_string().is_none());
        let uri = format!("rtsp://h/?msys=file&uri={}", path.display());
        source
            .parse_stream_parameters(&SatipQuery::from_uri(&uri))
            .unwrap();
        source.update().unwrap();
        let desc = source.attribute_describe_string().unwrap();
        assert!(desc.starts_with("ver=1.5;tuner=3;file="));
        let _ = std::fs::remove_file(path);
    }
}
