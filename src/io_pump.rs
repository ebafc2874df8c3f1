//! Drains a [`ChildRunner`]'s combined output pipe into an [`OutputBuffer`].
//!
//! Ground truth: `examples/original_source/src/IOController.{h,cpp}`. The
//! malloc'd scratch buffer becomes a plain `Vec<u8>` reused across iterations.

use std::sync::Arc;

use log::info;

use crate::buffer::OutputBuffer;
use crate::child::ChildRunner;
use crate::error::{AppResult, SupervisorError};

const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Owns the background thread that copies child output into the ring buffer.
pub struct IoPump {
    chunk_size: usize,
    handle: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl IoPump {
    pub fn new(chunk_size: usize) -> Self {
        IoPump {
            chunk_size,
            handle: std::sync::Mutex::new(None),
        }
    }

    pub fn with_default_chunk_size() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }

    /// Starts the drain loop. Calling this twice is rejected, matching the
    /// original's `IllegalStateException` on double-`start`.
    pub fn start(&self, child: Arc<ChildRunner>, buffer: Arc<OutputBuffer>) -> AppResult<()> {
        let mut guard = self.handle.lock().expect("io pump mutex poisoned");
        if guard.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }
        let chunk_size = self.chunk_size;
        let join_handle = std::thread::Builder::new()
            .name("io-pump".to_string())
            .spawn(move || run(&child, &buffer, chunk_size))
            .map_err(SupervisorError::Io)?;
        *guard = Some(join_handle);
        info!("IOController started.");
        Ok(())
    }

    /// Blocks until the drain loop observes EOF (or a read error) and exits.
    pub fn join(&self) {
        let handle = self.handle.lock().expect("io pump mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        info!("IOController stopped.");
    }
}

fn run(child: &ChildRunner, buffer: &OutputBuffer, chunk_size: usize) {
    let mut scratch = vec![0u8; chunk_size];
    loop {
        match child.read_output(&mut scratch) {
            Ok(0) => break,
            Ok(n) => {
                if buffer.write(&scratch[..n]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ReadResult;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn pumps_child_output_into_buffer_and_stops_on_eof() {
        let child = Arc::new(
            ChildRunner::new(
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "echo pumped-bytes".to_string(),
                ],
                HashMap::new(),
                None,
                "test-program",
            )
            .unwrap(),
        );
        child.start().unwrap();

        let buffer = Arc::new(OutputBuffer::with_default_initial(1024));
        let pump = IoPump::with_default_chunk_size();
        pump.start(child.clone(), buffer.clone()).unwrap();
        pump.join();
        child.wait(None).unwrap();

        match buffer.read(0, 256, Some(Duration::from_millis(100))) {
            ReadResult::Data { data, .. } => assert_eq!(data, b"pumped-bytes\n"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn double_start_is_rejected() {
        let child = Arc::new(
            ChildRunner::new(
                vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 0.2".to_string()],
                HashMap::new(),
                None,
                "test-program",
            )
            .unwrap(),
        );
        child.start().unwrap();
        let buffer = Arc::new(OutputBuffer::with_default_initial(1024));
        let pump = IoPump::with_default_chunk_size();
        pump.start(child.clone(), buffer.clone()).unwrap();
        assert!(matches!(
            pump.start(child.clone(), buffer),
            Err(SupervisorError::AlreadyStarted)
        ));
        pump.join();
        child.wait(None).unwrap();
    }
}
