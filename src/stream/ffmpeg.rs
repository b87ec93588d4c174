//! FFmpeg-based muxing of separate audio/video substreams.
//!
//! Substream bytes are pumped into named pipes; FFmpeg reads them as inputs
//! and writes the muxed container to its stdout, which backs the handle's
//! `Read`. Codecs are always copied, never transcoded.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};

use dashmap::DashMap;
use rand::Rng;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::{
    common::{PipeError, PipeResult},
    session::options::Options,
    stream::{Stream, StreamHandle, segmented::CloseSignal},
};

const PUMP_CHUNK: usize = 8192;

/// Grace period between SIGTERM and SIGKILL on close.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Availability probing

pub struct FfmpegMuxer;

impl FfmpegMuxer {
    pub fn command(options: &Options) -> String {
        options
            .get_str("ffmpeg-ffmpeg")
            .unwrap_or_else(|| "ffmpeg".to_string())
    }

    /// Whether muxing can be used: not disabled via `mux-subprocess`, and the
    /// configured FFmpeg executable actually runs. Probe results are cached
    /// per executable path.
    pub fn is_available(options: &Options) -> bool {
        if !options.get_bool("mux-subprocess") {
            return false;
        }
        static PROBES: OnceLock<DashMap<String, bool>> = OnceLock::new();
        let probes = PROBES.get_or_init(DashMap::new);
        let command = Self::command(options);
        if let Some(cached) = probes.get(&command) {
            return *cached;
        }
        let available = Command::new(&command)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !available {
            debug!("FFmpeg executable {command:?} not usable, muxing disabled");
        }
        probes.insert(command, available);
        available
    }
}

// ---------------------------------------------------------------------------
// Named pipes

/// A FIFO in a private temp directory, removed on drop.
struct NamedPipe {
    path: PathBuf,
    dir: PathBuf,
}

impl NamedPipe {
    fn create(index: usize) -> std::io::Result<Self> {
        let mut rng = rand::thread_rng();
        let dir = std::env::temp_dir().join(format!(
            "streampipe-{}-{:08x}",
            std::process::id(),
            rng.r#gen::<u32>()
        ));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("mux-{index}"));
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        // Owner-only FIFO.
        let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { path, dir })
    }

    /// Blocks until the reading side (FFmpeg) opens the FIFO.
    fn open_write(&self) -> std::io::Result<File> {
        OpenOptions::new().write(true).open(&self.path)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

// ---------------------------------------------------------------------------
// Muxed stream

/// Combines substreams into one container. The first substream carries the
/// video; any further substreams contribute audio tracks.
pub struct MuxedStream {
    options: Arc<Options>,
    substreams: Vec<Box<dyn Stream>>,
}

impl MuxedStream {
    pub fn new(options: Arc<Options>, substreams: Vec<Box<dyn Stream>>) -> Self {
        Self {
            options,
            substreams,
        }
    }
}

impl Stream for MuxedStream {
    fn stream_type(&self) -> &'static str {
        "muxed"
    }

    fn url(&self) -> Option<String> {
        self.substreams.first().and_then(|s| s.url())
    }

    fn open(&self) -> PipeResult<Box<dyn StreamHandle>> {
        if self.substreams.is_empty() {
            return Err(PipeError::stream("Cannot mux zero substreams"));
        }
        let mut handles = Vec::with_capacity(self.substreams.len());
        for sub in &self.substreams {
            handles.push(sub.open()?);
        }

        let mut pipes = Vec::with_capacity(handles.len());
        for i in 0..handles.len() {
            pipes.push(
                NamedPipe::create(i)
                    .map_err(|e| PipeError::stream(format!("Failed to create FIFO: {e}")))?,
            );
        }

        let format = self
            .options
            .get_str("ffmpeg-fout")
            .unwrap_or_else(|| "matroska".to_string());
        let verbose = self.options.get_bool("ffmpeg-verbose");
        let verbose_path = self.options.get_str("ffmpeg-verbose-path");

        let mut command = Command::new(FfmpegMuxer::command(&self.options));
        command.arg("-y").arg("-nostats");
        for pipe in &pipes {
            command.arg("-i").arg(pipe.path());
        }
        // Input 0 contributes video and any muxed-in audio; the remaining
        // inputs contribute audio only.
        command.args(["-map", "0:v?", "-map", "0:a?"]);
        for i in 1..pipes.len() {
            command.arg("-map").arg(format!("{i}:a"));
        }
        command.args(["-c:v", "copy", "-c:a", "copy", "-f", &format, "pipe:1"]);
        let stderr = match &verbose_path {
            Some(path) => {
                let log = File::create(path)
                    .map_err(|e| PipeError::stream(format!("Failed to open {path}: {e}")))?;
                Stdio::from(log)
            }
            None if verbose => Stdio::inherit(),
            None => Stdio::null(),
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr);

        debug!("Spawning {command:?}");
        let mut child = command
            .spawn()
            .map_err(|e| PipeError::stream(format!("Failed to spawn FFmpeg: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipeError::stream("FFmpeg stdout missing"))?;

        let closer = CloseSignal::new();
        let mut pumps = Vec::new();
        for (pipe, mut handle) in pipes.into_iter().zip(handles) {
            let closer = closer.clone();
            pumps.push(thread::spawn(move || {
                // Opening the write side blocks until FFmpeg opens the FIFO
                // for reading.
                let Ok(mut sink) = pipe.open_write() else {
                    handle.close();
                    return;
                };
                let mut chunk = vec![0u8; PUMP_CHUNK];
                loop {
                    if closer.is_closed() {
                        break;
                    }
                    match handle.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sink.write_all(&chunk[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
                handle.close();
            }));
        }

        Ok(Box::new(MuxedHandle {
            child,
            stdout,
            closer,
            pumps,
        }))
    }
}

pub struct MuxedHandle {
    child: Child,
    stdout: ChildStdout,
    closer: CloseSignal,
    pumps: Vec<thread::JoinHandle<()>>,
}

impl Read for MuxedHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl StreamHandle for MuxedHandle {
    fn close(&mut self) {
        self.closer.close();
        // Ask FFmpeg to finish the container, then force it.
        let pid = self.child.id() as libc::pid_t;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        let deadline = std::time::Instant::now() + TERMINATE_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(50));
                }
                _ => {
                    if let Err(err) = self.child.kill() {
                        warn!("Failed to kill FFmpeg: {err}");
                    }
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
    }
}

impl Drop for MuxedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_pipe_create_and_cleanup() {
        let pipe = NamedPipe::create(0).unwrap();
        let path = pipe.path().to_path_buf();
        let dir = path.parent().unwrap().to_path_buf();
        assert!(path.exists());
        drop(pipe);
        assert!(!path.exists());
        assert!(!dir.exists());
    }

    #[test]
    fn fifo_roundtrip() {
        let pipe = NamedPipe::create(0).unwrap();
        let path = pipe.path().to_path_buf();
        let reader = thread::spawn(move || {
            let mut file = File::open(path).unwrap();
            let mut out = Vec::new();
            file.read_to_end(&mut out).unwrap();
            out
        });
        let mut writer = pipe.open_write().unwrap();
        writer.write_all(b"interleaved media").unwrap();
        drop(writer);
        assert_eq!(reader.join().unwrap(), b"interleaved media");
    }

    #[test]
    fn muxer_disabled_by_option() {
        let options = Options::new();
        options.set("mux-subprocess", serde_json::json!(false));
        assert!(!FfmpegMuxer::is_available(&options));
    }
}
