//! Streams backed by an external process writing media to its stdout.

use std::{
    io::{self, Read},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    buffer::RingBuffer,
    common::{PipeError, PipeResult},
    session::options::Options,
    stream::{Stream, StreamHandle},
};

const PUMP_CHUNK: usize = 8192;

/// How long to watch a fresh child for an immediate exit before trusting it.
const STARTUP_PROBE: Duration = Duration::from_millis(500);

/// Named parameter passed to the child, rendered as `--key` or
/// `--key value`.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Flag,
    Value(String),
}

pub struct SubprocessStream {
    options: Arc<Options>,
    command: String,
    params: Vec<(String, ParamValue)>,
    args: Vec<String>,
    prefix: String,
}

impl SubprocessStream {
    pub fn new(options: Arc<Options>, command: impl Into<String>) -> Self {
        Self {
            options,
            command: command.into(),
            params: Vec::new(),
            args: Vec::new(),
            prefix: "--".into(),
        }
    }

    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.params.push((key.into(), ParamValue::Flag));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .push((key.into(), ParamValue::Value(value.into())));
        self
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// The argv this stream will spawn, command included.
    pub fn cmdline(&self) -> Vec<String> {
        let mut argv = vec![self.command.clone()];
        for (key, value) in &self.params {
            argv.push(format!("{}{key}", self.prefix));
            if let ParamValue::Value(v) = value {
                argv.push(v.clone());
            }
        }
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Whether the executable's `--help` output mentions the given flag.
    /// Used to probe optional features before passing them on the cmdline.
    pub fn supports_flag(command: &str, flag: &str) -> bool {
        let output = Command::new(command)
            .arg("--help")
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(out) => {
                let text = String::from_utf8_lossy(&out.stdout).into_owned()
                    + &String::from_utf8_lossy(&out.stderr);
                text.contains(flag)
            }
            Err(_) => false,
        }
    }
}

impl Stream for SubprocessStream {
    fn stream_type(&self) -> &'static str {
        "subprocess"
    }

    fn url(&self) -> Option<String> {
        None
    }

    fn open(&self) -> PipeResult<Box<dyn StreamHandle>> {
        let argv = self.cmdline();
        debug!("Spawning {argv:?}");
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PipeError::stream(format!("Failed to spawn {}: {e}", self.command)))?;

        // Catch immediate failures (bad arguments, missing input) before
        // handing out a reader that would only ever see EOF.
        thread::sleep(STARTUP_PROBE);
        if let Ok(Some(status)) = child.try_wait() {
            return Err(PipeError::stream(format!(
                "{} exited prematurely ({status})",
                self.command
            )));
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipeError::stream("Child stdout missing"))?;

        let buffer = Arc::new(RingBuffer::new(
            self.options.get_u64("ringbuffer-size").unwrap_or(16 * 1024 * 1024) as usize,
        ));
        let pump_buffer = buffer.clone();
        let pump = thread::spawn(move || {
            let mut chunk = vec![0u8; PUMP_CHUNK];
            loop {
                match stdout.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if pump_buffer.write(&chunk[..n]) < n {
                            break;
                        }
                    }
                }
            }
            pump_buffer.close();
        });

        Ok(Box::new(SubprocessHandle {
            child,
            buffer,
            pump: Some(pump),
            read_timeout: Duration::from_secs_f64(
                self.options.get_f64("stream-timeout").unwrap_or(60.0),
            ),
        }))
    }
}

pub struct SubprocessHandle {
    child: Child,
    buffer: Arc<RingBuffer>,
    pump: Option<thread::JoinHandle<()>>,
    read_timeout: Duration,
}

impl Read for SubprocessHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.buffer.read(buf.len(), true, Some(self.read_timeout)) {
            Ok(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Read timeout, stream stalled",
            )),
        }
    }
}

impl StreamHandle for SubprocessHandle {
    fn close(&mut self) {
        self.buffer.close();
        if let Err(err) = self.child.kill() {
            // Already exited is fine.
            debug!("Failed to kill child: {err}");
        }
        let _ = self.child.wait();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

impl Drop for SubprocessHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// rtmpdump

/// RTMP stream delivered by an external rtmpdump process.
pub struct RtmpStream {
    inner: SubprocessStream,
    url: String,
}

impl RtmpStream {
    pub fn new(
        options: Arc<Options>,
        url: impl Into<String>,
        params: Vec<(String, ParamValue)>,
    ) -> Self {
        let url = url.into();
        let command = options
            .get_str("rtmp-rtmpdump")
            .unwrap_or_else(|| "rtmpdump".to_string());
        let mut inner = SubprocessStream::new(options, command)
            .param("rtmp", url.clone())
            .param("flv", "-");
        for (key, value) in params {
            inner.params.push((key, value));
        }
        Self { inner, url }
    }

    /// Ask for resumable downloads when the installed rtmpdump supports it.
    pub fn with_resume(mut self) -> Self {
        if SubprocessStream::supports_flag(&self.inner.command, "--resume") {
            self.inner = self.inner.flag("resume");
        } else {
            warn!("Installed rtmpdump does not support resuming");
        }
        self
    }
}

impl Stream for RtmpStream {
    fn stream_type(&self) -> &'static str {
        "rtmp"
    }

    fn url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn open(&self) -> PipeResult<Box<dyn StreamHandle>> {
        self.inner.open()
    }
}
