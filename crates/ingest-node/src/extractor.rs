//! ffmpeg frame extraction: spawns the demuxer subprocess and splits its
//! MJPEG stdout stream into individual JPEG frames.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Hard cap on a single JPEG frame.
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;
/// Startup tolerance for the first frame: 50 polls x 100 ms = 5 s.
const STARTUP_RETRIES: u32 = 50;
const STARTUP_POLL: Duration = Duration::from_millis(100);
const STDOUT_BUFFER: usize = 512 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("spawn ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("jpeg frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("no frames received from ffmpeg (waited {0:.1}s)")]
    NoFrames(f64),
    #[error("frame sink: {0}")]
    Sink(#[source] anyhow::Error),
    #[error("read frames: {0}")]
    Io(#[source] std::io::Error),
    #[error("extraction cancelled")]
    Cancelled,
}

/// Receives each complete JPEG frame. An error fails the current
/// extraction attempt and triggers the manager's retry policy.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn on_frame(&self, frame: Vec<u8>) -> anyhow::Result<()>;
}

/// One extraction attempt against a source URL. Blocks until clean EOF,
/// error, or cancellation.
#[async_trait]
pub trait StreamExtractor: Send + Sync {
    async fn run(
        &self,
        token: CancellationToken,
        url: &str,
        fps: i32,
        width: u32,
        sink: &dyn FrameSink,
    ) -> Result<(), ExtractError>;
}

pub struct FfmpegExtractor {
    program: String,
}

impl FfmpegExtractor {
    pub fn new() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamExtractor for FfmpegExtractor {
    async fn run(
        &self,
        token: CancellationToken,
        url: &str,
        fps: i32,
        width: u32,
        sink: &dyn FrameSink,
    ) -> Result<(), ExtractError> {
        let args = build_args(url, fps, width);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExtractError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractError::Io(std::io::Error::other("ffmpeg stdout not captured")))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(output = %line, "ffmpeg stderr");
                }
            });
        }

        let result = tokio::select! {
            _ = token.cancelled() => Err(ExtractError::Cancelled),
            res = read_jpeg_frames(stdout, sink) => res,
        };

        match result {
            Ok(()) => {
                let _ = child.wait().await;
                Ok(())
            }
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }
}

/// ffmpeg argument set with protocol-aware connection knobs.
fn build_args(url: &str, fps: i32, width: u32) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        args.extend([
            "-rtsp_transport".into(),
            "tcp".into(),
            // microseconds
            "-stimeout".into(),
            "5000000".into(),
            "-timeout".into(),
            "5000000".into(),
        ]);
    } else if url.starts_with("http://") || url.starts_with("https://") {
        args.extend([
            "-reconnect".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "5".into(),
            "-timeout".into(),
            "10000000".into(),
        ]);
    }

    args.extend([
        "-i".into(),
        url.to_string(),
        "-vf".into(),
        format!("fps={fps},scale={width}:-1"),
        "-f".into(),
        "image2pipe".into(),
        "-vcodec".into(),
        "mjpeg".into(),
        "-q:v".into(),
        "5".into(),
        "pipe:1".into(),
    ]);

    args
}

/// Split a stream of concatenated JPEGs into frames and feed the sink.
///
/// An empty stdout is tolerated during startup (ffmpeg still connecting)
/// for up to 5 s; once the first frame has been emitted, EOF is a clean
/// end-of-stream — even mid-frame, since a truncated tail frame cannot
/// be decoded anyway.
pub(crate) async fn read_jpeg_frames<R: AsyncRead + Unpin>(
    reader: R,
    sink: &dyn FrameSink,
) -> Result<(), ExtractError> {
    let mut reader = BufReader::with_capacity(STDOUT_BUFFER, reader);
    let mut frames_read: u64 = 0;
    let mut startup_retries: u32 = 0;

    loop {
        match find_jpeg_start(&mut reader).await.map_err(ExtractError::Io)? {
            true => {}
            false => {
                // EOF before a start-of-image marker
                if frames_read > 0 {
                    return Ok(());
                }
                if startup_retries < STARTUP_RETRIES {
                    startup_retries += 1;
                    tokio::time::sleep(STARTUP_POLL).await;
                    continue;
                }
                return Err(ExtractError::NoFrames(startup_retries as f64 * 0.1));
            }
        }

        match read_until_jpeg_end(&mut reader).await? {
            Some(frame) => {
                frames_read += 1;
                sink.on_frame(frame).await.map_err(ExtractError::Sink)?;
            }
            None => {
                // EOF inside a frame
                if frames_read > 0 {
                    return Ok(());
                }
                return Err(ExtractError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof inside jpeg frame",
                )));
            }
        }
    }
}

/// Advance past the next `FF D8` start-of-image marker.
/// Ok(false) means EOF was reached first.
async fn find_jpeg_start<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<bool> {
    loop {
        let Some(b) = read_byte(r).await? else {
            return Ok(false);
        };
        if b != 0xFF {
            continue;
        }
        match read_byte(r).await? {
            Some(0xD8) => return Ok(true),
            Some(_) => continue,
            None => return Ok(false),
        }
    }
}

/// Accumulate bytes through the `FF D9` end-of-image marker.
/// Ok(None) means EOF inside the frame.
async fn read_until_jpeg_end<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<Vec<u8>>, ExtractError> {
    let mut data = vec![0xFF, 0xD8];

    loop {
        let Some(b) = read_byte(r).await.map_err(ExtractError::Io)? else {
            return Ok(None);
        };
        data.push(b);

        if b == 0xFF {
            let Some(next) = read_byte(r).await.map_err(ExtractError::Io)? else {
                return Ok(None);
            };
            data.push(next);
            if next == 0xD9 {
                return Ok(Some(data));
            }
        }

        if data.len() > MAX_FRAME_BYTES {
            return Err(ExtractError::FrameTooLarge(data.len()));
        }
    }
}

async fn read_byte<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match r.read(&mut buf).await? {
        0 => Ok(None),
        _ => Ok(Some(buf[0])),
    }
}
