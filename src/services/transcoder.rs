//! Audio transcoding through an external ffmpeg process.
//!
//! The source stream is fed to ffmpeg's stdin while its stdout is streamed
//! straight into the destination sink; nothing touches local disk. The
//! output stream is gated on the process outcome: after stdout closes, the
//! sink only sees a clean end of stream if the whole input was delivered and
//! ffmpeg exited successfully. Otherwise it receives an error and abandons
//! the upload.

use crate::models::object::ObjectInfo;
use crate::services::storage::{ByteStream, ObjectSink, StorageError};
use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{ChildStderr, ChildStdin, ChildStdout, Command},
    sync::oneshot,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Bytes of ffmpeg's stderr kept for error reports.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Flac,
}

impl AudioFormat {
    /// ffmpeg muxer name passed to `-f`.
    pub fn muxer(&self) -> &'static str {
        match self {
            AudioFormat::Flac => "flac",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Flac => "audio/flac",
        }
    }
}

/// Output parameters of a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeSettings {
    pub channels: u16,
    pub sample_rate: u32,
    pub format: AudioFormat,
}

impl TranscodeSettings {
    /// Mono, 16 kHz, FLAC.
    pub const MONO_16K_FLAC: TranscodeSettings = TranscodeSettings {
        channels: 1,
        sample_rate: 16_000,
        format: AudioFormat::Flac,
    };
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder `{program}` is not available: {source}")]
    Unavailable { program: String, source: io::Error },
    #[error("failed to run transcoder: {0}")]
    Spawn(#[source] io::Error),
    #[error("no output configured for transcode")]
    MissingOutput,
    #[error("reading source audio failed: {0}")]
    Input(#[source] io::Error),
    #[error("writing to transcoder failed: {0}")]
    Stdin(#[source] io::Error),
    #[error("transcoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("storing transcoded audio failed: {0}")]
    Output(#[source] StorageError),
}

/// Something that turns an encoded audio stream into another encoding and
/// hands the result to a storage sink.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Resolves once, after the output has been committed or the pipeline
    /// has failed.
    async fn transcode(
        &self,
        input: ByteStream,
        settings: TranscodeSettings,
        output: Box<dyn ObjectSink>,
    ) -> Result<ObjectInfo, TranscodeError>;

    /// Version banner, used to check the transcoder is runnable.
    async fn version(&self) -> Result<String, TranscodeError>;
}

#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Start building a command reading from `input`.
    pub fn command(&self, input: ByteStream) -> FfmpegCommand {
        FfmpegCommand::new(&self.program, input)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: ByteStream,
        settings: TranscodeSettings,
        output: Box<dyn ObjectSink>,
    ) -> Result<ObjectInfo, TranscodeError> {
        self.command(input)
            .audio_channels(settings.channels)
            .audio_frequency(settings.sample_rate)
            .format(settings.format)
            .output(output)
            .run()
            .await
    }

    async fn version(&self) -> Result<String, TranscodeError> {
        let out = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| spawn_error(&self.program, err))?;

        if !out.status.success() {
            return Err(TranscodeError::Failed {
                status: out.status.to_string(),
                stderr: tail(&out.stderr),
            });
        }

        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }
}

/// A single ffmpeg invocation: one input stream, one output sink.
pub struct FfmpegCommand {
    program: PathBuf,
    input: ByteStream,
    channels: Option<u16>,
    frequency: Option<u32>,
    format: Option<AudioFormat>,
    output: Option<Box<dyn ObjectSink>>,
}

impl FfmpegCommand {
    pub fn new(program: impl Into<PathBuf>, input: ByteStream) -> Self {
        Self {
            program: program.into(),
            input,
            channels: None,
            frequency: None,
            format: None,
            output: None,
        }
    }

    pub fn audio_channels(mut self, channels: u16) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn audio_frequency(mut self, hz: u32) -> Self {
        self.frequency = Some(hz);
        self
    }

    pub fn format(mut self, format: AudioFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn output(mut self, sink: Box<dyn ObjectSink>) -> Self {
        self.output = Some(sink);
        self
    }

    /// Command-line arguments, reading stdin and writing stdout.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostats", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(["-i".into(), "pipe:0".into(), "-vn".into()]);
        if let Some(channels) = self.channels {
            args.extend(["-ac".into(), channels.to_string()]);
        }
        if let Some(hz) = self.frequency {
            args.extend(["-ar".into(), hz.to_string()]);
        }
        if let Some(format) = self.format {
            args.extend(["-f".into(), format.muxer().into()]);
        }
        args.push("pipe:1".into());
        args
    }

    /// Run the pipeline to completion.
    ///
    /// Error precedence: a sink failure before ffmpeg's output ended is a
    /// storage error, then an input failure, then a non-zero ffmpeg exit.
    pub async fn run(self) -> Result<ObjectInfo, TranscodeError> {
        let args = self.args();
        let FfmpegCommand {
            program,
            input,
            output,
            ..
        } = self;
        let sink = output.ok_or(TranscodeError::MissingOutput)?;

        debug!(program = %program.display(), ?args, "starting transcoder");
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| spawn_error(&program, err))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(TranscodeError::Spawn(io::Error::other(
                "transcoder stdio was not captured",
            )));
        };

        let (verdict_tx, verdict_rx) = oneshot::channel();
        let output_ended = Arc::new(AtomicBool::new(false));
        let upload = sink.upload(gated_output(stdout, verdict_rx, output_ended.clone()));

        let supervise = async move {
            let fed = feed_stdin(input, stdin).await;
            if fed.is_err() {
                let _ = child.start_kill();
            }
            let status = child.wait().await;
            let ok = fed.is_ok() && status.as_ref().is_ok_and(ExitStatus::success);
            let _ = verdict_tx.send(ok);
            (fed, status)
        };

        let ((fed, status), uploaded, stderr) =
            tokio::join!(supervise, upload, collect_stderr(stderr));

        let uploaded = match uploaded {
            Err(err) if !output_ended.load(Ordering::SeqCst) => {
                return Err(TranscodeError::Output(err));
            }
            other => other,
        };
        match pipeline_failure(fed, status, stderr) {
            Some(err) => Err(err),
            None => uploaded.map_err(TranscodeError::Output),
        }
    }
}

/// First failure on the process side of the pipeline, if any.
fn pipeline_failure(
    fed: Result<u64, TranscodeError>,
    status: io::Result<ExitStatus>,
    stderr: String,
) -> Option<TranscodeError> {
    if let Err(err) = fed {
        return Some(err);
    }
    match status {
        Err(err) => Some(TranscodeError::Spawn(err)),
        Ok(status) if !status.success() => {
            warn!(%status, stderr = %stderr, "transcoder failed");
            Some(TranscodeError::Failed {
                status: status.to_string(),
                stderr,
            })
        }
        Ok(_) => None,
    }
}

/// Copy the source stream into ffmpeg's stdin, then close it.
///
/// ffmpeg may stop reading early (decode error, or it has all it needs);
/// a broken pipe ends feeding without error and the exit status decides.
async fn feed_stdin(mut input: ByteStream, mut stdin: ChildStdin) -> Result<u64, TranscodeError> {
    let mut fed: u64 = 0;
    while let Some(chunk) = input.next().await {
        let chunk = chunk.map_err(TranscodeError::Input)?;
        match stdin.write_all(&chunk).await {
            Ok(()) => fed += chunk.len() as u64,
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!("transcoder closed stdin after {} bytes", fed);
                return Ok(fed);
            }
            Err(err) => return Err(TranscodeError::Stdin(err)),
        }
    }
    match stdin.shutdown().await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
        Err(err) => return Err(TranscodeError::Stdin(err)),
    }
    debug!("fed {} bytes to transcoder", fed);
    Ok(fed)
}

/// ffmpeg's stdout followed by a terminal check on the process verdict.
fn gated_output(
    stdout: ChildStdout,
    verdict: oneshot::Receiver<bool>,
    output_ended: Arc<AtomicBool>,
) -> ByteStream {
    let gate = stream::once(async move {
        output_ended.store(true, Ordering::SeqCst);
        match verdict.await {
            Ok(true) => None,
            _ => Some(Err(io::Error::other(
                "transcoder did not complete successfully",
            ))),
        }
    })
    .filter_map(future::ready);

    ReaderStream::new(stdout).chain(gate).boxed()
}

async fn collect_stderr(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    if let Err(err) = stderr.read_to_end(&mut buf).await {
        debug!("reading transcoder stderr failed: {}", err);
    }
    tail(&buf)
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().rev().nth(STDERR_TAIL) {
        Some((idx, _)) => text[idx..].to_string(),
        None => text.to_string(),
    }
}

fn spawn_error(program: &Path, err: io::Error) -> TranscodeError {
    if err.kind() == io::ErrorKind::NotFound {
        TranscodeError::Unavailable {
            program: program.display().to_string(),
            source: err,
        }
    } else {
        TranscodeError::Spawn(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::{LocalObjectStore, ObjectStore};
    use bytes::Bytes;

    fn input_of(bytes: &'static [u8]) -> ByteStream {
        stream::iter(vec![Ok(Bytes::from_static(bytes))]).boxed()
    }

    async fn local_sink(
        dir: &tempfile::TempDir,
        key: &str,
    ) -> (LocalObjectStore, Box<dyn ObjectSink>) {
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        let store = LocalObjectStore::new(dir.path());
        let sink = store
            .bucket("uploads")
            .unwrap()
            .open_write(key, "audio/flac")
            .await
            .unwrap();
        (store, sink)
    }

    #[cfg(unix)]
    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn builds_mono_16k_flac_arguments() {
        let cmd = FfmpegTranscoder::new("ffmpeg")
            .command(input_of(b""))
            .audio_channels(1)
            .audio_frequency(16_000)
            .format(AudioFormat::Flac);

        let args = cmd.args();
        let joined = args.join(" ");
        assert!(joined.contains("-i pipe:0"));
        assert!(joined.contains("-ac 1"));
        assert!(joined.contains("-ar 16000"));
        assert!(joined.contains("-f flac"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn fixed_settings_are_mono_16k_flac() {
        let s = TranscodeSettings::MONO_16K_FLAC;
        assert_eq!((s.channels, s.sample_rate), (1, 16_000));
        assert_eq!(s.format.content_type(), "audio/flac");
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let long = "x".repeat(STDERR_TAIL * 3);
        assert_eq!(tail(long.as_bytes()).len(), STDERR_TAIL + 1);
        assert_eq!(tail(b"  short message \n"), "short message");
    }

    #[tokio::test]
    async fn missing_output_is_an_error() {
        let err = FfmpegTranscoder::new("ffmpeg")
            .command(input_of(b"abc"))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::MissingOutput));
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, sink) = local_sink(&dir, "out.flac").await;
        let transcoder = FfmpegTranscoder::new("/nonexistent/bin/ffmpeg-missing");

        let err = transcoder
            .transcode(input_of(b"abc"), TranscodeSettings::MONO_16K_FLAC, sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Unavailable { .. }));
        assert!(matches!(
            transcoder.version().await,
            Err(TranscodeError::Unavailable { .. })
        ));
        assert!(!dir.path().join("uploads/out.flac").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipes_input_through_process_into_sink() {
        let dir = tempfile::tempdir().unwrap();
        let fake = script(&dir, "fake-ffmpeg", "exec cat");
        let (_store, sink) = local_sink(&dir, "dir/clip_output.flac").await;

        let input = stream::iter(vec![
            Ok(Bytes::from_static(b"first-")),
            Ok(Bytes::from_static(b"second")),
        ])
        .boxed();
        let info = FfmpegTranscoder::new(&fake)
            .transcode(input, TranscodeSettings::MONO_16K_FLAC, sink)
            .await
            .unwrap();

        assert_eq!(info.size_bytes, 12);
        assert_eq!(
            std::fs::read(dir.path().join("uploads/dir/clip_output.flac")).unwrap(),
            b"first-second"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_failure_is_propagated_and_nothing_committed() {
        let dir = tempfile::tempdir().unwrap();
        let fake = script(
            &dir,
            "fake-ffmpeg",
            "cat >/dev/null\nprintf 'partial'\necho 'pipe:0: Invalid data found when processing input' >&2\nexit 1",
        );
        let (_store, sink) = local_sink(&dir, "out.flac").await;

        let err = FfmpegTranscoder::new(&fake)
            .transcode(input_of(b"not audio"), TranscodeSettings::MONO_16K_FLAC, sink)
            .await
            .unwrap_err();

        match err {
            TranscodeError::Failed { stderr, .. } => {
                assert!(stderr.contains("Invalid data found"), "{stderr}")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.path().join("uploads/out.flac").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exiting_without_reading_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fake = script(&dir, "fake-ffmpeg", "echo 'cannot start' >&2\nexit 3");
        let (_store, sink) = local_sink(&dir, "out.flac").await;

        let big: Vec<u8> = vec![0u8; 1 << 20];
        let input = stream::iter(vec![Ok(Bytes::from(big))]).boxed();
        let err = FfmpegTranscoder::new(&fake)
            .transcode(input, TranscodeSettings::MONO_16K_FLAC, sink)
            .await
            .unwrap_err();

        assert!(matches!(err, TranscodeError::Failed { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn input_failure_aborts_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let fake = script(&dir, "fake-ffmpeg", "exec cat");
        let (_store, sink) = local_sink(&dir, "out.flac").await;

        let input = stream::iter(vec![
            Ok(Bytes::from_static(b"some audio")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "source reset")),
        ])
        .boxed();
        let err = FfmpegTranscoder::new(&fake)
            .transcode(input, TranscodeSettings::MONO_16K_FLAC, sink)
            .await
            .unwrap_err();

        assert!(matches!(err, TranscodeError::Input(_)), "{err}");
        assert!(!dir.path().join("uploads/out.flac").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn version_reads_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let fake = script(&dir, "fake-ffmpeg", "echo 'ffmpeg version 6.1'\necho 'built with gcc'");
        let version = FfmpegTranscoder::new(&fake).version().await.unwrap();
        assert_eq!(version, "ffmpeg version 6.1");
    }

    fn ffmpeg_installed() -> bool {
        std::process::Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    /// Half a second of a stereo 44.1 kHz 16-bit sine as a WAV file.
    fn stereo_wav() -> Vec<u8> {
        let rate: u32 = 44_100;
        let channels: u16 = 2;
        let frames = rate / 2;
        let data_len = frames * u32::from(channels) * 2;

        let mut wav = Vec::with_capacity(44 + data_len as usize);
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&channels.to_le_bytes());
        wav.extend_from_slice(&rate.to_le_bytes());
        wav.extend_from_slice(&(rate * u32::from(channels) * 2).to_le_bytes());
        wav.extend_from_slice(&(channels * 2).to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        for n in 0..frames {
            let t = n as f32 / rate as f32;
            let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
            for _ in 0..channels {
                wav.extend_from_slice(&sample.to_le_bytes());
            }
        }
        wav
    }

    /// (sample rate, channels) from a FLAC stream's STREAMINFO block.
    fn flac_stream_info(flac: &[u8]) -> (u32, u8) {
        assert_eq!(&flac[..4], b"fLaC");
        assert_eq!(flac[4] & 0x7f, 0, "first metadata block must be STREAMINFO");
        let b = &flac[8..];
        let rate = (u32::from(b[10]) << 12) | (u32::from(b[11]) << 4) | (u32::from(b[12]) >> 4);
        let channels = ((b[12] >> 1) & 0x07) + 1;
        (rate, channels)
    }

    #[tokio::test]
    async fn real_ffmpeg_produces_mono_16k_flac() {
        if !ffmpeg_installed() {
            eprintln!("ffmpeg not installed; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (_store, sink) = local_sink(&dir, "dir/clip_output.flac").await;

        let input = stream::iter(vec![Ok(Bytes::from(stereo_wav()))]).boxed();
        FfmpegTranscoder::new("ffmpeg")
            .transcode(input, TranscodeSettings::MONO_16K_FLAC, sink)
            .await
            .unwrap();

        let flac = std::fs::read(dir.path().join("uploads/dir/clip_output.flac")).unwrap();
        assert_eq!(flac_stream_info(&flac), (16_000, 1));
    }
}
