/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Supervision of the external media transcoder (ffmpeg).
//!
//! Each live stream owns exactly one child process. A single supervision
//! task per child multiplexes stdout bytes, stderr lines and the exit status
//! into one typed event stream, so downstream code never deals with process
//! plumbing. Children are never restarted here; the owner of the handle
//! decides what an exit means.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{AppConfig, ViewerConfig};
use crate::error::{Result, StreamError};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

/// Everything a transcoder child can tell us.
#[derive(Debug, Clone)]
pub enum TranscoderEvent {
    /// A chunk of the output byte stream (MJPEG, unframed).
    Bytes(Bytes),
    /// One stderr line; ffmpeg reports stream start and errors here.
    Stderr(String),
    /// The child is gone. Always the final event.
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Handle to one supervised child. Dropping the handle stops the child.
pub struct TranscoderHandle {
    events: mpsc::Receiver<TranscoderEvent>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl TranscoderHandle {
    pub fn new(events: mpsc::Receiver<TranscoderEvent>, stop_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            stop_tx: Some(stop_tx),
        }
    }

    /// Next event, or `None` once the supervisor has finished after `Exit`.
    pub async fn next_event(&mut self) -> Option<TranscoderEvent> {
        self.events.recv().await
    }

    /// Request a graceful stop: interrupt, then force-kill after the
    /// configured budget. Events keep flowing until `Exit`.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TranscoderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Seam between stream plumbing and the real ffmpeg binary. Tests plug in
/// scripted implementations.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Launch a continuous low-latency MJPEG pipe for the viewer path.
    async fn spawn_mjpeg(&self, source_url: &str) -> Result<TranscoderHandle>;

    /// Grab a single JPEG for the recognition path.
    async fn capture_still(&self, source_url: &str) -> Result<Vec<u8>>;
}

/// The production transcoder: spawns ffmpeg with the latency profile the
/// viewer path depends on.
pub struct FfmpegTranscoder {
    bin: String,
    viewer: ViewerConfig,
    start_timeout: Duration,
    still_timeout: Duration,
    kill_timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            bin: config.ffmpeg_bin.clone(),
            viewer: config.viewer.clone(),
            start_timeout: config.transcoder_start_timeout,
            still_timeout: config.transcoder_still_timeout,
            kill_timeout: config.transcoder_kill_timeout,
        }
    }

    fn spawn_child(&self, args: &[String]) -> Result<Child> {
        Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StreamError::TranscoderUnavailable(self.bin.clone())
                } else {
                    StreamError::Io(e)
                }
            })
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn_mjpeg(&self, source_url: &str) -> Result<TranscoderHandle> {
        let args = mjpeg_args(source_url, &self.viewer);
        debug!("spawning transcoder: {} {}", self.bin, args.join(" "));
        let child = self.spawn_child(&args)?;

        let (tx, rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            tx,
            stop_rx,
            self.start_timeout,
            self.kill_timeout,
        ));
        Ok(TranscoderHandle::new(rx, stop_tx))
    }

    async fn capture_still(&self, source_url: &str) -> Result<Vec<u8>> {
        let args = still_args(source_url);
        let child = self.spawn_child(&args)?;

        // kill_on_drop reaps the child if the deadline fires first.
        match tokio::time::timeout(self.still_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if output.status.success() && !output.stdout.is_empty() {
                    Ok(output.stdout)
                } else {
                    Err(StreamError::TranscoderExited {
                        code: output.status.code(),
                        signal: exit_signal(&output.status),
                    })
                }
            }
            Ok(Err(e)) => Err(StreamError::Io(e)),
            Err(_) => Err(StreamError::TranscoderStartTimeout(self.still_timeout)),
        }
    }
}

/// One task per child: pump stdout/stderr into the event channel, watch the
/// start deadline, honour stop requests, and report the exit status last.
async fn supervise(
    mut child: Child,
    tx: mpsc::Sender<TranscoderEvent>,
    stop_rx: oneshot::Receiver<()>,
    start_timeout: Duration,
    kill_timeout: Duration,
) {
    let Some(mut stdout) = child.stdout.take() else {
        return;
    };
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stderr_done = false;
    let mut saw_output = false;
    let mut interrupted = false;
    let mut stop_rx = stop_rx;
    let mut buf = vec![0u8; 16 * 1024];

    let start_deadline = tokio::time::sleep(start_timeout);
    tokio::pin!(start_deadline);

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        saw_output = true;
                        if tx.send(TranscoderEvent::Bytes(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            // Consumer went away; treat like a stop request.
                            interrupted = true;
                            break;
                        }
                    }
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        // Advisory only; never let a slow consumer stall the
                        // byte pump over diagnostics.
                        let _ = tx.try_send(TranscoderEvent::Stderr(line));
                    }
                    Ok(None) | Err(_) => stderr_done = true,
                }
            }
            _ = &mut start_deadline, if !saw_output => {
                warn!("transcoder produced no output within {start_timeout:?}, stopping it");
                interrupted = true;
                break;
            }
            _ = &mut stop_rx => {
                interrupted = true;
                break;
            }
        }
    }

    let status = if interrupted {
        graceful_stop(&mut child, kill_timeout).await
    } else {
        child.wait().await.ok()
    };

    let _ = tx
        .send(TranscoderEvent::Exit {
            code: status.as_ref().and_then(|s| s.code()),
            signal: status.as_ref().and_then(|s| exit_signal(s)),
        })
        .await;
}

/// Interrupt first; escalate to SIGKILL after the kill budget.
async fn graceful_stop(child: &mut Child, kill_timeout: Duration) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => {
            warn!("transcoder ignored interrupt for {kill_timeout:?}, force-killing");
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Viewer-path arguments. The exact flag set reproduces the latency profile
/// the browser clients were tuned against; change with care.
fn mjpeg_args(source_url: &str, viewer: &ViewerConfig) -> Vec<String> {
    vec![
        "-fflags".to_string(),
        "+flush_packets+nobuffer".to_string(),
        "-flags".to_string(),
        "low_delay".to_string(),
        "-rtsp_transport".to_string(),
        "tcp".to_string(),
        "-i".to_string(),
        source_url.to_string(),
        "-f".to_string(),
        "mjpeg".to_string(),
        "-q:v".to_string(),
        viewer.quality.to_string(),
        "-r".to_string(),
        viewer.fps.to_string(),
        "-s".to_string(),
        format!("{}x{}", viewer.width, viewer.height),
        "-pix_fmt".to_string(),
        "yuvj420p".to_string(),
        "-tune".to_string(),
        "zerolatency".to_string(),
        "-an".to_string(),
        "pipe:1".to_string(),
    ]
}

fn still_args(source_url: &str) -> Vec<String> {
    vec![
        "-rtsp_transport".to_string(),
        "tcp".to_string(),
        "-i".to_string(),
        source_url.to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-f".to_string(),
        "image2".to_string(),
        "-q:v".to_string(),
        "2".to_string(),
        "pipe:1".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_args_preserve_latency_profile() {
        let viewer = ViewerConfig {
            fps: 15,
            width: 800,
            height: 600,
            quality: 5,
        };
        let args = mjpeg_args("rtsp://cam/1", &viewer);
        let joined = args.join(" ");
        assert!(joined.starts_with("-fflags +flush_packets+nobuffer -flags low_delay"));
        assert!(joined.contains("-i rtsp://cam/1"));
        assert!(joined.contains("-f mjpeg -q:v 5 -r 15 -s 800x600 -pix_fmt yuvj420p"));
        assert!(joined.contains("-tune zerolatency"));
        assert!(joined.ends_with("-an pipe:1"));
    }

    #[test]
    fn still_args_request_one_frame() {
        let args = still_args("rtsp://cam/2");
        let joined = args.join(" ");
        assert!(joined.contains("-frames:v 1"));
        assert!(joined.contains("-f image2"));
        assert!(joined.ends_with("pipe:1"));
    }

    #[tokio::test]
    async fn missing_binary_reports_unavailable() {
        let mut config = crate::config::AppConfig::from_env();
        config.ffmpeg_bin = "/definitely/not/ffmpeg".to_string();
        let transcoder = FfmpegTranscoder::new(&config);
        let err = transcoder
            .spawn_mjpeg("rtsp://cam/1")
            .await
            .err()
            .expect("spawn should fail");
        match err {
            StreamError::TranscoderUnavailable(bin) => assert_eq!(bin, "/definitely/not/ffmpeg"),
            other => panic!("expected TranscoderUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_handle_delivers_events_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, _stop_rx) = oneshot::channel();
        let mut handle = TranscoderHandle::new(rx, stop_tx);

        tx.send(TranscoderEvent::Bytes(Bytes::from_static(b"\xff\xd8")))
            .await
            .unwrap();
        tx.send(TranscoderEvent::Exit {
            code: Some(0),
            signal: None,
        })
        .await
        .unwrap();
        drop(tx);

        assert!(matches!(
            handle.next_event().await,
            Some(TranscoderEvent::Bytes(_))
        ));
        assert!(matches!(
            handle.next_event().await,
            Some(TranscoderEvent::Exit { code: Some(0), .. })
        ));
        assert!(handle.next_event().await.is_none());
    }
}
