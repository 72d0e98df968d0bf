use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample as _, SampleFormat, SizedSample};
use log::{debug, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};

/// Microphone capture feeding the local audio track.
///
/// `cpal::Stream` is not `Send`, so the stream lives on its own thread for
/// the whole capture lifetime; dropping `AudioCapture` signals that thread
/// to stop and tear the stream down.
pub struct AudioCapture {
    stop: Arc<AtomicBool>,
}

impl AudioCapture {
    /// Opens the default input device and starts feeding `track`. Fails
    /// with `MediaAccessDenied` when no device exists or the stream cannot
    /// be opened; callers surface this instead of retrying.
    pub fn start(track: Arc<TrackLocalStaticSample>, enabled: Arc<AtomicBool>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || capture_thread(track, enabled, thread_stop, ready_tx));

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Audio(
                "capture thread exited before reporting readiness".to_string(),
            )),
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn capture_thread(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    ready: std::sync::mpsc::Sender<Result<()>>,
) {
    let host = cpal::default_host();
    let device = match host.default_input_device() {
        Some(device) => device,
        None => {
            let _ = ready.send(Err(Error::MediaAccessDenied(
                "no audio input device available".to_string(),
            )));
            return;
        }
    };

    let config = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(Error::MediaAccessDenied(e.to_string())));
            return;
        }
    };
    debug!("audio input config: {config:?}");

    let sample_rate = config.sample_rate().0;
    let channels = config.channels();

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(
            &device,
            &config.into(),
            track,
            enabled,
            sample_rate,
            channels,
        ),
        SampleFormat::I16 => build_input_stream::<i16>(
            &device,
            &config.into(),
            track,
            enabled,
            sample_rate,
            channels,
        ),
        SampleFormat::U16 => build_input_stream::<u16>(
            &device,
            &config.into(),
            track,
            enabled,
            sample_rate,
            channels,
        ),
        other => Err(Error::Audio(format!("unsupported sample format: {other:?}"))),
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(Error::MediaAccessDenied(e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    // Stream drops here, stopping capture and the OS recording indicator.
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    sample_rate: u32,
    channels: u16,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| warn!("audio input stream error: {err}");

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Muted tracks keep their timing by sending silence, which
                // the remote side observes immediately.
                let muted = !enabled.load(Ordering::Relaxed);
                let mut bytes = Vec::with_capacity(data.len() * 4);
                for s in data {
                    let value = if muted { 0.0 } else { f32::from_sample(*s) };
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                let sample = Sample {
                    data: bytes.into(),
                    duration: Duration::from_secs_f64(
                        data.len() as f64 / (sample_rate as f64 * channels as f64),
                    ),
                    ..Default::default()
                };
                if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                    debug!("failed to write audio sample: {e}");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::MediaAccessDenied(e.to_string()))?;

    Ok(stream)
}
