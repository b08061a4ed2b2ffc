//! cpal-backed input and output devices
//!
//! cpal streams are not `Send` on every platform, so each open device lives
//! on its own named thread that builds the stream, reports whether that
//! worked, then parks until told to stop. Dropping the stream on that thread
//! releases the device.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    StreamError, SupportedStreamConfig,
};

use super::capture::{CaptureConfig, FrameAssembler, InputBackend};
use super::frame::SAMPLE_RATE;
use super::playback::{OutputBackend, PlaybackConfig, PlaybackSource};
use crate::error::VoiceError;

/// A running device thread
struct DeviceWorker {
    stop: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl DeviceWorker {
    /// Spawn `build` on a dedicated thread and wait until the stream is playing
    fn spawn<F>(name: &str, build: F) -> Result<Self, VoiceError>
    where
        F: FnOnce() -> Result<Stream, VoiceError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), VoiceError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until close() (or the owner is dropped)
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| VoiceError::DeviceUnavailable(format!("Failed to spawn audio thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: stop_tx,
                thread,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::DeviceUnavailable(
                    "Audio thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            log::error!("Audio thread panicked");
        }
    }
}

/// Linear-interpolating sample rate converter that keeps state across blocks
#[derive(Debug, Clone)]
pub(crate) struct StreamResampler {
    /// Input samples per output sample
    step: f64,
    /// Position of the next output between `prev` (0.0) and the next input (1.0)
    frac: f64,
    prev: f32,
}

impl StreamResampler {
    pub(crate) fn new(source_rate: u32, target_rate: u32) -> Option<Self> {
        if source_rate == 0 || target_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), not resampling",
                source_rate,
                target_rate
            );
            return None;
        }
        if source_rate == target_rate {
            return None;
        }
        Some(Self {
            step: source_rate as f64 / target_rate as f64,
            frac: 0.0,
            prev: 0.0,
        })
    }

    pub(crate) fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        for &sample in input {
            while self.frac < 1.0 {
                out.push(self.prev + (sample - self.prev) * self.frac as f32);
                self.frac += self.step;
            }
            self.frac -= 1.0;
            self.prev = sample;
        }
    }
}

/// Pulls 24 kHz mono from the playback queue at the device's rate
struct OutputRenderer {
    source: PlaybackSource,
    resampler: Option<StreamResampler>,
    pending: VecDeque<f32>,
    scratch: Vec<f32>,
    produced: Vec<f32>,
    mono: Vec<f32>,
}

impl OutputRenderer {
    fn new(source: PlaybackSource, device_rate: u32) -> Self {
        Self {
            source,
            resampler: StreamResampler::new(SAMPLE_RATE, device_rate),
            pending: VecDeque::new(),
            scratch: Vec::new(),
            produced: Vec::new(),
            mono: Vec::new(),
        }
    }

    fn render(&mut self, frames: usize) -> &[f32] {
        self.mono.clear();
        match &mut self.resampler {
            None => {
                self.mono.resize(frames, 0.0);
                self.source.fill(&mut self.mono);
            }
            Some(resampler) => {
                while self.pending.len() < frames {
                    let deficit = (frames - self.pending.len()) as f64;
                    let need = (deficit * resampler.step).ceil().max(1.0) as usize;
                    self.scratch.clear();
                    self.scratch.resize(need, 0.0);
                    self.source.fill(&mut self.scratch);
                    self.produced.clear();
                    resampler.process(&self.scratch, &mut self.produced);
                    self.pending.extend(self.produced.drain(..));
                }
                self.mono.extend(self.pending.drain(..frames));
            }
        }
        &self.mono
    }
}

fn find_device(name: Option<&str>, input: bool) -> Result<Device, VoiceError> {
    let host = cpal::default_host();
    let kind = if input { "input" } else { "output" };

    let device = match name {
        Some(wanted) => {
            let matches = |d: &Device| d.name().map(|n| n == wanted).unwrap_or(false);
            if input {
                host.input_devices()
                    .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?
                    .find(matches)
            } else {
                host.output_devices()
                    .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?
                    .find(matches)
            }
        }
        None if input => host.default_input_device(),
        None => host.default_output_device(),
    };

    let device = device.ok_or_else(|| {
        VoiceError::DeviceUnavailable(match name {
            Some(n) => format!("No {} device named {:?}", kind, n),
            None => format!("No audio {} device found", kind),
        })
    })?;

    log::info!("Using audio {} device: {:?}", kind, device.name());
    Ok(device)
}

/// Prefer mono at `rate`, then any channel count at `rate`, then the default
fn choose_config(device: &Device, rate: u32, input: bool) -> Result<SupportedStreamConfig, VoiceError> {
    let target = SampleRate(rate);
    let ranges: Vec<cpal::SupportedStreamConfigRange> = if input {
        device
            .supported_input_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default()
    };

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= target && c.max_sample_rate() >= target
    };

    if let Some(range) = ranges
        .iter()
        .find(|c| c.channels() == 1 && supports_rate(*c))
        .or_else(|| ranges.iter().find(|c| supports_rate(*c)))
    {
        return Ok(range.clone().with_sample_rate(target));
    }

    let fallback = if input {
        device.default_input_config()
    } else {
        device.default_output_config()
    };
    fallback.map_err(|e| VoiceError::DeviceUnavailable(format!("No supported audio configuration: {}", e)))
}

fn build_input_stream(config: &CaptureConfig, assembler: FrameAssembler) -> Result<Stream, VoiceError> {
    let device = find_device(config.device_name.as_deref(), true)?;
    let supported = choose_config(&device, config.sample_rate, true)?;

    log::info!(
        "Capture config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );
    if config.echo_cancellation || config.noise_suppression || config.auto_gain {
        log::info!("Capture: echo cancellation / noise suppression / auto gain are left to the OS audio stack");
    }

    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();

    match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &stream_config, config.sample_rate, assembler),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &stream_config, config.sample_rate, assembler),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &stream_config, config.sample_rate, assembler),
        other => Err(VoiceError::DeviceUnavailable(format!(
            "Unsupported input sample format {:?}",
            other
        ))),
    }
}

fn build_input_typed<T>(
    device: &Device,
    config: &StreamConfig,
    target_rate: u32,
    mut assembler: FrameAssembler,
) -> Result<Stream, VoiceError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut resampler = StreamResampler::new(config.sample_rate.0, target_rate);
    let handle = assembler.handle();
    let mut mono: Vec<f32> = Vec::new();
    let mut resampled: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                for frame in data.chunks(channels) {
                    let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                    mono.push(sum / frame.len() as f32);
                }
                match resampler.as_mut() {
                    Some(r) => {
                        resampled.clear();
                        r.process(&mono, &mut resampled);
                        assembler.push(&resampled);
                    }
                    None => assembler.push(&mono),
                }
            },
            move |err| match err {
                StreamError::DeviceNotAvailable => {
                    handle.device_lost("input device is no longer available")
                }
                other => log::error!("Capture: stream error: {}", other),
            },
            None,
        )
        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))
}

fn build_output_stream(config: &PlaybackConfig, source: PlaybackSource) -> Result<Stream, VoiceError> {
    let device = find_device(config.device_name.as_deref(), false)?;
    let supported = choose_config(&device, config.sample_rate, false)?;

    log::info!(
        "Playback config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();

    match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &stream_config, source),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &stream_config, source),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &stream_config, source),
        other => Err(VoiceError::DeviceUnavailable(format!(
            "Unsupported output sample format {:?}",
            other
        ))),
    }
}

fn build_output_typed<T>(
    device: &Device,
    config: &StreamConfig,
    source: PlaybackSource,
) -> Result<Stream, VoiceError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut renderer = OutputRenderer::new(source, config.sample_rate.0);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let mono = renderer.render(frames);
                // Same sample on every channel
                for (frame, &sample) in data.chunks_mut(channels).zip(mono) {
                    for out in frame.iter_mut() {
                        *out = T::from_sample(sample);
                    }
                }
            },
            |err| log::error!("Playback: stream error: {}", err),
            None,
        )
        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))
}

/// Microphone through the default cpal host
#[derive(Default)]
pub struct CpalInput {
    worker: Option<DeviceWorker>,
}

impl CpalInput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputBackend for CpalInput {
    fn open(&mut self, config: &CaptureConfig, assembler: FrameAssembler) -> Result<(), VoiceError> {
        self.close();
        let config = config.clone();
        let worker = DeviceWorker::spawn("vokey-capture", move || build_input_stream(&config, assembler))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Speaker through the default cpal host
#[derive(Default)]
pub struct CpalOutput {
    worker: Option<DeviceWorker>,
}

impl CpalOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputBackend for CpalOutput {
    fn open(&mut self, config: &PlaybackConfig, source: PlaybackSource) -> Result<(), VoiceError> {
        self.close();
        let config = config.clone();
        let worker = DeviceWorker::spawn("vokey-playback", move || build_output_stream(&config, source))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of the input devices on the default host
pub fn list_input_devices() -> Vec<String> {
    cpal::default_host()
        .input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

/// Names of the output devices on the default host
pub fn list_output_devices() -> Vec<String> {
    cpal::default_host()
        .output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}
