//! Microphone access through cpal
//!
//! The cpal stream lives on its own thread because streams are not `Send` on
//! every host. Callback data is downmixed to mono i16 and handed to the
//! capture loop over a bounded channel, which reads it with a timeout.

use crate::error::AudioError;

/// Convert a normalized float sample to i16, clamping out-of-range input
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Average interleaved channels down to mono
pub fn downmix(interleaved: &[i16], channels: u16) -> Vec<i16> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Description of an input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channels: Vec<u16>,
}

/// Pick the device whose name contains `pattern`, or the default when empty
pub fn select_device<'a>(
    devices: &'a [InputDeviceInfo],
    pattern: &str,
) -> Result<&'a InputDeviceInfo, AudioError> {
    let found = if pattern.is_empty() {
        devices.iter().find(|d| d.is_default)
    } else {
        let needle = pattern.to_lowercase();
        devices
            .iter()
            .find(|d| d.name.to_lowercase().contains(&needle))
    };
    found.ok_or_else(|| AudioError::DeviceNotFound(pattern.to_string()))
}

#[cfg(feature = "device")]
pub use cpal_input::{list_input_devices, CpalSource};

#[cfg(feature = "device")]
mod cpal_input {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::{downmix, f32_to_i16, select_device, InputDeviceInfo};
    use crate::audio::capture::SampleSource;
    use crate::error::AudioError;

    /// List all input devices on the default host
    pub fn list_input_devices() -> Vec<InputDeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        if let Ok(inputs) = host.input_devices() {
            for device in inputs {
                let Ok(name) = device.name() else { continue };
                let mut channels: Vec<u16> = device
                    .supported_input_configs()
                    .map(|configs| configs.map(|c| c.channels()).collect())
                    .unwrap_or_default();
                channels.sort();
                channels.dedup();

                devices.push(InputDeviceInfo {
                    is_default: default_name.as_ref() == Some(&name),
                    name,
                    channels,
                });
            }
        }
        devices
    }

    fn find_device(name: &str) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        for device in devices {
            if device.name().ok().as_deref() == Some(name) {
                return Ok(device);
            }
        }
        Err(AudioError::DeviceNotFound(name.to_string()))
    }

    /// Mono i16 sample source backed by a cpal input stream
    pub struct CpalSource {
        chunks: Receiver<Vec<i16>>,
        errors: Receiver<AudioError>,
        pending: Vec<i16>,
        running: Arc<AtomicBool>,
        thread_handle: Option<JoinHandle<()>>,
    }

    impl CpalSource {
        /// Open the input device matching `pattern` at `sample_rate`
        pub fn open(pattern: &str, sample_rate: u32) -> Result<Self, AudioError> {
            let devices = list_input_devices();
            let info = select_device(&devices, pattern)?;
            let device = find_device(&info.name)?;

            let default_config = device
                .default_input_config()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
            let config = StreamConfig {
                channels: default_config.channels(),
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let channels = config.channels;

            let (chunk_tx, chunk_rx) = bounded::<Vec<i16>>(64);
            let (error_tx, error_rx) = bounded::<AudioError>(16);
            let running = Arc::new(AtomicBool::new(true));
            let running_for_loop = running.clone();

            tracing::info!(device = %info.name, sample_rate, channels, "Opening input device");

            let handle = thread::Builder::new()
                .name("cpal-input".to_string())
                .spawn(move || {
                    let stream_errors = error_tx.clone();
                    let stream = device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            push_chunk(&chunk_tx, data, channels);
                        },
                        move |err| {
                            let _ = stream_errors.try_send(AudioError::StreamError(err.to_string()));
                        },
                        None,
                    );

                    match stream {
                        Ok(stream) => {
                            if let Err(e) = stream.play() {
                                let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                                return;
                            }
                            while running_for_loop.load(Ordering::Relaxed) {
                                thread::sleep(Duration::from_millis(10));
                            }
                        }
                        Err(e) => {
                            tracing::error!("Failed to build input stream: {}", e);
                            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                        }
                    }
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            Ok(Self {
                chunks: chunk_rx,
                errors: error_rx,
                pending: Vec::new(),
                running,
                thread_handle: Some(handle),
            })
        }
    }

    fn push_chunk(tx: &Sender<Vec<i16>>, data: &[f32], channels: u16) {
        let interleaved: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
        // Overrun: the capture loop is behind, drop this callback's data
        let _ = tx.try_send(downmix(&interleaved, channels));
    }

    impl SampleSource for CpalSource {
        fn read_samples(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, AudioError> {
            if let Ok(err) = self.errors.try_recv() {
                return Err(err);
            }

            if self.pending.is_empty() {
                match self.chunks.recv_timeout(timeout) {
                    Ok(chunk) => self.pending = chunk,
                    Err(RecvTimeoutError::Timeout) => return Ok(0),
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(AudioError::ReadFailed("input stream closed".to_string()))
                    }
                }
            }

            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    impl Drop for CpalSource {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }
    }
}
