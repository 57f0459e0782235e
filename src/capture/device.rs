//! ALSA PCM device wrapper for float capture.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::error::CaptureError;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct CaptureParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames; one period is one processing quantum
    pub period_size: usize,
}

/// Open a PCM device for float capture.
///
/// The device delivers f32 samples; conversion to wire PCM happens in the
/// capture loop. Default device-level filtering (echo cancellation, noise
/// suppression, AGC) is whatever the ALSA device profile provides.
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
) -> Result<(PCM, CaptureParams), CaptureError> {
    let pcm = PCM::new(device, Direction::Capture, false).map_err(|source| {
        CaptureError::DeviceAcquisition {
            device: device.to_string(),
            source,
        }
    })?;

    let setup_err = |source: alsa::Error| CaptureError::DeviceSetup {
        device: device.to_string(),
        source,
    };

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).map_err(setup_err)?;
        hwp.set_access(Access::RWInterleaved).map_err(setup_err)?;
        hwp.set_format(Format::FloatLE).map_err(setup_err)?;
        hwp.set_channels(channels).map_err(setup_err)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)
            .map_err(setup_err)?;
        hwp.set_period_size_near(period_size as alsa::pcm::Frames, ValueOr::Nearest)
            .map_err(setup_err)?;
        pcm.hw_params(&hwp).map_err(setup_err)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current().map_err(setup_err)?;
        CaptureParams {
            sample_rate: hwp.get_rate().map_err(setup_err)?,
            channels: hwp.get_channels().map_err(setup_err)?,
            period_size: hwp.get_period_size().map_err(setup_err)? as usize,
        }
    };

    tracing::info!(
        device,
        rate = params.sample_rate,
        channels = params.channels,
        period_size = params.period_size,
        "ALSA capture opened"
    );

    Ok((pcm, params))
}
