//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Which side of the duplex link a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that likely capture system/output audio.
    /// Such inputs would feed the assistant's own voice back to it.
    pub is_loopback_like: bool,
    /// Heuristic recommendation for the best device in its direction.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "speakers (",
    "headphones (",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "usb",
    "webcam",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score an input device name for likely speech microphone quality.
///
/// Higher is better. Non-loopback devices should be preferred.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// Mark the best entry as recommended and order the list for display.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn rank(list: &mut [DeviceInfo]) {
    let best = list
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| {
            let base = match d.direction {
                DeviceDirection::Input => mic_preference_score(&d.name),
                DeviceDirection::Output => 0,
            };
            base + if d.is_default { 2 } else { 0 }
        })
        .map(|(idx, _)| idx);
    if let Some(idx) = best {
        list[idx].is_recommended = true;
    }

    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
}

#[cfg(feature = "audio-cpal")]
mod host {
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::{info, warn};

    use super::{is_loopback_like_name, rank, DeviceDirection, DeviceInfo};
    use crate::error::{Result, VoxError};

    fn describe(
        devices: impl Iterator<Item = cpal::Device>,
        direction: DeviceDirection,
        default_name: Option<String>,
    ) -> Vec<DeviceInfo> {
        let mut list = devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Device {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                let is_loopback_like =
                    direction == DeviceDirection::Input && is_loopback_like_name(&name);
                DeviceInfo {
                    name,
                    direction,
                    is_default,
                    is_loopback_like,
                    is_recommended: false,
                }
            })
            .collect::<Vec<_>>();
        rank(&mut list);
        list
    }

    /// List all audio input devices. Empty when enumeration fails.
    pub fn list_input_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        match host.input_devices() {
            Ok(devices) => describe(devices, DeviceDirection::Input, default_name),
            Err(e) => {
                warn!("failed to enumerate input devices: {e}");
                vec![]
            }
        }
    }

    /// List all audio output devices. Empty when enumeration fails.
    pub fn list_output_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        match host.output_devices() {
            Ok(devices) => describe(devices, DeviceDirection::Output, default_name),
            Err(e) => {
                warn!("failed to enumerate output devices: {e}");
                vec![]
            }
        }
    }

    fn by_name(
        devices: std::result::Result<impl Iterator<Item = cpal::Device>, cpal::DevicesError>,
        preferred: &str,
    ) -> Option<cpal::Device> {
        match devices {
            Ok(mut devices) => {
                devices.find(|device| device.name().map(|n| n == preferred).unwrap_or(false))
            }
            Err(e) => {
                warn!("failed to list devices while resolving preference: {e}");
                None
            }
        }
    }

    /// Resolve an input device: preferred name, then default, then first available.
    pub fn select_input_device(preferred: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(name) = preferred {
            if let Some(device) = by_name(host.input_devices(), name) {
                return Ok(device);
            }
            warn!("preferred input device '{name}' not found, falling back");
        }
        if let Some(device) = host.default_input_device() {
            return Ok(device);
        }
        let mut devices = host
            .input_devices()
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?;
        let fallback = devices
            .next()
            .ok_or_else(|| VoxError::DeviceUnavailable("no input device found".into()))?;
        info!("no default input device, falling back to first available input");
        Ok(fallback)
    }

    /// Resolve an output device: preferred name, then default, then first available.
    pub fn select_output_device(preferred: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(name) = preferred {
            if let Some(device) = by_name(host.output_devices(), name) {
                return Ok(device);
            }
            warn!("preferred output device '{name}' not found, falling back");
        }
        if let Some(device) = host.default_output_device() {
            return Ok(device);
        }
        let mut devices = host
            .output_devices()
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?;
        let fallback = devices
            .next()
            .ok_or_else(|| VoxError::DeviceUnavailable("no output device found".into()))?;
        info!("no default output device, falling back to first available output");
        Ok(fallback)
    }
}

#[cfg(feature = "audio-cpal")]
pub use host::{list_input_devices, list_output_devices, select_input_device, select_output_device};

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, direction: DeviceDirection, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            direction,
            is_default,
            is_loopback_like: is_loopback_like_name(name),
            is_recommended: false,
        }
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("USB Microphone"));
    }

    #[test]
    fn scores_mic_higher_than_loopback() {
        let mic = mic_preference_score("Microphone Array (USB PnP Audio Device)");
        let loopback = mic_preference_score("Stereo Mix (Realtek Audio)");
        assert!(mic > loopback);
    }

    #[test]
    fn rank_recommends_real_microphone_first() {
        let mut list = vec![
            info("Stereo Mix (Realtek Audio)", DeviceDirection::Input, true),
            info("Headset Microphone", DeviceDirection::Input, false),
        ];
        rank(&mut list);
        assert_eq!(list[0].name, "Headset Microphone");
        assert!(list[0].is_recommended);
        assert!(!list[1].is_recommended);
    }

    #[test]
    fn rank_prefers_default_output() {
        let mut list = vec![
            info("HDMI Output", DeviceDirection::Output, false),
            info("Built-in Speakers", DeviceDirection::Output, true),
        ];
        rank(&mut list);
        assert_eq!(list[0].name, "Built-in Speakers");
        assert!(list[0].is_recommended);
    }
}
