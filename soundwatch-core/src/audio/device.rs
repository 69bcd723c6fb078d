//! Input device enumeration and backend error mapping.

use serde::{Deserialize, Serialize};

use crate::error::SoundwatchError;

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Heuristic flag for devices that capture system/output audio rather
    /// than the room.
    pub is_loopback_like: bool,
    /// Best guess for an ambient-sound microphone.
    pub is_recommended: bool,
    /// Native sample rate of the default input config, if known.
    pub native_sample_rate: Option<u32>,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "virtual output",
    "speakers (",
    "headphones (",
];

const MIC_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "built-in",
    "internal",
    "usb",
    "webcam",
    "line in",
];

/// Phrases that backends use when the OS refuses microphone access.
const PERMISSION_KEYWORDS: &[&str] = &[
    "permission",
    "denied",
    "not authorized",
    "unauthorized",
    "not permitted",
    "privacy",
];

/// Heuristic for loopback / system-output capture devices. These hear the
/// computer, not the street, and are useless for siren detection.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for how likely it is to pick up ambient sound.
/// Higher is better.
pub fn ambient_mic_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// Map a backend error message onto the capture error taxonomy.
///
/// Backends report denied microphone access as free-form text; anything
/// that reads like a permission problem becomes `PermissionDenied`, the rest
/// `DeviceUnavailable`.
pub fn backend_error(context: &str, message: impl std::fmt::Display) -> SoundwatchError {
    let message = message.to_string();
    let lowered = message.to_ascii_lowercase();
    if PERMISSION_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        SoundwatchError::PermissionDenied(format!("{context}: {message}"))
    } else {
        SoundwatchError::DeviceUnavailable(format!("{context}: {message}"))
    }
}

/// List all available audio input devices, recommended first.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            return Vec::new();
        }
    };

    let mut list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_loopback_like: is_loopback_like_name(&name),
                is_recommended: false,
                native_sample_rate: device.default_input_config().ok().map(|c| c.sample_rate().0),
                name,
            }
        })
        .collect::<Vec<_>>();

    mark_recommended(&mut list);
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Flag the best ambient microphone and sort recommended/default first.
pub fn mark_recommended(list: &mut [DeviceInfo]) {
    if let Some(best) = list
        .iter_mut()
        .max_by_key(|d| ambient_mic_score(&d.name) + if d.is_default { 2 } else { 0 })
    {
        best.is_recommended = true;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            is_default,
            is_loopback_like: is_loopback_like_name(name),
            is_recommended: false,
            native_sample_rate: Some(48_000),
        }
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("MacBook Pro Microphone"));
    }

    #[test]
    fn microphone_beats_loopback() {
        assert!(ambient_mic_score("Microphone Array (USB)") > ambient_mic_score("Stereo Mix"));
    }

    #[test]
    fn recommended_device_sorts_first() {
        let mut list = vec![
            info("Stereo Mix (Realtek Audio)", true),
            info("USB Microphone", false),
        ];
        mark_recommended(&mut list);
        assert_eq!(list[0].name, "USB Microphone");
        assert!(list[0].is_recommended);
        assert!(!list[1].is_recommended);
    }

    #[test]
    fn permission_text_maps_to_permission_denied() {
        let err = backend_error("build input stream", "Access denied by privacy settings");
        assert!(matches!(err, SoundwatchError::PermissionDenied(_)));
        let err = backend_error("build input stream", "device disconnected");
        assert!(matches!(err, SoundwatchError::DeviceUnavailable(_)));
    }
}
