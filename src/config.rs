//! Stream limits, platform configuration and encoder parameters.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StreamError};

pub const NUM_LOCAL_ENC_CONSUMERS: usize = 1;
pub const NUM_LOCAL_CUDA_CONSUMERS: usize = 1;
pub const NUM_LOCAL_CONSUMERS: usize = NUM_LOCAL_CUDA_CONSUMERS + NUM_LOCAL_ENC_CONSUMERS;

pub const MAX_NUM_SENSORS: usize = 16;
pub const MAX_PACKETS: usize = 6;
/// Maximum number of elements per packet.
pub const MAX_ELEMENTS: usize = 2;
pub const DATA_ELEMENT_INDEX: usize = 0;
pub const META_ELEMENT_INDEX: usize = 1;
pub const NUM_CONSUMERS: usize = 6;
pub const MAX_WAIT_SYNCOBJ: usize = NUM_CONSUMERS + NUM_LOCAL_CONSUMERS;
pub const MAX_QUERY_TIMEOUTS: u32 = 10;
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1);
pub const FENCE_FRAME_TIMEOUT: Duration = Duration::from_micros(100_000);
pub const DUMP_START_FRAME: u64 = 60;
pub const DUMP_END_FRAME: u64 = 100;

/// User-assigned element names exchanged during setup.
pub const ELEMENT_NAME_DATA: u32 = 0xDA7A;
pub const ELEMENT_NAME_META: u32 = 0x4E7A;

/// Packet cookies are assigned upward from this base, one per endpoint.
pub const COOKIE_BASE: u64 = 0xC00C1E4;

/// Which process role this invocation plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    SingleProcess,
    IpcProducer,
    IpcCudaConsumer,
    IpcEncConsumer,
}

impl AppType {
    pub fn is_producer_resident(self) -> bool {
        matches!(self, AppType::SingleProcess | AppType::IpcProducer)
    }
}

/// One camera module attached to a device block.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub sensor_id: u32,
    pub link_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceBlockInfo {
    pub modules: Vec<ModuleInfo>,
}

/// Platform configuration: device blocks and the camera modules behind them.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformCfg {
    pub name: String,
    pub device_blocks: Vec<DeviceBlockInfo>,
}

impl PlatformCfg {
    /// Look up one of the built-in platform configurations by name.
    pub fn by_name(name: &str) -> Result<Self> {
        match name {
            "SIM1080P_DUAL" => Ok(Self::synthetic(name, 2, 1920, 1080, 30)),
            "SIM720P_HEX" => Ok(Self::synthetic(name, 6, 1280, 720, 30)),
            "SIM480P_QUAD" => Ok(Self::synthetic(name, 4, 640, 480, 30)),
            _ => Err(StreamError::Config(format!(
                "unknown platform configuration '{name}'"
            ))),
        }
    }

    /// Load a platform configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| StreamError::Config(e.to_string()))
    }

    fn synthetic(name: &str, sensors: u32, width: u32, height: u32, fps: u32) -> Self {
        let modules = (0..sensors)
            .map(|i| ModuleInfo {
                name: format!("simcam{i}"),
                sensor_id: i,
                link_index: i % 4,
                width,
                height,
                fps,
            })
            .collect();
        PlatformCfg {
            name: name.to_string(),
            device_blocks: vec![DeviceBlockInfo { modules }],
        }
    }

    /// Keep only modules whose link bit is set in the per-device-block mask.
    /// Blocks without a mask entry are left untouched.
    pub fn apply_masks(&mut self, masks: &[u32]) {
        for (blk, mask) in self.device_blocks.iter_mut().zip(masks.iter()) {
            blk.modules.retain(|m| mask & (1 << m.link_index) != 0);
        }
        self.device_blocks.retain(|blk| !blk.modules.is_empty());
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.device_blocks.iter().flat_map(|b| b.modules.iter())
    }
}

/// Rate-control mode passed through to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    ConstQp { qp: u8 },
    Cbr { average_bitrate: u32 },
}

/// H.264-style encoder parameters, passed through at consumer construction.
#[derive(Debug, Clone)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub gop_length: u32,
    pub idr_period: u32,
    pub rate_control: RateControl,
    pub max_qp: u8,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    /// Repeat SPS/PPS on every intra frame.
    pub repeat_spspps: bool,
}

impl EncoderParams {
    pub fn new(width: u32, height: u32) -> Self {
        EncoderParams {
            width,
            height,
            gop_length: 16,
            idr_period: 16,
            rate_control: RateControl::Cbr {
                average_bitrate: 8_000_000,
            },
            max_qp: 51,
            frame_rate_num: 30,
            frame_rate_den: 1,
            repeat_spspps: true,
        }
    }

    /// Switch to constant-QP mode, clamped to the configured maximum.
    pub fn with_const_qp(mut self, qp: u8) -> Self {
        self.rate_control = RateControl::ConstQp {
            qp: qp.min(self.max_qp),
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_platform_has_expected_sensors() {
        let cfg = PlatformCfg::by_name("SIM720P_HEX").unwrap();
        assert_eq!(cfg.modules().count(), 6);
        assert!(cfg.modules().all(|m| m.width == 1280 && m.height == 720));
    }

    #[test]
    fn unknown_platform_is_rejected() {
        assert!(PlatformCfg::by_name("nonexistent").is_err());
    }

    #[test]
    fn link_mask_prunes_modules() {
        let mut cfg = PlatformCfg::by_name("SIM480P_QUAD").unwrap();
        cfg.apply_masks(&[0b0011]);
        let ids: Vec<u32> = cfg.modules().map(|m| m.sensor_id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn encoder_params_default_to_cbr_with_const_qp_opt_in() {
        let params = EncoderParams::new(1920, 1080);
        assert_eq!(
            params.rate_control,
            RateControl::Cbr {
                average_bitrate: 8_000_000
            }
        );
        let params = params.with_const_qp(60);
        assert_eq!(params.rate_control, RateControl::ConstQp { qp: 51 });
    }

    #[test]
    fn platform_cfg_parses_from_toml() {
        let text = r#"
            name = "bench"
            [[device_blocks]]
            [[device_blocks.modules]]
            name = "cam0"
            sensor_id = 0
            link_index = 0
            width = 640
            height = 480
            fps = 15
        "#;
        let cfg: PlatformCfg = toml::from_str(text).unwrap();
        assert_eq!(cfg.name, "bench");
        assert_eq!(cfg.modules().count(), 1);
    }
}
