use std::{env, str::FromStr};

/// Fixed pipeline policy. These are supplied once when the pipeline is
/// finalized and are never queried from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            // RGB colour and hit distance
            max_payload_size: 4 * 4,
            // Barycentrics
            max_attribute_size: 2 * 4,
            // Primary rays plus one bounce of shadow rays
            max_recursion_depth: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub frames_in_flight: usize,
    pub hit_groups_per_instance: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            hit_groups_per_instance: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub frames: FrameConfig,
    pub validation: bool,
}

impl Config {
    /// Defaults overridden by `LUX_FRAMES_IN_FLIGHT`, `LUX_MAX_RECURSION` and
    /// `LUX_VALIDATION`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Config {
        let mut config = Config::default();

        if let Some(frames) = env_var::<usize>("LUX_FRAMES_IN_FLIGHT") {
            config.frames.frames_in_flight = frames.clamp(1, 3);
        }
        if let Some(depth) = env_var::<u32>("LUX_MAX_RECURSION") {
            config.pipeline.max_recursion_depth = depth;
        }
        if let Some(validation) = env_var::<bool>("LUX_VALIDATION") {
            config.validation = validation;
        }

        log::debug!("Config: {:?}", config);
        config
    }
}

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("Ignoring {}={:?}", name, value);
            None
        }
    }
}
