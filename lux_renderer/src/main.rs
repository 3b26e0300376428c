use env_logger::Env;
use lux_gpu::{Config, Error, Lux, Result};
use renderer::Renderer;
use scenes::ShaderSource;
use std::{env, process};

mod renderer;
mod scenes;

const DEFAULT_FRAMES: u64 = 120;

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = Config::from_env();
    let frames = match env::var("LUX_FRAMES") {
        Ok(frames) => frames.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring LUX_FRAMES={:?}", frames);
            DEFAULT_FRAMES
        }),
        Err(_) => DEFAULT_FRAMES,
    };

    let lux = create_lux(&config)?;
    let mut renderer = Renderer::new(lux, &config, &ShaderSource::from_env())?;
    renderer.run(frames)
}

/// `LUX_BACKEND` picks `vulkan` or `headless`. Unset, Vulkan is tried first
/// and the headless device stands in when no usable GPU is found.
fn create_lux(config: &Config) -> Result<Lux> {
    match env::var("LUX_BACKEND").as_deref() {
        Ok("vulkan") => Lux::vulkan(config),
        Ok("headless") => Lux::headless(),
        backend => {
            if let Ok(backend) = backend {
                log::warn!("Unknown backend {:?}", backend);
            }

            match Lux::vulkan(config) {
                Err(err @ (Error::UnsupportedDevice(_) | Error::Loading(_))) => {
                    log::warn!("{}, falling back to the headless device", err);
                    Lux::headless()
                }
                result => result,
            }
        }
    }
}
