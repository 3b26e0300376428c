use lux_gpu::{
    ray_tracing::{EntryPoint, ShaderLibrary, ShaderStage},
    Result,
};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Where the compiled shader libraries come from.
#[derive(Debug, Clone)]
pub enum ShaderSource {
    /// `<name>.spv` files in a directory.
    Directory(PathBuf),
    /// A bare SPIR-V header per library. Only the headless device accepts
    /// these.
    Placeholder,
}

impl ShaderSource {
    /// `LUX_SHADER_DIR` if set, otherwise placeholders.
    pub fn from_env() -> ShaderSource {
        match env::var_os("LUX_SHADER_DIR") {
            Some(dir) => ShaderSource::Directory(dir.into()),
            None => ShaderSource::Placeholder,
        }
    }

    pub fn library(&self, name: &str, entry_points: &[(&str, ShaderStage)]) -> Result<ShaderLibrary> {
        let entry_points = entry_points
            .iter()
            .map(|(symbol, stage)| EntryPoint::new(*symbol, *stage))
            .collect();

        match self {
            ShaderSource::Directory(dir) => {
                let bytes = read(dir, name)?;
                ShaderLibrary::from_spirv(name, &bytes, entry_points)
            }
            ShaderSource::Placeholder => Ok(ShaderLibrary::new(
                name,
                vec![0x0723_0203, 0x0001_0500, 0, 1, 0],
                entry_points,
            )),
        }
    }
}

fn read(dir: &Path, name: &str) -> Result<Vec<u8>> {
    let path = dir.join(format!("{}.spv", name));
    log::debug!("Loading {}", path.display());

    fs::read(&path).map_err(|err| lux_gpu::Error::InvalidShader {
        name: name.to_string(),
        reason: format!("{}: {}", path.display(), err),
    })
}
