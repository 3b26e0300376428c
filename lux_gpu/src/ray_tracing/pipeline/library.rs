use crate::{Error, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    RayGeneration,
    Miss,
    ClosestHit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub symbol: String,
    pub stage: ShaderStage,
}

impl EntryPoint {
    pub fn new(symbol: impl Into<String>, stage: ShaderStage) -> Self {
        Self {
            symbol: symbol.into(),
            stage,
        }
    }
}

/// A compiled program binary and the entry points it exports. The code is
/// handed to the device untouched.
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    name: String,
    code: Vec<u32>,
    entry_points: Vec<EntryPoint>,
}

impl ShaderLibrary {
    pub fn new(name: impl Into<String>, code: Vec<u32>, entry_points: Vec<EntryPoint>) -> Self {
        Self {
            name: name.into(),
            code,
            entry_points,
        }
    }

    /// Reads a little endian SPIR-V module.
    pub fn from_spirv(
        name: impl Into<String>,
        bytes: &[u8],
        entry_points: Vec<EntryPoint>,
    ) -> Result<Self> {
        let name = name.into();
        if bytes.len() % 4 != 0 {
            return Err(Error::InvalidShader {
                name,
                reason: format!("{} bytes is not a whole number of words", bytes.len()),
            });
        }

        let code: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect();
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(Error::InvalidShader {
                name,
                reason: "missing SPIR-V magic number".to_string(),
            });
        }

        Ok(Self::new(name, code, entry_points))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[u32] {
        &self.code
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_spirv() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0500u32.to_le_bytes());

        let library = ShaderLibrary::from_spirv(
            "raygen",
            &bytes,
            vec![EntryPoint::new("RayGen", ShaderStage::RayGeneration)],
        )
        .unwrap();

        assert_eq!(library.code(), &[SPIRV_MAGIC, 0x0001_0500]);
        assert_eq!(library.entry_points()[0].symbol, "RayGen");
    }

    #[test]
    fn test_from_spirv_rejects_garbage() {
        assert!(matches!(
            ShaderLibrary::from_spirv("bad", &[1, 2, 3], vec![]),
            Err(Error::InvalidShader { .. })
        ));
        assert!(matches!(
            ShaderLibrary::from_spirv("bad", &[0, 0, 0, 0], vec![]),
            Err(Error::InvalidShader { .. })
        ));
    }
}
