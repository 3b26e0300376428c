mod cube_and_plane;
mod shaders;

pub use cube_and_plane::CubeAndPlane;
pub use shaders::ShaderSource;
