use crate::scenes::{CubeAndPlane, ShaderSource};
use lux_gpu::{frames::FrameOrchestrator, Config, Lux, Result};
use log::info;

/// Animates the cube and plane scene through the frame orchestrator.
pub struct Renderer {
    frames: FrameOrchestrator,
    _scene: CubeAndPlane,
    lux: Lux,
}

impl Renderer {
    pub const SIZE: (u32, u32) = (1280, 720);

    pub fn new(lux: Lux, config: &Config, shaders: &ShaderSource) -> Result<Renderer> {
        let device = lux.device();
        let scene = CubeAndPlane::new(device)?;
        let pipeline = CubeAndPlane::pipeline(device, shaders, config.pipeline)?;

        let frames = FrameOrchestrator::new(
            device,
            pipeline,
            scene.instances(),
            Self::SIZE,
            &config.frames,
            CubeAndPlane::records(),
        )?;

        Ok(Renderer {
            frames,
            _scene: scene,
            lux,
        })
    }

    pub fn draw(&mut self) -> Result<()> {
        let time = self.frames.frame_index() as f32;
        self.frames
            .set_transform(0, CubeAndPlane::cube_transform(time))?;

        let aspect_ratio = Self::SIZE.0 as f32 / Self::SIZE.1 as f32;
        self.frames.render(&CubeAndPlane::camera(aspect_ratio))?;

        Ok(())
    }

    pub fn run(&mut self, frame_count: u64) -> Result<()> {
        for _ in 0..frame_count {
            self.draw()?;
        }
        self.frames.wait_idle()?;
        self.frames.verify()?;

        info!(
            "Rendered {} frames on {}",
            self.frames.frame_index(),
            self.lux.device().name()
        );
        Ok(())
    }
}
