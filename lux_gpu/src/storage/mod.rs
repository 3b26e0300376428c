mod buffer;
mod image;
pub mod memory;

pub use buffer::Buffer;
pub use image::Image;
