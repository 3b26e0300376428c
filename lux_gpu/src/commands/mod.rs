mod list;

pub use list::{Barrier, BuildMode, Command, CommandList, ImageState};
