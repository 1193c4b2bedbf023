pub mod capture;
pub mod stream;

pub use capture::CameraProvider;
pub use stream::{FrameSource, LocalStream, MediaProvider};
