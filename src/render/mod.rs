pub mod canvas;
pub mod frame;
pub mod layers;
pub mod session;
pub mod text;

pub use frame::FrameSynthesizer;
pub use layers::{Color, LayerConfigs, Overlay, SpectrumLayer, WaveformLayer};
pub use session::{CancelToken, FrameSequence, RenderProgress, RenderSession, SessionGeometry};
pub use text::TextOverlay;
