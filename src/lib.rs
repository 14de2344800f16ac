pub mod codec;
pub mod config;
pub mod controller;
pub mod external;
pub mod frame_counter;
pub mod llm;
pub mod preroll_ring;
pub mod sender;
pub mod stt;
pub mod tts;
pub mod vad;

pub use config::{read_app_config, AppConfig};
pub use controller::ConversationController;
pub use sender::PacedSender;
pub use vad::VadSegmenter;
