pub mod app;

pub use app::config::{load_config, save_config, AppConfig};
pub use app::error::AppError;
pub use app::logcat::{channel_sink, LogSink, TailerState};
pub use app::logging::init_logging;
pub use app::memory::{export_memory_csv, memory_export_filename};
pub use app::models;
pub use app::recording::{RecordingDestination, RecordingState};
pub use app::screenshot::{save_recording, save_screenshot};
pub use app::session::DeviceSession;
pub use app::telemetry::{memory_export_rows, DeviceCapabilities, TelemetrySink};
