pub mod ascii_preview;
pub mod commands;

pub use ascii_preview::{clear_screen, AsciiOverlay};
pub use commands::Kiosk;
