//! Kestrel demo viewer
//!
//! Clears the window every frame and, given compiled shaders, draws a quad
//! on top. Exercises swapchain recreation and runtime frame pacing changes.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p kestrel-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-c, --config <PATH>`: TOML config file (default: `kestrel.toml`)
//! - `--shaders <DIR>`: Directory with `quad.vert.spv` and `quad.frag.spv`
//! - `-h, --help`: Print help message
//!
//! ## Keys
//!
//! - `1`, `2`, `3`: Frames in flight
//! - `R`: Rebuild the swapchain
//! - `Escape`: Quit
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use kestrel_app::{init_logging, run_app, AppConfig};

use crate::app::{Viewer, ViewerArgs};

fn main() -> anyhow::Result<()> {
    // Check for help flag before starting the app
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    init_logging();
    let args = ViewerArgs::from_args();
    let config = AppConfig::load_or_default(&args.config_path);

    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "Kestrel demo viewer

USAGE:
    cargo run -p kestrel-viewer -- [OPTIONS]

OPTIONS:
    -c, --config <PATH>     TOML config file (default: kestrel.toml)
    --shaders <DIR>         Directory containing quad.vert.spv and quad.frag.spv
    -h, --help              Print this help message

KEYS:
    1, 2, 3                 Set the number of frames in flight
    R                       Rebuild the swapchain
    Escape                  Quit

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
