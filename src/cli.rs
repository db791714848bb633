use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "eew-correlator",
    version,
    about = "EEW update correlator and alert dispatcher"
)]
pub struct Args {
    /// Directory to save event reports to (overrides EEW_REPORT_DIR).
    #[arg(long)]
    pub savedir: Option<PathBuf>,
    /// Playback mode: process the feed but disable bus and email transports.
    #[arg(long, default_value_t = false)]
    pub playback: bool,
}
