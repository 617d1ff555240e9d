use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "beatcast", about = "Offline audio visualizer video renderer and publish queue")]
pub struct Cli {
    /// Config file (defaults to ./beatcast.toml, then the user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render a single audio file to video and exit
    Render(RenderArgs),
    /// Manage the persistent job queue
    Queue(QueueArgs),
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Input audio file (WAV, MP3, FLAC, OGG)
    pub input: PathBuf,

    /// Output video file (defaults to a generated name in the output dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Video width in pixels
    #[arg(long, default_value_t = 1920)]
    pub width: u32,

    /// Video height in pixels
    #[arg(long, default_value_t = 1080)]
    pub height: u32,

    /// Frames per second
    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// H.264 CRF quality (0-51, lower = better). Ignored when --bitrate is set.
    #[arg(long, default_value_t = 18)]
    pub crf: u32,

    /// Video bitrate (e.g. 2400k, 5M). When set, uses -b:v instead of -crf.
    #[arg(short, long)]
    pub bitrate: Option<String>,

    /// FFmpeg video codec, or "auto" to probe for a hardware encoder
    #[arg(long, default_value = "auto")]
    pub codec: String,

    /// Title text overlay
    #[arg(long)]
    pub title: Option<String>,

    /// Skip the waveform layer
    #[arg(long)]
    pub no_waveform: bool,

    /// Skip the spectrum layer
    #[arg(long)]
    pub no_spectrum: bool,

    /// Number of spectrum bars
    #[arg(long)]
    pub bars: Option<usize>,

    /// Font file for text overlays
    #[arg(long)]
    pub font: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    /// Job store file (defaults to the user data dir)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: QueueCommand,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Queue one job per audio file
    Add {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Publish each video after rendering
        #[arg(long)]
        publish: bool,

        /// Account to publish to
        #[arg(long, default_value = "default")]
        account: String,

        /// Video title (defaults to the audio file name)
        #[arg(long)]
        title: Option<String>,

        #[arg(long, default_value = "")]
        description: String,

        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Process pending jobs until the queue is empty
    Run,
    /// Show job counts per status
    Status,
    /// List recent jobs, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Requeue a failed job
    Retry { id: u64 },
    /// Cancel a pending or running job
    Cancel { id: u64 },
    /// Delete completed and cancelled jobs older than the given age
    Clear {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}
