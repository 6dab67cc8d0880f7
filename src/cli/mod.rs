#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "tabrelay",
    version,
    about = "A CDP relay that exposes consented Chrome tabs to Playwright-compatible clients",
    long_about = "tabrelay multiplexes the Chrome DevTools Protocol between a browser extension \
        (or the built-in native bridge) attached to existing Chrome tabs and Playwright-compatible \
        clients that expect Chrome's remote-debugging WebSocket. The relay fabricates the root CDP \
        endpoint, synthesizes target-lifecycle events and per-session sockets, translates command \
        ids across the split, and exposes an out-of-band HTTP API for tab recording.\n\n\
        Designed for AI agents and shell scripting, the record and status subcommands produce \
        structured JSON on stdout and structured JSON errors on stderr.",
    term_width = 100
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalOpts {
    /// Relay host address
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Relay port number
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Path to a config file (overrides the search chain)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub output: OutputFormat,
}

#[derive(Args)]
#[group(multiple = false)]
pub struct OutputFormat {
    /// Output as compact JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Output as pretty-printed JSON
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Output as human-readable plain text
    #[arg(long, global = true)]
    pub plain: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay server
    #[command(
        long_about = "Run the relay server: the extension WebSocket slot, the fabricated Chrome \
            CDP endpoints for clients, the recording HTTP API, and the health/version probes. \
            If another relay already owns the port it is asked to shut down and the port is \
            taken over."
    )]
    Serve(ServeArgs),

    /// Run the native extension-side bridge
    #[command(
        long_about = "Run the extension-side bridge as a native process: discovers a running \
            Chrome via its DevTools endpoint, attaches the debugger to the consented tabs, \
            connects to the relay as the extension peer, and keeps reconnecting until replaced \
            by another extension."
    )]
    Bridge(BridgeArgs),

    /// Tab recording control (start, stop, status, cancel)
    #[command(
        long_about = "Control tab recording through the relay's HTTP API: start recording a \
            tab to a file, stop and finalize it, query recorder state, or cancel and discard. \
            Each operation prints the relay's JSON reply."
    )]
    Record(RecordArgs),

    /// Probe a running relay
    #[command(
        long_about = "Probe the relay's health and version endpoints and print the result as \
            structured JSON."
    )]
    Status,

    /// Configuration file management
    #[command(
        long_about = "Show the merged configuration from all sources (CLI flags > environment \
            > config file > defaults), or create a commented config file template."
    )]
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),

    /// Generate man pages
    Man(ManArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Bearer token required from non-loopback clients (remote mode)
    #[arg(long, env = "TABRELAY_TOKEN")]
    pub token: Option<String>,

    /// Origin prefix accepted on extension upgrades
    #[arg(long)]
    pub extension_origin: Option<String>,
}

#[derive(Args)]
pub struct BridgeArgs {
    /// Chrome DevTools host address
    #[arg(long, default_value = "127.0.0.1")]
    pub chrome_host: String,

    /// Chrome DevTools port number
    #[arg(long, default_value_t = 9222)]
    pub chrome_port: u16,

    /// Only attach tabs whose URL contains this substring
    #[arg(long = "match")]
    pub url_filter: Option<String>,
}

#[derive(Args)]
pub struct RecordArgs {
    #[command(subcommand)]
    pub command: RecordCommand,
}

#[derive(Subcommand)]
pub enum RecordCommand {
    /// Start recording a tab to a file
    Start(RecordStartArgs),
    /// Stop recording and finalize the file
    Stop(RecordSessionArgs),
    /// Query recorder state
    Status(RecordSessionArgs),
    /// Cancel recording and discard the partial file
    Cancel(RecordSessionArgs),
}

#[derive(Args)]
pub struct RecordStartArgs {
    /// Target session id (defaults to the first connected tab)
    #[arg(long)]
    pub session: Option<String>,

    /// Absolute output file path
    #[arg(long)]
    pub output: PathBuf,

    /// Capture frame rate
    #[arg(long)]
    pub frame_rate: Option<u32>,

    /// Video bitrate in bits per second
    #[arg(long)]
    pub video_bitrate: Option<u64>,

    /// Audio bitrate in bits per second
    #[arg(long)]
    pub audio_bitrate: Option<u64>,

    /// Capture tab audio as well
    #[arg(long)]
    pub audio: bool,
}

#[derive(Args)]
pub struct RecordSessionArgs {
    /// Target session id (defaults to the only active recording)
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the merged configuration
    Show,
    /// Create a commented config file template
    Init(ConfigInitArgs),
}

#[derive(Args)]
pub struct ConfigInitArgs {
    /// Target path (defaults to the platform config directory)
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    Elvish,
    Powershell,
}

#[derive(Args)]
pub struct ManArgs {
    /// Output directory for the generated pages
    #[arg(long, default_value = "man")]
    pub out_dir: PathBuf,
}
