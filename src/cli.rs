use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "tqdbproxy", about)]
pub struct Cli {
    /// Path to the TOML config file. Falls back to `TQDBPROXY_CONFIG`, then
    /// `config/tqdbproxy.toml`, when omitted.
    #[arg(long)]
    pub config: Option<String>,

    /// Override the configured log level (e.g. "debug", "tqdbproxy=trace").
    #[arg(long)]
    pub log_level: Option<String>,

    /// Tokio worker threads.
    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}
