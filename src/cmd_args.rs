use clap::Parser;

/// PgSpanner: a pooling proxy for PostgreSQL clusters.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value_t = String::from("config.toml"), env)]
    pub config: String,

    /// Where to write the process id when the config does not name a file.
    #[arg(short, long, default_value_t = String::from("spanner.pid"), env)]
    pub pidfile: String,

    /// Disable the keep-alive supervisor and run components inline.
    #[arg(long, default_value_t = false, env)]
    pub nokeepalive: bool,
}

pub fn parse() -> Args {
    Args::parse()
}
