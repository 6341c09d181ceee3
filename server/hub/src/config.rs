use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "rx-hub", about = "DMR network hub")]
pub struct Config {
    /// HBRP (MMDVM homebrew) listener
    #[arg(long, default_value = "0.0.0.0:62031")]
    pub hbrp_listen: String,

    /// OpenBridge peer listener
    #[arg(long, default_value = "0.0.0.0:62035")]
    pub openbridge_listen: String,

    #[arg(long, default_value = "0.0.0.0:9100")]
    pub metrics_listen: String,

    /// Dispatcher tasks draining the inbound HBRP topic
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Postgres connection string
    #[arg(long, env = "RX_DATABASE_URL")]
    pub database_url: String,
}
