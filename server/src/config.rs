use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    pub server_name: String,
    pub database_url: String,
    pub backup_root: PathBuf,
    pub listen_port: u16,
    /// Process-wide cap on concurrently running backups.
    pub max_sim_backups: usize,
    /// Start/end hour of the nightly cleanup window.
    pub cleanup_window_start: u32,
    pub cleanup_window_end: u32,
    /// Writers pause and trigger urgent cleanup below this many free bytes.
    pub free_space_limit: u64,
    /// Socket idle deadline in seconds.
    pub network_timeout_secs: u64,
    /// Window for re-dialing a lost client connection, in seconds.
    pub reconnect_timeout_secs: u64,
    /// Per-client receive cap in bytes per second; 0 means unlimited.
    pub bandwidth_limit: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            server_name: std::env::var("SERVER_NAME").unwrap_or_else(|_| "packrat".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://packrat.db".to_string()),
            backup_root: std::env::var("PACKRAT_BACKUP_ROOT")
                .unwrap_or_else(|_| "./data/backups".to_string())
                .into(),
            listen_port: std::env::var("PACKRAT_PORT")
                .unwrap_or_else(|_| "35623".to_string())
                .parse()?,
            max_sim_backups: std::env::var("PACKRAT_MAX_SIM_BACKUPS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            cleanup_window_start: std::env::var("PACKRAT_CLEANUP_WINDOW_START")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            cleanup_window_end: std::env::var("PACKRAT_CLEANUP_WINDOW_END")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            free_space_limit: std::env::var("PACKRAT_FREE_SPACE_LIMIT")
                .unwrap_or_else(|_| (1000u64 * 1024 * 1024).to_string())
                .parse()?,
            network_timeout_secs: std::env::var("PACKRAT_NETWORK_TIMEOUT")
                .unwrap_or_else(|_| "120".to_string())
                .parse()?,
            reconnect_timeout_secs: std::env::var("PACKRAT_RECONNECT_TIMEOUT")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            bandwidth_limit: std::env::var("PACKRAT_BANDWIDTH_LIMIT")
                .unwrap_or_else(|_| "0".to_string())
                .parse()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_name: "packrat".to_string(),
            database_url: "sqlite://packrat.db".to_string(),
            backup_root: PathBuf::from("./data/backups"),
            listen_port: 35623,
            max_sim_backups: 10,
            cleanup_window_start: 3,
            cleanup_window_end: 4,
            free_space_limit: 1000 * 1024 * 1024,
            network_timeout_secs: 120,
            reconnect_timeout_secs: 300,
            bandwidth_limit: 0,
        }
    }
}
