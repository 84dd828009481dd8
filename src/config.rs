use clap::Parser;

/// Service configuration. Every flag mirrors an environment variable so the
/// binary runs unmodified in containers and on the command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "webscout", about = "Web crawling and content extraction service")]
pub struct Config {
    /// HTTP bind port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Message bus seed URL (crawl events).
    #[arg(long, env = "BUS_URL", default_value = "redis://127.0.0.1:6379")]
    pub bus_url: String,

    /// Document store seed URL (job records).
    #[arg(long, env = "STORE_URL", default_value = "redis://127.0.0.1:6379")]
    pub store_url: String,

    /// API key required on authenticated routes. Empty disables auth.
    #[arg(long, env = "API_KEY", default_value = "")]
    pub api_key: String,

    /// Fingerprint catalog endpoint base.
    #[arg(
        long,
        env = "FINGERPRINT_API_URL",
        default_value = "https://headers.scrapeops.io/v1"
    )]
    pub fingerprint_api_url: String,

    /// API key for the fingerprint catalog. Empty disables refresh.
    #[arg(long, env = "FINGERPRINT_API_KEY", default_value = "")]
    pub fingerprint_api_key: String,
}

impl Config {
    /// A config suitable for tests: no auth, no upstream catalog.
    pub fn for_tests() -> Self {
        Config {
            port: 0,
            bus_url: String::new(),
            store_url: String::new(),
            api_key: String::new(),
            fingerprint_api_url: String::new(),
            fingerprint_api_key: String::new(),
        }
    }
}
