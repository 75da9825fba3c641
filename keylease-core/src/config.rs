//! keylease service configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:8000";
    /// Default total lifetime of a key (seconds)
    pub const DEFAULT_LIFETIME: u64 = 300;
    /// Default lease window (seconds)
    pub const DEFAULT_LEASE_WINDOW: u64 = 60;
    /// Default time between reconciler passes (seconds)
    pub const DEFAULT_RECONCILE_INTERVAL: u64 = 10;
    /// Default redis endpoint
    pub static DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
    /// Default timeout for a single store call (milliseconds)
    pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
    /// Default storage prefix for key records
    pub static DEFAULT_KEY_PREFIX: &str = "api_key:";
    /// Default name of the free-key index
    pub static DEFAULT_FREE_INDEX_KEY: &str = "keylease:free";
    /// Default conditional-write attempts per record
    pub const DEFAULT_MAX_RETRIES: u32 = 5;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "keylease-worker";
    /// default log level. Can use this argument or KEYLEASE_LOG env var
    pub const DEFAULT_KEYLEASE_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";

    use std::{net::SocketAddr, time::Duration};

    use anyhow::{Result, bail};
    pub use clap::Parser;
    use clap::ValueEnum;

    /// where key records are kept
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StoreBackend {
        /// shared redis/keydb instance
        Redis,
        /// in-process store, lost on exit
        Memory,
    }

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "keylease", bin_name = "keylease", about, long_about = None)]
    /// parses from cli & environment var. keylease will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// the address the HTTP api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// total lifetime of a new key, and the extension added by keep-alive (seconds)
        #[clap(long, env, value_parser, default_value_t = DEFAULT_LIFETIME)]
        pub default_lifetime: u64,
        /// how long a lease is held before it is reclaimed (seconds)
        #[clap(long, env, value_parser, default_value_t = DEFAULT_LEASE_WINDOW)]
        pub lease_window: u64,
        /// time between reconciler passes (seconds)
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECONCILE_INTERVAL)]
        pub reconcile_interval: u64,
        /// where key records are kept
        #[clap(long, env, value_enum, default_value_t = StoreBackend::Redis)]
        pub store_backend: StoreBackend,
        /// redis endpoint, used with the redis backend
        #[clap(long, env, value_parser, default_value = DEFAULT_REDIS_URL)]
        pub redis_url: String,
        /// timeout for a single store call (milliseconds)
        #[clap(long, env, value_parser, default_value_t = DEFAULT_STORE_TIMEOUT_MS)]
        pub store_timeout_ms: u64,
        /// storage prefix for key records
        #[clap(long, env, value_parser, default_value = DEFAULT_KEY_PREFIX)]
        pub key_prefix: String,
        /// name of the sorted set holding free keys
        #[clap(long, env, value_parser, default_value = DEFAULT_FREE_INDEX_KEY)]
        pub free_index_key: String,
        /// retries after a lost conditional write; 0 still makes one attempt
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MAX_RETRIES)]
        pub max_retries: u32,
        /// Worker thread count, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_KEYLEASE_LOG)]
        pub keylease_log: String,
        /// log format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
    }

    impl Config {
        /// total lifetime as `Duration`
        pub fn default_lifetime(&self) -> Duration {
            Duration::from_secs(self.default_lifetime)
        }

        /// lease window as `Duration`
        pub fn lease_window(&self) -> Duration {
            Duration::from_secs(self.lease_window)
        }

        /// reconciler cadence as `Duration`
        pub fn reconcile_interval(&self) -> Duration {
            Duration::from_secs(self.reconcile_interval)
        }

        /// store call timeout as `Duration`
        pub fn store_timeout(&self) -> Duration {
            Duration::from_millis(self.store_timeout_ms)
        }

        /// reject values the service can't run with
        pub fn validate(&self) -> Result<()> {
            if self.default_lifetime == 0 {
                bail!("DEFAULT_LIFETIME must be greater than zero");
            }
            if self.lease_window == 0 {
                bail!("LEASE_WINDOW must be greater than zero");
            }
            if self.reconcile_interval == 0 {
                bail!("RECONCILE_INTERVAL must be greater than zero");
            }
            if self.store_timeout_ms == 0 {
                bail!("STORE_TIMEOUT_MS must be greater than zero");
            }
            if self.key_prefix.is_empty() {
                bail!("KEY_PREFIX must not be empty");
            }
            Ok(())
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for log output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// install the global subscriber
        pub fn parse(keylease_log: &str, log_frmt: &str) -> Result<Self> {
            // Log level comes from KEYLEASE_LOG
            let filter = EnvFilter::try_new(keylease_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
