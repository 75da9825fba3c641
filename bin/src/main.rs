#![allow(clippy::cognitive_complexity)]
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod startup_health;

use external_api::{ExternalApi, Health};
use key_store::{
    KeyStore,
    memory::MemoryStore,
    redis::{self, RedisConfig, RedisStore},
};
use keylease_core::{
    config::{
        cli::{self, Parser, StoreBackend},
        trace,
    },
    tokio::{self, runtime::Builder, signal, task::JoinError},
    tracing::*,
};
use lease_manager::{
    LeaseConfig, LeaseManager, Reconciler, RetryPolicy, manager::DEFAULT_CANDIDATE_BATCH,
};
use startup_health::verify_startup_subsystems;
use tracing_futures::Instrument;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // .env is applied before parsing so its values reach the cli
    let (config, dotenv_res) = load_config(None, std::env::args_os());
    let trace_config = trace::Config::parse(&config.keylease_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv_res {
        debug!(?err, ".env file not loaded");
    }
    config.validate().context("invalid configuration")?;

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move { exit_status(tokio::spawn(start(config)).await) })
}

/// Load `env_file` (or `.env` from the working directory) into the
/// environment, then parse the cli from `args`.
fn load_config<I, T>(env_file: Option<&Path>, args: I) -> (cli::Config, Result<(), dotenv::Error>)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let loaded = match env_file {
        Some(path) => dotenv::from_path(path),
        None => dotenv::dotenv().map(|_| ()),
    };
    (cli::Config::parse_from(args), loaded)
}

/// Log how the server task ended. Anything but a clean exit is an error so the
/// process exits non-zero.
fn exit_status(res: Result<Result<()>, JoinError>) -> Result<()> {
    match res {
        Err(err) => {
            error!(?err, "failed to start server");
            Err(anyhow!("server task failed: {err}"))
        }
        Ok(Err(err)) => {
            error!(?err, "exited with error");
            Err(err)
        }
        Ok(Ok(())) => {
            debug!("exiting...");
            Ok(())
        }
    }
}

async fn start(config: cli::Config) -> Result<()> {
    let lease_config = LeaseConfig {
        default_lifetime: config.default_lifetime(),
        lease_window: config.lease_window(),
        key_prefix: config.key_prefix.clone(),
        retry: RetryPolicy {
            max_retries: config.max_retries,
            ..RetryPolicy::default()
        },
        candidate_batch: DEFAULT_CANDIDATE_BATCH,
    };
    info!(backend = ?config.store_backend, ?lease_config, "lease configuration");

    match config.store_backend {
        StoreBackend::Memory => {
            warn!("using in-memory store, keys will not survive a restart");
            run(config, MemoryStore::new(), lease_config).await
        }
        StoreBackend::Redis => {
            let redis_config = RedisConfig {
                url: config.redis_url.clone(),
                pool_size: redis::DEFAULT_POOL_SIZE,
                timeout: config.store_timeout(),
                free_index_key: config.free_index_key.clone(),
            };
            debug!("connecting to redis");
            let store = RedisStore::connect(&redis_config)
                .await
                .context("failed to connect to redis")?;
            run(config, store, lease_config).await
        }
    }
}

/// Serve the pool from `store` until ctrl-c.
async fn run<S: KeyStore>(
    config: cli::Config,
    store: S,
    lease_config: LeaseConfig,
) -> Result<()> {
    let backend = format!("{:?}", config.store_backend).to_lowercase();
    let manager = Arc::new(LeaseManager::new(store, lease_config));
    // start external api for keys & healthchecks
    let api = ExternalApi::new(config.external_api, Arc::clone(&manager));

    let token = CancellationToken::new();
    let mut reconciler_task = Reconciler::new(
        Arc::clone(&manager),
        config.reconcile_interval(),
        token.clone(),
    )
    .spawn();

    let api_sender = api.sender();
    let mut api_guard = api.start(token.clone());

    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) =
        verify_startup_subsystems(&mut api_guard, &mut reconciler_task, &backend).await
    {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return Err(err);
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;
    info!(addr = %config.external_api, "keylease started");

    let api_exited = tokio::select! {
        res = shutdown_signal(token.clone()) => {
            if let Err(err) = res {
                error!(?err, "failed to listen for shutdown signal");
            }
            info!("shutting down");
            false
        }
        res = &mut api_guard => {
            error!(?res, "external API exited unexpectedly");
            true
        }
    };
    token.cancel();

    if !api_exited && let Err(err) = api_guard.await {
        error!(?err, "error waiting for web server API");
    }
    if let Err(err) = reconciler_task.await {
        error!(?err, "error waiting for reconciler task");
    }
    if api_exited {
        return Err(anyhow!("external API stopped before shutdown"));
    }
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c()
        .instrument(debug_span!("shutdown_signal"))
        .await
        .map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
