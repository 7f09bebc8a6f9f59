mod address;
mod cache;
mod config;
mod engine;
mod matcher;
mod proto_utils;
mod server;
mod upstream;

use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::{DnsCache, SharedCache, shared};
use crate::config::load_config;
use crate::engine::Engine;
use crate::matcher::RuntimeOptions;
use crate::server::Server;
use crate::upstream::UdpUpstream;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Caching DNS forwarder with per-domain upstream chains",
    long_about = None
)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/app.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 以 JSON 格式输出日志
    #[arg(long = "json-logs", default_value_t = false)]
    json_logs: bool,
    /// 缓存统计日志间隔（秒），0 表示关闭
    #[arg(long = "stats-interval", default_value_t = 300)]
    stats_interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_logs);

    let cfg = load_config(&args.config).context("load config")?;
    let listen = cfg.app.listen_addrs().context("parse listen addrs")?;
    let options = Arc::new(RuntimeOptions::from_config(&cfg).context("compile options")?);
    let upstream = Arc::new(UdpUpstream::new(options.upstream_timeout));

    let mut engine = Engine::new(options, upstream);
    if cfg.dns_cache.enabled {
        let settings = &cfg.dns_cache;
        let cache = DnsCache::new(settings.max_size, settings.max_ttl, settings.negative_ttl)
            .context("create dns cache")?;
        let cache = shared(cache);
        if args.stats_interval > 0 {
            spawn_stats_reporter(cache.clone(), Duration::from_secs(args.stats_interval));
        }
        engine = engine.with_cache(cache);
    }

    info!(
        v4 = ?listen.v4,
        v6 = ?listen.v6,
        port = listen.port,
        cache_enabled = cfg.dns_cache.enabled,
        "starting dns forwarder"
    );
    Server::new(listen, engine).run().await
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(false).with_ansi(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
}

fn spawn_stats_reporter(cache: SharedCache, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // 首个 tick 立即触发，跳过
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = cache.lock().unwrap_or_else(PoisonError::into_inner).stats();
            info!(
                event = "cache_stats",
                size = stats.size,
                max_size = stats.max_size,
                hits = stats.hits,
                misses = stats.misses,
                negative_hits = stats.negative_hits,
                evictions = stats.evictions
            );
        }
    });
}
