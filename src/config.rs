use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use tracing::{info, warn};

use crate::address::parse_server_address;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub app: BindSettings,
    /// 静态主机表，精确匹配，优先级最高。
    #[serde(default, deserialize_with = "ordered_map")]
    pub hosts: Vec<(String, String)>,
    /// 命名上游链：链名 -> 按顺序尝试的服务器列表。
    #[serde(default, deserialize_with = "ordered_chains")]
    pub upstream_dns: Vec<(String, Vec<String>)>,
    /// 域名掩码 -> 链名，按文件顺序匹配，首个命中生效。
    #[serde(default, deserialize_with = "ordered_masks")]
    pub masked_dns: Vec<(String, String)>,
    #[serde(default)]
    pub dns_cache: DnsCacheSettings,
    /// 单个上游的超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindSettings {
    /// IPv4 监听地址，可选。
    #[serde(default)]
    pub v4_host: Option<String>,
    /// IPv6 监听地址，可选；与 IPv4 至少配置一个。
    #[serde(default)]
    pub v6_host: Option<String>,
    /// 监听端口，两个协议栈共用。
    #[serde(default = "default_port")]
    pub port: u32,
}

impl Default for BindSettings {
    fn default() -> Self {
        Self {
            v4_host: None,
            v6_host: None,
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsCacheSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_max_size")]
    pub max_size: i64,
    #[serde(default = "default_cache_max_ttl")]
    pub max_ttl: i64,
    #[serde(default = "default_cache_negative_ttl")]
    pub negative_ttl: i64,
}

impl Default for DnsCacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_cache_max_size(),
            max_ttl: default_cache_max_ttl(),
            negative_ttl: default_cache_negative_ttl(),
        }
    }
}

/// Parsed listen addresses; `port` is shared by both stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddrs {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
    pub port: u16,
}

impl BindSettings {
    pub fn listen_addrs(&self) -> Result<ListenAddrs> {
        if self.v4_host.is_none() && self.v6_host.is_none() {
            bail!("at least one of app.v4_host / app.v6_host must be set");
        }
        let port = u16::try_from(self.port)
            .ok()
            .with_context(|| format!("invalid app.port: {}", self.port))?;
        let v4 = self
            .v4_host
            .as_deref()
            .map(|h| {
                h.trim()
                    .parse::<Ipv4Addr>()
                    .with_context(|| format!("invalid app.v4_host: {:?}", h))
            })
            .transpose()?;
        let v6 = self
            .v6_host
            .as_deref()
            .map(|h| {
                h.trim()
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse::<Ipv6Addr>()
                    .with_context(|| format!("invalid app.v6_host: {:?}", h))
            })
            .transpose()?;
        Ok(ListenAddrs { v4, v6, port })
    }
}

impl AppConfig {
    /// 启动前校验，任何结构性错误都直接失败。
    pub fn validate(&self) -> Result<()> {
        self.app.listen_addrs()?;

        for (name, ip) in &self.hosts {
            if name.is_empty() {
                bail!("hosts: empty host name");
            }
            ip.trim()
                .parse::<IpAddr>()
                .with_context(|| format!("hosts.{}: invalid ip {:?}", name, ip))?;
        }

        for (chain, servers) in &self.upstream_dns {
            for server in servers {
                parse_server_address(server)
                    .with_context(|| format!("upstream_dns.{}", chain))?;
            }
        }

        for (mask, chain) in &self.masked_dns {
            if mask.is_empty() {
                bail!("masked_dns: empty mask");
            }
            if !self.upstream_dns.iter().any(|(name, _)| name == chain) {
                warn!(
                    target = "config",
                    mask = %mask,
                    chain = %chain,
                    "masked_dns references an unknown chain, matching names will get no answer"
                );
            }
        }

        if self.upstream_timeout_ms == 0 {
            bail!("invalid upstream_timeout_ms: 0");
        }

        let cache = &self.dns_cache;
        if cache.max_size <= 0 {
            bail!("invalid dns_cache.max_size: {}", cache.max_size);
        }
        if cache.max_ttl <= 0 {
            bail!("invalid dns_cache.max_ttl: {}", cache.max_ttl);
        }
        if cache.negative_ttl <= 0 {
            bail!("invalid dns_cache.negative_ttl: {}", cache.negative_ttl);
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate config file: {}", path.display()))?;

    info!(
        target = "config",
        hosts = cfg.hosts.len(),
        chains = cfg.upstream_dns.len(),
        masks = cfg.masked_dns.len(),
        cache_enabled = cfg.dns_cache.enabled,
        "config loaded"
    );
    Ok(cfg)
}

/// JSON 对象按文档顺序读入 `Vec`；重复键保留首次出现的位置，值以最后一次为准。
fn ordered_map<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct OrderedVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a JSON object")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut out: Vec<(String, V)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((key, value)) = map.next_entry::<String, V>()? {
                match out.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = value,
                    None => out.push((key, value)),
                }
            }
            Ok(out)
        }
    }

    deserializer.deserialize_map(OrderedVisitor(PhantomData))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChainServers {
    List(Vec<String>),
    /// 兼容 "ip:port,ip:port" 写法
    Joined(String),
}

impl ChainServers {
    fn into_servers(self) -> Vec<String> {
        let items: Vec<String> = match self {
            ChainServers::List(list) => list,
            ChainServers::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        };
        items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn ordered_chains<'de, D>(deserializer: D) -> Result<Vec<(String, Vec<String>)>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<(String, ChainServers)> = ordered_map(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, servers)| (name, servers.into_servers()))
        .collect())
}

fn ordered_masks<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<(String, String)> = ordered_map(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(mask, chain)| (strip_quotes(&mask).to_string(), chain))
        .collect())
}

fn strip_quotes(s: &str) -> &str {
    let s = s.strip_prefix(['"', '\'']).unwrap_or(s);
    s.strip_suffix(['"', '\'']).unwrap_or(s)
}


fn default_port() -> u32 {
    53
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_cache_max_size() -> i64 {
    1000
}

fn default_cache_max_ttl() -> i64 {
    86400
}

fn default_cache_negative_ttl() -> i64 {
    60
}
