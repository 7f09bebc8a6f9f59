use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::address::ServerAddress;
use crate::config::AppConfig;

/// 编译后的域名掩码。单独的 `*` 无条件匹配。
#[derive(Debug, Clone)]
pub enum DnsMask {
    Any,
    Pattern { raw: String, regex: Regex },
}

impl DnsMask {
    pub fn new(mask: &str) -> Result<Self> {
        if mask == "*" {
            return Ok(DnsMask::Any);
        }
        let body = mask
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("(?i)^{}$", body))
            .with_context(|| format!("compile dns mask {:?}", mask))?;
        Ok(DnsMask::Pattern {
            raw: mask.to_string(),
            regex,
        })
    }

    #[inline]
    pub fn is_match(&self, qname: &str) -> bool {
        match self {
            DnsMask::Any => true,
            DnsMask::Pattern { regex, .. } => regex.is_match(qname),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DnsMask::Any => "*",
            DnsMask::Pattern { raw, .. } => raw,
        }
    }
}

/// One-shot glob match without keeping the compiled pattern.
#[allow(dead_code)]
pub fn match_dns_mask(qname: &str, mask: &str) -> bool {
    DnsMask::new(mask)
        .map(|m| m.is_match(qname))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct MaskRoute {
    pub mask: DnsMask,
    pub chain: String,
}

/// Options compiled for the resolution pipeline.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub hosts: FxHashMap<String, IpAddr>,
    /// 按配置顺序，首个命中生效
    pub masks: Vec<MaskRoute>,
    pub chains: Vec<(String, Vec<ServerAddress>)>,
    pub upstream_timeout: Duration,
}

impl RuntimeOptions {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let mut hosts = FxHashMap::default();
        for (name, ip) in &cfg.hosts {
            let ip: IpAddr = ip
                .trim()
                .parse()
                .with_context(|| format!("hosts.{}: invalid ip {:?}", name, ip))?;
            hosts.insert(name.clone(), ip);
        }

        let mut chains = Vec::with_capacity(cfg.upstream_dns.len());
        for (name, servers) in &cfg.upstream_dns {
            let parsed = servers
                .iter()
                .map(|s| s.parse::<ServerAddress>())
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("upstream_dns.{}", name))?;
            chains.push((name.clone(), parsed));
        }

        let mut masks = Vec::with_capacity(cfg.masked_dns.len());
        for (mask, chain) in &cfg.masked_dns {
            masks.push(MaskRoute {
                mask: DnsMask::new(mask)?,
                chain: chain.clone(),
            });
        }

        Ok(Self {
            hosts,
            masks,
            chains,
            upstream_timeout: Duration::from_millis(cfg.upstream_timeout_ms),
        })
    }

    #[inline]
    pub fn host(&self, qname: &str) -> Option<IpAddr> {
        self.hosts.get(qname).copied()
    }

    #[inline]
    pub fn first_match(&self, qname: &str) -> Option<&MaskRoute> {
        self.masks.iter().find(|route| route.mask.is_match(qname))
    }

    pub fn chain(&self, name: &str) -> Option<&[ServerAddress]> {
        self.chains
            .iter()
            .find(|(chain, _)| chain == name)
            .map(|(_, servers)| servers.as_slice())
    }
}
