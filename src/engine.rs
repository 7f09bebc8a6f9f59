use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::Record;
use hickory_proto::serialize::binary::BinDecodable;
use tracing::{debug, error, info, trace, warn};

use crate::address::ServerAddress;
use crate::cache::{CacheLookup, DnsCacheInterface, SharedCache};
use crate::matcher::RuntimeOptions;
use crate::proto_utils::{
    build_error_response, build_success_response, extract_tx_id, make_static_ip_answer,
    min_answer_ttl, normalize_qname, raw_error_header,
};
use crate::upstream::UpstreamClient;

/// 实际给出应答的来源 / Where an answer actually came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealSource {
    Hosts,
    Cache,
    Upstream(ServerAddress),
}

impl fmt::Display for RealSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealSource::Hosts => f.write_str("hosts"),
            RealSource::Cache => f.write_str("cache"),
            RealSource::Upstream(addr) => addr.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnswerSource {
    /// masked_dns 中命中的链名，hosts 或无掩码命中时为 None
    pub masked_dns: Option<String>,
    /// None when nothing answered
    pub real_source: Option<RealSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Host(IpAddr),
    Records(Vec<Record>),
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub result: Resolution,
    pub answer_source: AnswerSource,
}

#[derive(Clone)]
pub struct Engine {
    options: Arc<RuntimeOptions>,
    cache: Option<SharedCache>,
    upstream: Arc<dyn UpstreamClient>,
}

impl Engine {
    pub fn new(options: Arc<RuntimeOptions>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self {
            options,
            cache: None,
            upstream,
        }
    }

    /// Attach the resolution cache; without one the cache steps are skipped.
    pub fn with_cache(mut self, cache: SharedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[cfg(test)]
    pub fn cache(&self) -> Option<&SharedCache> {
        self.cache.as_ref()
    }

    /// 处理一个数据报，总是返回恰好一个响应 / Always yields exactly one reply
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Bytes {
        let start = Instant::now();
        trace!(event = "dns_request", peer = %peer, len = packet.len());

        let req = match Message::from_bytes(packet) {
            Ok(req) => req,
            Err(err) => {
                let id = extract_tx_id(packet);
                warn!(
                    event = "decode_failed",
                    peer = %peer,
                    len = packet.len(),
                    tx_id = id,
                    error = %err
                );
                return error_reply(id, &[], false);
            }
        };

        let Some(query) = req.queries().first() else {
            warn!(event = "empty_question", peer = %peer, tx_id = req.id());
            return error_reply(req.id(), &[], req.recursion_desired());
        };
        let qname = normalize_qname(query.name());

        let lookup = self.get_ip(&qname).await;
        let source = lookup
            .answer_source
            .real_source
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "none".to_string());
        let masked_dns = lookup.answer_source.masked_dns.as_deref().unwrap_or("-");

        let answers = match lookup.result {
            Resolution::Host(ip) => vec![make_static_ip_answer(query.name().clone(), ip)],
            Resolution::Records(records) => records,
            Resolution::NotFound => {
                info!(
                    event = "dns_response",
                    qname = %qname,
                    qtype = ?query.query_type(),
                    source = %source,
                    masked_dns = %masked_dns,
                    answers = 0,
                    latency_ms = start.elapsed().as_millis() as u64,
                    peer = %peer,
                    "no answer"
                );
                return error_reply(req.id(), req.queries(), req.recursion_desired());
            }
        };

        info!(
            event = "dns_response",
            qname = %qname,
            qtype = ?query.query_type(),
            source = %source,
            masked_dns = %masked_dns,
            answers = answers.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            peer = %peer,
            "answered"
        );
        match build_success_response(&req, answers) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(event = "encode_failed", qname = %qname, error = %err);
                error_reply(req.id(), req.queries(), req.recursion_desired())
            }
        }
    }

    /// Resolution pipeline: hosts, then cache, then the first matching mask's chain.
    pub async fn get_ip(&self, qname: &str) -> LookupResult {
        if let Some(ip) = self.options.host(qname) {
            debug!(event = "hosts_hit", qname = %qname, ip = %ip);
            return LookupResult {
                result: Resolution::Host(ip),
                answer_source: AnswerSource {
                    masked_dns: None,
                    real_source: Some(RealSource::Hosts),
                },
            };
        }

        match self.with_cache_locked(|c| c.get(qname)) {
            Some(CacheLookup::Hit(answers)) => {
                debug!(event = "cache_hit", qname = %qname, answers = answers.len());
                return LookupResult {
                    result: Resolution::Records(answers),
                    answer_source: AnswerSource {
                        masked_dns: self.masked_chain_name(qname),
                        real_source: Some(RealSource::Cache),
                    },
                };
            }
            Some(CacheLookup::Negative) => {
                debug!(event = "cache_negative_hit", qname = %qname);
                return LookupResult {
                    result: Resolution::NotFound,
                    answer_source: AnswerSource {
                        masked_dns: self.masked_chain_name(qname),
                        real_source: Some(RealSource::Cache),
                    },
                };
            }
            Some(CacheLookup::Miss) => trace!(event = "cache_miss", qname = %qname),
            None => {}
        }

        let (masked_dns, answered) = self.query_masked_chain(qname).await;
        match answered {
            Some((server, answers)) => {
                if let Some(ttl) = min_answer_ttl(&answers) {
                    self.with_cache_locked(|c| c.set(qname, &answers, i64::from(ttl)));
                }
                LookupResult {
                    result: Resolution::Records(answers),
                    answer_source: AnswerSource {
                        masked_dns,
                        real_source: Some(RealSource::Upstream(server)),
                    },
                }
            }
            None => {
                if self.with_cache_locked(|c| c.set_negative(qname, None)).is_some() {
                    debug!(event = "cache_negative_store", qname = %qname);
                }
                LookupResult {
                    result: Resolution::NotFound,
                    answer_source: AnswerSource {
                        masked_dns,
                        real_source: None,
                    },
                }
            }
        }
    }

    /// 只尝试首个命中的掩码：链缺失或为空时直接放弃，不会回退到后续掩码。
    /// 链内服务器按顺序逐个尝试，首个返回应答者胜出。
    async fn query_masked_chain(
        &self,
        qname: &str,
    ) -> (Option<String>, Option<(ServerAddress, Vec<Record>)>) {
        let Some(route) = self.options.first_match(qname) else {
            debug!(event = "no_mask_matched", qname = %qname);
            return (None, None);
        };
        let chain_name = route.chain.clone();
        debug!(
            event = "mask_matched",
            qname = %qname,
            mask = %route.mask.as_str(),
            chain = %chain_name
        );

        let servers = match self.options.chain(&route.chain) {
            Some(servers) if !servers.is_empty() => servers,
            _ => {
                warn!(
                    event = "chain_unavailable",
                    qname = %qname,
                    chain = %chain_name,
                    "chain missing or empty"
                );
                return (Some(chain_name), None);
            }
        };

        for server in servers {
            let attempt = Instant::now();
            match self.upstream.resolve(qname, &server.to_string()).await {
                Ok(Some(answers)) => {
                    debug!(
                        event = "upstream_answer",
                        qname = %qname,
                        upstream = %server,
                        answers = answers.len(),
                        upstream_ms = attempt.elapsed().as_millis() as u64
                    );
                    return (Some(chain_name), Some((*server, answers)));
                }
                Ok(None) => {
                    debug!(
                        event = "upstream_no_answer",
                        qname = %qname,
                        upstream = %server,
                        chain = %chain_name
                    );
                }
                Err(err) => {
                    error!(
                        event = "upstream_error",
                        qname = %qname,
                        upstream = %server,
                        error = %err
                    );
                }
            }
        }
        (Some(chain_name), None)
    }

    fn masked_chain_name(&self, qname: &str) -> Option<String> {
        self.options.first_match(qname).map(|route| route.chain.clone())
    }

    /// 锁从不跨越 await 持有
    fn with_cache_locked<R>(
        &self,
        f: impl FnOnce(&mut (dyn DnsCacheInterface + 'static)) -> R,
    ) -> Option<R> {
        let cache = self.cache.as_ref()?;
        let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut *guard))
    }
}

fn error_reply(id: u16, queries: &[Query], recursion_desired: bool) -> Bytes {
    build_error_response(id, queries, recursion_desired).unwrap_or_else(|err| {
        error!(event = "encode_failed", tx_id = id, error = %err, "falling back to bare header");
        raw_error_header(id)
    })
}
