use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::Record;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::address::parse_server_address;
use crate::proto_utils::{build_query, extract_tx_id};

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_millis(2000);

const MAX_RESPONSE: usize = 4096;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send one `A` query for `qname` to `server` (`ip[:port]`).
    ///
    /// `Ok(None)` covers timeouts, network failures and empty answer sections;
    /// only an unparseable `server` is an error.
    async fn resolve(&self, qname: &str, server: &str) -> Result<Option<Vec<Record>>>;
}

/// 每次查询使用独立的临时 socket，发一次、收一次，不重试。
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for UdpUpstream {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_TIMEOUT)
    }
}

#[async_trait]
impl UpstreamClient for UdpUpstream {
    async fn resolve(&self, qname: &str, server: &str) -> Result<Option<Vec<Record>>> {
        let target = parse_server_address(server)?.socket_addr();
        let id: u16 = rand::random();
        let query = build_query(id, qname)?;

        // socket 在任何返回路径上随作用域结束而关闭
        let socket = match bind_transient(target).await {
            Ok(s) => s,
            Err(err) => {
                warn!(event = "upstream_bind_failed", upstream = %target, error = %err);
                return Ok(None);
            }
        };
        if let Err(err) = socket.send_to(&query, target).await {
            debug!(
                event = "upstream_send_failed",
                upstream = %target,
                qname = %qname,
                error = %err
            );
            return Ok(None);
        }

        let mut buf = [0u8; MAX_RESPONSE];
        let recv = timeout(self.timeout, async {
            loop {
                let (len, src) = socket.recv_from(&mut buf).await?;
                // 忽略来源或 ID 不符的数据报
                if src != target || extract_tx_id(&buf[..len]) != id {
                    continue;
                }
                return Ok::<_, std::io::Error>(len);
            }
        })
        .await;

        let len = match recv {
            Ok(Ok(len)) => len,
            Ok(Err(err)) => {
                debug!(
                    event = "upstream_recv_failed",
                    upstream = %target,
                    qname = %qname,
                    error = %err
                );
                return Ok(None);
            }
            Err(_) => {
                debug!(
                    event = "upstream_timeout",
                    upstream = %target,
                    qname = %qname,
                    timeout_ms = self.timeout.as_millis() as u64
                );
                return Ok(None);
            }
        };

        let msg = match Message::from_bytes(&buf[..len]) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(event = "upstream_decode_failed", upstream = %target, error = %err);
                return Ok(None);
            }
        };
        if msg.answers().is_empty() {
            debug!(
                event = "upstream_empty",
                upstream = %target,
                qname = %qname,
                rcode = ?msg.response_code()
            );
            return Ok(None);
        }
        Ok(Some(msg.answers().to_vec()))
    }
}

async fn bind_transient(target: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(local).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::time::Instant;

    /// 本地假上游：对每个查询回一次，`answer` 为 None 时回空应答。
    async fn spawn_fake_upstream(answer: Option<Ipv4Addr>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let req = Message::from_bytes(&buf[..len]).expect("decode query");
                let mut resp = Message::new();
                resp.set_id(req.id());
                resp.set_message_type(MessageType::Response);
                resp.add_queries(req.queries().iter().cloned());
                if let Some(ip) = answer {
                    let name = req.queries()[0].name().clone();
                    resp.add_answer(Record::from_rdata(name, 120, RData::A(A(ip))));
                }
                let bytes = resp.to_bytes().expect("encode");
                let _ = socket.send_to(&bytes, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn returns_answers_from_upstream() {
        let addr = spawn_fake_upstream(Some(Ipv4Addr::new(93, 184, 216, 34))).await;
        let client = UdpUpstream::new(Duration::from_millis(500));

        let answers = client
            .resolve("x.example.com", &addr.to_string())
            .await
            .expect("resolve")
            .expect("answers");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].record_type(), RecordType::A);
        assert_eq!(answers[0].ttl(), 120);
        assert_eq!(answers[0].data(), Some(&RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))));
    }

    #[tokio::test]
    async fn empty_answer_section_is_not_found() {
        let addr = spawn_fake_upstream(None).await;
        let client = UdpUpstream::new(Duration::from_millis(500));
        let res = client.resolve("nx.example.com", &addr.to_string()).await;
        assert!(matches!(res, Ok(None)));
    }

    #[tokio::test]
    async fn silent_upstream_times_out_as_not_found() {
        // 绑定但从不应答
        let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = silent.local_addr().unwrap();
        let client = UdpUpstream::new(Duration::from_millis(100));

        let started = Instant::now();
        let res = client.resolve("slow.test", &addr.to_string()).await;
        assert!(matches!(res, Ok(None)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        drop(silent);
    }

    #[tokio::test]
    async fn invalid_address_is_an_error() {
        let client = UdpUpstream::default();
        assert!(client.resolve("a.test", ":53").await.is_err());
        assert!(client.resolve("a.test", "").await.is_err());
    }
}
