use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::config::ListenAddrs;
use crate::engine::Engine;

const MAX_DATAGRAM: usize = 4096;
const SOCKET_BUFFER: usize = 4 * 1024 * 1024;

pub struct Server {
    listen: ListenAddrs,
    engine: Engine,
}

impl Server {
    pub fn new(listen: ListenAddrs, engine: Engine) -> Self {
        Self { listen, engine }
    }

    /// 先绑定 IPv6（V6ONLY），再绑定 IPv4。端口为 0 时 IPv4 复用 IPv6 分到的端口。
    pub fn bind(&self) -> Result<BoundServer> {
        let mut sockets = Vec::with_capacity(2);
        let mut port = self.listen.port;

        if let Some(v6) = self.listen.v6 {
            let socket = bind_udp(SocketAddr::new(IpAddr::V6(v6), port), true)?;
            if port == 0 {
                port = socket.local_addr().context("read v6 local addr")?.port();
            }
            sockets.push(Arc::new(socket));
        }
        if let Some(v4) = self.listen.v4 {
            let socket = bind_udp(SocketAddr::new(IpAddr::V4(v4), port), false)?;
            sockets.push(Arc::new(socket));
        }

        Ok(BoundServer {
            sockets,
            engine: self.engine.clone(),
        })
    }

    pub async fn run(self) -> Result<()> {
        self.bind()?.serve().await
    }
}

pub struct BoundServer {
    sockets: Vec<Arc<UdpSocket>>,
    engine: Engine,
}

impl BoundServer {
    #[cfg(test)]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    pub async fn serve(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.sockets.len());
        for socket in self.sockets {
            let local = socket.local_addr().context("read local addr")?;
            info!(event = "listening", addr = %local, "dns server started");
            let engine = self.engine.clone();
            handles.push(tokio::spawn(run_udp_listener(socket, engine)));
        }
        for handle in handles {
            handle.await.context("udp listener task")?;
        }
        Ok(())
    }
}

fn bind_udp(addr: SocketAddr, v6only: bool) -> Result<UdpSocket> {
    let std_socket = match create_udp_socket(addr, v6only) {
        Ok(socket) => socket,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            error!(event = "bind_failed", addr = %addr, "address already in use");
            return Err(err).with_context(|| format!("bind {}: address in use", addr));
        }
        Err(err) => {
            error!(event = "bind_failed", addr = %addr, error = %err);
            return Err(err).with_context(|| format!("bind {}", addr));
        }
    };
    UdpSocket::from_std(std_socket).with_context(|| format!("register socket {}", addr))
}

fn create_udp_socket(addr: SocketAddr, v6only: bool) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if v6only {
        socket.set_only_v6(true)?;
    }
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// 每个数据报在独立任务中处理，应答从接收它的 socket 发回。
async fn run_udp_listener(socket: Arc<UdpSocket>, engine: Engine) {
    let mut buf = BytesMut::with_capacity(MAX_DATAGRAM);
    loop {
        buf.clear();
        buf.reserve(MAX_DATAGRAM);
        match socket.recv_buf_from(&mut buf).await {
            Ok((_, peer)) => {
                let packet = buf.split().freeze();
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    let resp = engine.handle_packet(&packet, peer).await;
                    if let Err(err) = socket.send_to(&resp, peer).await {
                        warn!(event = "send_failed", peer = %peer, error = %err);
                    }
                });
            }
            // 继续接收，不退出
            Err(err) => warn!(event = "recv_failed", error = %err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DnsCache, shared};
    use crate::config::AppConfig;
    use crate::matcher::RuntimeOptions;
    use crate::proto_utils::build_query;
    use crate::upstream::UdpUpstream;
    use hickory_proto::op::{Message, MessageType, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record};
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use serde_json::json;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn loopback() -> ListenAddrs {
        ListenAddrs {
            v4: Some(Ipv4Addr::LOCALHOST),
            v6: None,
            port: 0,
        }
    }

    fn engine(raw: serde_json::Value, cache: bool) -> Engine {
        let cfg: AppConfig = serde_json::from_value(raw).expect("parse");
        let options = Arc::new(RuntimeOptions::from_config(&cfg).expect("runtime"));
        let upstream = Arc::new(UdpUpstream::new(Duration::from_millis(500)));
        let engine = Engine::new(options, upstream);
        if cache {
            engine.with_cache(shared(DnsCache::new(100, 3600, 60).unwrap()))
        } else {
            engine
        }
    }

    async fn start(raw: serde_json::Value, cache: bool) -> SocketAddr {
        let bound = Server::new(loopback(), engine(raw, cache)).bind().expect("bind");
        let addr = bound.local_addrs()[0];
        tokio::spawn(bound.serve());
        addr
    }

    /// 发送一个数据报，返回应答及其来源地址
    async fn exchange(server: SocketAddr, packet: &[u8]) -> (Message, SocketAddr) {
        let local = if server.is_ipv6() { "[::1]:0" } else { "127.0.0.1:0" };
        let client = UdpSocket::bind(local).await.unwrap();
        client.send_to(packet, server).await.unwrap();
        let mut buf = [0u8; 1024];
        let (len, from) =
            tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
                .await
                .expect("reply in time")
                .unwrap();
        (Message::from_bytes(&buf[..len]).expect("decode reply"), from)
    }

    async fn ask(server: SocketAddr, packet: &[u8]) -> Message {
        exchange(server, packet).await.0
    }

    /// 计数的假上游，每个查询回一条 A 记录
    async fn counting_upstream(ip: Ipv4Addr, hits: Arc<AtomicUsize>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                hits.fetch_add(1, Ordering::SeqCst);
                let req = Message::from_bytes(&buf[..len]).unwrap();
                let mut resp = Message::new();
                resp.set_id(req.id());
                resp.set_message_type(MessageType::Response);
                resp.add_queries(req.queries().iter().cloned());
                let name = req.queries()[0].name().clone();
                resp.add_answer(Record::from_rdata(name, 120, RData::A(A(ip))));
                let _ = socket.send_to(&resp.to_bytes().unwrap(), peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn answers_from_hosts() {
        let server = start(json!({ "hosts": { "a.test": "10.0.0.1" } }), false).await;
        let resp = ask(server, &build_query(0x0101, "a.test").unwrap()).await;
        assert_eq!(resp.id(), 0x0101);
        assert!(resp.authoritative());
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(resp.answers()[0].ttl(), 300);
        assert_eq!(resp.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::new(10, 0, 0, 1)))));
    }

    #[tokio::test]
    async fn forwards_once_then_serves_from_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let upstream = counting_upstream(Ipv4Addr::new(93, 184, 216, 34), hits.clone()).await;
        let server = start(
            json!({
                "upstream_dns": { "c1": [upstream.to_string()] },
                "masked_dns": { "*.example.com": "c1" }
            }),
            true,
        )
        .await;

        for id in [0x0a01, 0x0a02] {
            let resp = ask(server, &build_query(id, "x.example.com").unwrap()).await;
            assert_eq!(resp.id(), id);
            assert_eq!(resp.response_code(), ResponseCode::NoError);
            assert_eq!(resp.answers().len(), 1);
            assert_eq!(
                resp.answers()[0].data(),
                Some(&RData::A(A(Ipv4Addr::new(93, 184, 216, 34))))
            );
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unresolvable_name_gets_formerr() {
        let server = start(json!({}), true).await;
        let resp = ask(server, &build_query(0x0b0b, "nothing.test").unwrap()).await;
        assert_eq!(resp.id(), 0x0b0b);
        assert_eq!(resp.response_code(), ResponseCode::FormErr);
        assert!(resp.answers().is_empty());
    }

    #[tokio::test]
    async fn malformed_datagram_gets_formerr() {
        let server = start(json!({}), false).await;
        let resp = ask(server, &[0xab, 0xcd, 0xff]).await;
        assert_eq!(resp.id(), 0xabcd);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn dual_stack_sockets_share_port_and_reply_in_place() {
        let listen = ListenAddrs {
            v4: Some(Ipv4Addr::LOCALHOST),
            v6: Some(Ipv6Addr::LOCALHOST),
            port: 0,
        };
        let hosts = json!({ "hosts": { "a.test": "10.0.0.1" } });
        let bound = Server::new(listen, engine(hosts, false)).bind().expect("bind");
        let addrs = bound.local_addrs();
        assert_eq!(addrs.len(), 2);
        // IPv6 先绑定
        assert!(addrs[0].is_ipv6());
        assert!(addrs[1].is_ipv4());
        assert_ne!(addrs[0].port(), 0);
        assert_eq!(addrs[0].port(), addrs[1].port());
        tokio::spawn(bound.serve());

        for (i, addr) in addrs.into_iter().enumerate() {
            let id = 0x0c00 + i as u16;
            let (resp, from) = exchange(addr, &build_query(id, "a.test").unwrap()).await;
            assert_eq!(from, addr);
            assert_eq!(resp.id(), id);
            assert_eq!(resp.response_code(), ResponseCode::NoError);
            assert_eq!(resp.answers().len(), 1);
        }
    }

    #[tokio::test]
    async fn occupied_port_reports_address_in_use() {
        let occupied = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let listen = ListenAddrs {
            port,
            ..loopback()
        };
        let err = Server::new(listen, engine(json!({}), false))
            .bind()
            .err()
            .expect("port already bound");
        assert!(err.to_string().contains("address in use"), "{:#}", err);
        let io = err.downcast_ref::<io::Error>().expect("io error");
        assert_eq!(io.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn other_bind_errors_are_not_reported_as_in_use() {
        // TEST-NET-1，不属于本机
        let listen = ListenAddrs {
            v4: Some(Ipv4Addr::new(192, 0, 2, 1)),
            v6: None,
            port: 0,
        };
        let err = Server::new(listen, engine(json!({}), false))
            .bind()
            .err()
            .expect("non-local address");
        assert!(err.to_string().starts_with("bind 192.0.2.1:0"), "{:#}", err);
        assert!(!err.to_string().contains("address in use"), "{:#}", err);
    }
}
