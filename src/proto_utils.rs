use std::net::IpAddr;
use std::str::FromStr;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

/// hosts 表合成记录使用的固定 TTL。
pub const STATIC_ANSWER_TTL: u32 = 300;

const HEADER_LEN: usize = 12;

/// 尽力从原始字节读取事务 ID，不足两字节时返回 0。
#[inline]
pub fn extract_tx_id(packet: &[u8]) -> u16 {
    match packet {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}

/// Query names go through the pipeline without the trailing root dot.
pub fn normalize_qname(name: &Name) -> String {
    let mut s = name.to_string();
    if s.len() > 1 && s.ends_with('.') {
        s.pop();
    }
    s
}

pub fn build_query(id: u16, qname: &str) -> anyhow::Result<Vec<u8>> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(qname)?, RecordType::A));
    Ok(encode(&msg)?.to_vec())
}

pub fn build_success_response(req: &Message, answers: Vec<Record>) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_authoritative(true);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);
    msg.add_queries(req.queries().iter().cloned());
    for ans in answers {
        msg.add_answer(ans);
    }
    encode(&msg)
}

pub fn build_error_response(
    id: u16,
    queries: &[Query],
    recursion_desired: bool,
) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(recursion_desired);
    msg.set_response_code(ResponseCode::FormErr);
    msg.add_queries(queries.iter().cloned());
    encode(&msg)
}

/// 编码失败时的兜底：仅含头部的 FORMERR 响应（QR=1, RCODE=1）。
pub fn raw_error_header(id: u16) -> Bytes {
    let mut out = [0u8; HEADER_LEN];
    out[..2].copy_from_slice(&id.to_be_bytes());
    out[2] = 0x80;
    out[3] = ResponseCode::FormErr.low();
    Bytes::copy_from_slice(&out)
}

pub fn make_static_ip_answer(name: Name, ip: IpAddr) -> Record {
    let rdata = match ip {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    Record::from_rdata(name, STATIC_ANSWER_TTL, rdata)
}

#[inline]
pub fn min_answer_ttl(answers: &[Record]) -> Option<u32> {
    answers.iter().map(|r| r.ttl()).min()
}

#[inline]
fn encode(msg: &Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}
