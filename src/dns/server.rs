//! UDP DNS transport

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, MX};
use hickory_proto::rr::{Name, RData, Record};
use std::future::Future;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

use super::policy::{AnswerData, DnsAnswer, DnsPolicy, DnsQuery};
use super::upstream::UpstreamResolver;
use crate::error::{Error, Result};

/// TTL carried by every answer record
pub const ANSWER_TTL: u32 = 60;

const MAX_DATAGRAM: usize = 4096;

/// Serves [`DnsPolicy`] answers over UDP
pub struct DnsServer<U> {
    socket: Arc<UdpSocket>,
    policy: Arc<DnsPolicy<U>>,
}

impl<U: UpstreamResolver> DnsServer<U> {
    /// Bind the listening socket. Failure here is fatal to startup.
    pub async fn bind(addr: SocketAddr, policy: Arc<DnsPolicy<U>>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::initialization(format!("Failed to bind DNS on {}: {}", addr, e)))?;
        Ok(Self {
            socket: Arc::new(socket),
            policy,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer queries until `shutdown` resolves. Each datagram is handled in
    /// its own task so a slow upstream lookup only delays its own reply.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("DNS server stopping");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to receive DNS datagram");
                            continue;
                        }
                    };

                    let payload = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let policy = self.policy.clone();
                    tokio::spawn(async move {
                        let Some(reply) = respond(&policy, &payload).await else {
                            return;
                        };
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            tracing::debug!(peer = %peer, error = %e, "Failed to send DNS reply");
                        }
                    });
                }
            }
        }
    }
}

/// Build the wire reply for one request datagram.
///
/// Only the first question is answered. Returns `None` for datagrams that
/// are not DNS queries at all.
pub async fn respond<U: UpstreamResolver>(policy: &DnsPolicy<U>, payload: &[u8]) -> Option<Vec<u8>> {
    let request = match Message::from_vec(payload) {
        Ok(message) if message.message_type() == MessageType::Query => message,
        Ok(_) => return None,
        Err(e) => {
            tracing::debug!(error = %e, "Dropping malformed DNS datagram");
            return None;
        }
    };

    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);

    let Some(question) = request.queries().first() else {
        response.set_response_code(ResponseCode::FormErr);
        return response.to_vec().ok();
    };
    response
        .set_response_code(ResponseCode::NoError)
        .add_query(question.clone());

    let name = question.name().to_string();
    let query = DnsQuery::new(name.trim_end_matches('.'), question.query_type());

    for answer in policy.resolve(&query).await {
        match encode_answer(question.name(), &answer) {
            Ok(record) => {
                response.add_answer(record);
            }
            Err(e) => tracing::debug!(name = %answer.name, error = %e, "Skipping answer"),
        }
    }

    match response.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(name = %query.name, error = %e, "Failed to encode DNS reply");
            None
        }
    }
}

fn encode_answer(owner: &Name, answer: &DnsAnswer) -> Result<Record> {
    let rdata = match &answer.data {
        AnswerData::A(ip) => RData::A(A(*ip)),
        AnswerData::Aaaa(text) => {
            let ip: Ipv6Addr = text
                .parse()
                .map_err(|e| Error::upstream(format!("Bad AAAA data '{}': {}", text, e)))?;
            RData::AAAA(AAAA(ip))
        }
        AnswerData::Mx(priority, exchange) => {
            let mut exchange = Name::from_ascii(exchange)
                .map_err(|e| Error::upstream(format!("Bad MX exchange '{}': {}", exchange, e)))?;
            exchange.set_fqdn(true);
            RData::MX(MX::new(*priority, exchange))
        }
        AnswerData::Other(rdata) => rdata.clone(),
    };
    Ok(Record::from_rdata(owner.clone(), ANSWER_TTL, rdata))
}
