//! Truthful resolution for honest names

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

const MAX_DATAGRAM: usize = 4096;

/// Source of real DNS records for honest names
pub trait UpstreamResolver: Send + Sync + 'static {
    /// Records of exactly `record_type` for `name`
    fn resolve(
        &self,
        name: &str,
        record_type: RecordType,
    ) -> impl Future<Output = Result<Vec<RData>>> + Send;
}

/// Forwards each lookup as a single UDP exchange with a nameserver
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    server: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    async fn exchange(&self, name: &str, record_type: RecordType) -> Result<Vec<RData>> {
        let mut qname = Name::from_ascii(name)
            .map_err(|e| Error::upstream(format!("Invalid name '{}': {}", name, e)))?;
        qname.set_fqdn(true);

        let id: u16 = rand::random();
        let mut request = Message::new();
        request
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(qname, record_type));
        let payload = request
            .to_vec()
            .map_err(|e| Error::upstream(format!("Failed to encode query: {}", e)))?;

        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.server).await?;
        socket.send(&payload).await?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let response = loop {
            let len = socket.recv(&mut buf).await?;
            match Message::from_vec(&buf[..len]) {
                Ok(message) if message.id() == id => break message,
                Ok(_) => tracing::trace!(upstream = %self.server, "Ignoring mismatched reply"),
                Err(e) => tracing::trace!(upstream = %self.server, error = %e, "Ignoring malformed reply"),
            }
        };

        if response.response_code() != ResponseCode::NoError {
            return Err(Error::upstream(format!(
                "{} for {} {}",
                response.response_code(),
                name,
                record_type
            )));
        }

        // CNAME chain links are dropped; only the requested type is kept
        Ok(response
            .answers()
            .iter()
            .filter(|record| record.record_type() == record_type)
            .map(|record| record.data().clone())
            .collect())
    }
}

impl UpstreamResolver for UdpUpstream {
    async fn resolve(&self, name: &str, record_type: RecordType) -> Result<Vec<RData>> {
        match tokio::time::timeout(self.timeout, self.exchange(name, record_type)).await {
            Ok(result) => result.map_err(|e| match e {
                Error::UpstreamResolution(_) => e,
                other => Error::upstream(format!("{} via {}: {}", name, self.server, other)),
            }),
            Err(_) => Err(Error::upstream(format!(
                "{} {} timed out after {:?} waiting for {}",
                name, record_type, self.timeout, self.server
            ))),
        }
    }
}
