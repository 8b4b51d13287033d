// control_client.rs

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, instrument, warn};

use crate::codec::{
    CodecError, ControlMessage, MessageBody, MessageType, StreamingResponse, StreamingStartRequest,
    StreamingStopRequest,
};
use crate::types::{current_timestamp, SequenceCounter};

#[derive(Error, Debug)]
pub enum ControlClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no {0:?} received within {1:?}")]
    Timeout(MessageType, Duration),
}

/// Originator side of the control protocol: sends start/stop requests to a server and waits
/// for the answer on the same socket. One exchange at a time.
#[derive(Debug)]
pub struct ControlClient {
    socket: UdpSocket,
    sequence: Arc<SequenceCounter>,
    response_timeout: Duration,
}

impl ControlClient {
    pub async fn connect(
        server: SocketAddr,
        sequence: Arc<SequenceCounter>,
        response_timeout: Duration,
    ) -> Result<Self, ControlClientError> {
        let bind_addr = if server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        debug!("Control client bound to {:?}, server {}", socket.local_addr(), server);

        Ok(Self {
            socket,
            sequence,
            response_timeout,
        })
    }

    #[instrument(skip(self))]
    pub async fn start_streaming(
        &self,
        source_ip: &str,
        uri: &str,
        expires: u64,
    ) -> Result<StreamingResponse, ControlClientError> {
        let body = MessageBody::StartRequest(StreamingStartRequest {
            source_ip: source_ip.to_owned(),
            uri: uri.to_owned(),
            expires,
        });
        self.exchange(body, MessageType::StreamingStartResponse).await
    }

    #[instrument(skip(self))]
    pub async fn stop_streaming(
        &self,
        source_ip: &str,
        uri: &str,
    ) -> Result<StreamingResponse, ControlClientError> {
        let body = MessageBody::StopRequest(StreamingStopRequest {
            source_ip: source_ip.to_owned(),
            uri: uri.to_owned(),
        });
        self.exchange(body, MessageType::StreamingStopResponse).await
    }

    async fn exchange(
        &self,
        body: MessageBody,
        expected: MessageType,
    ) -> Result<StreamingResponse, ControlClientError> {
        let request = ControlMessage::new(self.sequence.next(), current_timestamp(), body)?;
        self.socket.send(&request.encode()?).await?;
        debug!("SEND {:?}", request);

        // Responses are matched by arrival order, not by sequence number.
        match tokio::time::timeout(self.response_timeout, self.recv_response(expected)).await {
            Ok(result) => result,
            Err(_) => Err(ControlClientError::Timeout(expected, self.response_timeout)),
        }
    }

    async fn recv_response(&self, expected: MessageType) -> Result<StreamingResponse, ControlClientError> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let len = self.socket.recv(&mut buf).await?;
            match ControlMessage::decode(&buf[..len]) {
                Ok(Some(message)) if message.header.message_type == expected => {
                    debug!("RECV {:?}", message);
                    if let MessageBody::StartResponse(response) | MessageBody::StopResponse(response) =
                        message.body
                    {
                        return Ok(response);
                    }
                }
                Ok(Some(message)) => {
                    warn!(
                        "Ignoring unexpected {:?} while waiting for {:?}",
                        message.header.message_type, expected
                    );
                }
                Ok(None) => {}
                Err(e) => debug!("Dropping malformed frame: {}", e),
            }
        }
    }
}
