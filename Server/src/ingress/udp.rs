// ingress/udp.rs

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::handlers::control::{ControlError, ControlHandler};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Receives control datagrams until `shutdown` fires.
///
/// Every datagram is handled on its own task and answered to its source address. Errors stay
/// inside that task, except an upstream rejection, which ends the loop with that error.
#[instrument(skip_all)]
pub async fn run_control_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<ControlHandler>,
    shutdown: CancellationToken,
) -> Result<(), ControlError> {
    info!("Control channel listening on {:?}", socket.local_addr());
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Control channel closed");
                return Ok(());
            }
            Some(error) = fatal_rx.recv() => return Err(error),
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Failed to receive control datagram: {}", e);
                        continue;
                    }
                };
                trace!("{} bytes from {}", len, peer);

                let datagram = Bytes::copy_from_slice(&buf[..len]);
                tokio::spawn(handle_datagram(
                    socket.clone(),
                    handler.clone(),
                    datagram,
                    peer,
                    fatal_tx.clone(),
                ));
            }
        }
    }
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    handler: Arc<ControlHandler>,
    datagram: Bytes,
    peer: SocketAddr,
    fatal_tx: mpsc::UnboundedSender<ControlError>,
) {
    match handler.handle_datagram(&datagram).await {
        Ok(Some(response)) => {
            if let Err(e) = socket.send_to(&response, peer).await {
                warn!("Failed to answer {}: {}", peer, e);
            }
        }
        Ok(None) => {}
        Err(ControlError::Codec(e)) => debug!("Dropping malformed frame from {}: {}", peer, e),
        Err(e @ ControlError::UpstreamRejected { .. }) => {
            let _ = fatal_tx.send(e);
        }
    }
}
