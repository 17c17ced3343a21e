//! Physical link seam
//!
//! The daemon consumes the radio as an opaque reliable-framing byte stream:
//! it hands whole API packets to [`Link::send`] and receives whole inbound
//! packets on a channel. The production implementation talks to the radio
//! gateway over TCP with a big-endian u16 length prefix per packet; tests
//! use [`MockLink`].

use crate::{Result, XbeedError};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Largest packet the framing layer will accept.
pub const MAX_LINK_PACKET: usize = 256;

/// Outbound half of the link. Sends must never block the daemon; the
/// gateway implementation hands packets to a writer task.
pub trait Link {
    fn send(&mut self, packet: &[u8]) -> Result<()>;
}

/// Link to the radio gateway process over TCP.
pub struct GatewayLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl GatewayLink {
    /// Connect to the gateway and spawn the pump tasks. Inbound packets are
    /// delivered on `inbound`.
    pub async fn connect(
        host: &str,
        port: u16,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| XbeedError::Link(format!("connect to gateway {}:{}: {}", host, port, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| XbeedError::Link(format!("set nodelay: {}", e)))?;

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(packet) = outbound.recv().await {
                let len = (packet.len() as u16).to_be_bytes();
                if write_half.write_all(&len).await.is_err()
                    || write_half.write_all(&packet).await.is_err()
                {
                    warn!("Gateway write failed, link down");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                let mut len_bytes = [0u8; 2];
                if read_half.read_exact(&mut len_bytes).await.is_err() {
                    warn!("Gateway read failed, link down");
                    break;
                }
                let len = u16::from_be_bytes(len_bytes) as usize;
                if len == 0 || len > MAX_LINK_PACKET {
                    warn!("Gateway framed a {}-byte packet, closing link", len);
                    break;
                }
                let mut packet = vec![0u8; len];
                if read_half.read_exact(&mut packet).await.is_err() {
                    warn!("Gateway read failed mid-packet, link down");
                    break;
                }
                debug!("Link RX {} bytes", packet.len());
                if inbound.send(packet).is_err() {
                    break;
                }
            }
        });

        Ok(Self { tx })
    }
}

impl Link for GatewayLink {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        debug!("Link TX {} bytes", packet.len());
        self.tx
            .send(packet.to_vec())
            .map_err(|_| XbeedError::Link("gateway writer gone".to_string()))
    }
}

/// Test link capturing everything sent.
#[derive(Default)]
pub struct MockLink {
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle observing the packets sent so far.
    pub fn sent_handle(&self) -> Rc<RefCell<Vec<Vec<u8>>>> {
        Rc::clone(&self.sent)
    }
}

impl Link for MockLink {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.sent.borrow_mut().push(packet.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_link_captures_sends() {
        let mut link = MockLink::new();
        let handle = link.sent_handle();

        link.send(&[1, 2, 3]).unwrap();
        link.send(&[4]).unwrap();

        let sent = handle.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], vec![1, 2, 3]);
        assert_eq!(sent[1], vec![4]);
    }
}
