use tokio::net::UdpSocket as AsyncUdpSocket;
use tokio::sync::mpsc;

use super::{parse_event, InputError, PlatformEvent};

/// Receives platform events as JSON datagrams, one event per datagram
pub struct AsyncUdpListener {
    socket: AsyncUdpSocket,
}

impl AsyncUdpListener {
    /// Create a new listener bound to the given address
    pub async fn new(address: &str) -> Result<Self, InputError> {
        let socket = AsyncUdpSocket::bind(address).await?;
        Ok(AsyncUdpListener { socket })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, InputError> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the listener, sending events through the channel
    ///
    /// This method runs indefinitely until the channel is closed.
    pub async fn run(&mut self, tx: mpsc::Sender<PlatformEvent>) -> Result<(), InputError> {
        let mut buf = [0u8; 2048];

        log::info!("UDP event listener started on {:?}", self.socket.local_addr().ok());

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((size, addr)) => {
                    let message = String::from_utf8_lossy(&buf[..size]);
                    match parse_event(&message) {
                        Ok(Some(event)) => {
                            if tx.send(event).await.is_err() {
                                log::info!("Channel closed, stopping UDP listener");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Dropping datagram from {}: {}", addr, e),
                    }
                }
                Err(e) => {
                    log::error!("UDP recv error: {}", e);
                }
            }
        }

        Ok(())
    }
}
