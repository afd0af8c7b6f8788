use crate::error::{PanelError, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, error};

/// Sent after every operator command so the encoder reloads its settings.
const RELOAD_ENCODER: &str = "killall -1 majestic";

/// Datagram channel to the device's command listener.
#[derive(Debug, Clone)]
pub struct DeviceChannel {
    target: SocketAddr,
}

impl DeviceChannel {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }

    /// Forwards `cli -s <command>` and then asks the encoder to reload.
    pub async fn send_command(&self, command: &str) -> Result<String> {
        let cli_command = format!("cli -s {}", command.trim());
        self.send(&cli_command).await?;
        self.send(RELOAD_ENCODER).await?;
        Ok(cli_command)
    }

    async fn send(&self, line: &str) -> Result<()> {
        let bind_addr = if self.target.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let payload = format!("{}\n", line);
        let result = async {
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.send_to(payload.as_bytes(), self.target).await
        }
        .await;

        match result {
            Ok(_) => {
                debug!("Sent {:?} to {}", line, self.target);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send {:?} to {}: {}", line, self.target, e);
                Err(PanelError::ExternalCommand(format!(
                    "sending {:?} to {} failed: {}",
                    line, self.target, e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_command_then_reload() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let channel = DeviceChannel::new(listener.local_addr().unwrap());

        let sent = channel.send_command("set .video0.bitrate 8192").await.unwrap();
        assert_eq!(sent, "cli -s set .video0.bitrate 8192");

        let mut buf = [0u8; 256];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"cli -s set .video0.bitrate 8192\n");
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"killall -1 majestic\n");
    }
}
