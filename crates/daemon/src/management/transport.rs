// OpenVPN Auth Bridge - Management Transport
// Dials the management interface over TCP or a Unix domain socket

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use openvpn_auth_common::ManagementAddr;

/// Duplex byte stream carrying the management protocol
pub trait ManagementStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ManagementStream for T {}

/// Open a connection to the management interface
pub async fn dial(addr: &ManagementAddr) -> std::io::Result<Box<dyn ManagementStream>> {
    debug!("Dialing management interface at {}", addr);

    match addr {
        ManagementAddr::Tcp(host_port) => {
            let stream = TcpStream::connect(host_port).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        ManagementAddr::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        ManagementAddr::Unix(path) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("unix sockets are not supported on this platform: {}", path.display()),
        )),
    }
}
