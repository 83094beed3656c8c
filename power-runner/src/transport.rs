//! TCP [`Connector`] for bridge-forwarded localhost ports.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use power_core::channel::Connector;

#[derive(Copy, Clone, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    /// Binds an ephemeral localhost port and releases it immediately, leaving
    /// the number free for the bridge to claim.
    fn reserve_port(&mut self) -> io::Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        Ok(listener.local_addr()?.port())
    }

    fn connect(&mut self, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }
}
