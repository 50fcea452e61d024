//! HTTP socket setup. There is no handshake; framing starts immediately.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::HttpProtocol;
use crate::socket::driver::Established;
use crate::socket::SocketOptions;

pub(super) fn adopt<S>(options: &SocketOptions, stream: S) -> Established<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let protocol = HttpProtocol::with_limit(options.role, options.max_message_bytes);
    (stream, Box::new(protocol), Vec::new())
}
