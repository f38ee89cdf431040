//! HAProxy protocol v1 preamble parsing (§4.G, §6, §9).
//!
//! A listener opted into `haproxy_incoming` is fronted by a proxy that
//! prepends one human-readable line, terminated by `\r\n`, before the SMTP
//! dialog proper begins:
//!
//! ```text
//! PROXY TCP4 203.0.113.7 198.51.100.1 56324 25\r\n
//! ```
//!
//! giving the real client address/port where the accepted socket only shows
//! the proxy's own. This is read strictly as a single line before the
//! greeting is sent; on any parse failure the connection is closed rather
//! than falling back to the accepted socket's address, since a malformed
//! preamble means the rest of the stream can't be trusted to be SMTP either.

use std::net::SocketAddr;

use tokio::{io::AsyncReadExt, net::TcpStream};

/// `PROXY UNKNOWN\r\n` plus the longest `TCP6` line the spec allows.
const MAX_PREAMBLE_LEN: usize = 107;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HAProxy preamble exceeded {MAX_PREAMBLE_LEN} bytes without a terminator")]
    TooLong,
    #[error("connection closed while reading HAProxy preamble")]
    Closed,
    #[error("malformed HAProxy preamble: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads and parses a HAProxy protocol v1 preamble from `stream`, returning
/// the real peer address it carries. Reads byte-at-a-time up to the
/// terminating `\n` so nothing past the preamble is consumed from the
/// socket; the caller passes the returned address on to the SMTP session in
/// place of the accepted socket's peer address.
pub(crate) async fn read_v1_preamble(stream: &mut TcpStream) -> Result<SocketAddr, Error> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        if line.len() >= MAX_PREAMBLE_LEN {
            return Err(Error::TooLong);
        }

        if stream.read(&mut byte).await? == 0 {
            return Err(Error::Closed);
        }

        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }

    parse_v1_line(&line)
}

fn parse_v1_line(line: &[u8]) -> Result<SocketAddr, Error> {
    let text =
        std::str::from_utf8(line).map_err(|_| Error::Malformed("preamble is not UTF-8".into()))?;
    let text = text
        .strip_suffix("\r\n")
        .ok_or_else(|| Error::Malformed("preamble must end with CRLF".into()))?;

    let mut parts = text.split(' ');

    if parts.next() != Some("PROXY") {
        return Err(Error::Malformed("missing PROXY keyword".into()));
    }

    let proto = parts
        .next()
        .ok_or_else(|| Error::Malformed("missing protocol family".into()))?;

    match proto {
        "TCP4" | "TCP6" => {
            let src_addr = parts
                .next()
                .ok_or_else(|| Error::Malformed("missing source address".into()))?;
            let _dst_addr = parts
                .next()
                .ok_or_else(|| Error::Malformed("missing destination address".into()))?;
            let src_port = parts
                .next()
                .ok_or_else(|| Error::Malformed("missing source port".into()))?;
            let _dst_port = parts
                .next()
                .ok_or_else(|| Error::Malformed("missing destination port".into()))?;

            let ip: std::net::IpAddr = src_addr
                .parse()
                .map_err(|_| Error::Malformed(format!("bad source address {src_addr:?}")))?;
            let port: u16 = src_port
                .parse()
                .map_err(|_| Error::Malformed(format!("bad source port {src_port:?}")))?;

            Ok(SocketAddr::new(ip, port))
        }
        "UNKNOWN" => Err(Error::Malformed(
            "UNKNOWN protocol family carries no peer address".into(),
        )),
        other => Err(Error::Malformed(format!("unknown protocol family {other:?}"))),
    }
}
