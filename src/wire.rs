//! Decoder for the extra data carried by a `direct-tcpip` channel-open.
//!
//! ```text
//! +-----+-------------+------+-----+-------------+------+
//! | LEN | TARGET HOST | PORT | LEN | ORIGIN HOST | PORT |
//! +-----+-------------+------+-----+-------------+------+
//! |  4  |  Variable   |  4   |  4  |  Variable   |  4   |
//! +-----+-------------+------+-----+-------------+------+
//! ```
//!
//! All integers are big-endian. Bytes after the origin port are ignored.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::TunnelError;

/// The four fields of a `direct-tcpip` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTcpip {
    pub host: String,
    pub port: u32,
    pub origin_host: String,
    pub origin_port: u32,
}

impl DirectTcpip {
    pub fn new(
        host: impl Into<String>,
        port: u32,
        origin_host: impl Into<String>,
        origin_port: u32,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            origin_host: origin_host.into(),
            origin_port,
        }
    }

    /// Decode the channel-open extra data.
    ///
    /// Fails with [`TunnelError::MalformedChannelRequest`] whenever a length
    /// prefix, string body or port slot is truncated, or a host is not UTF-8.
    ///
    /// The SSH server path never calls this: russh decodes the payload
    /// before the handler runs and tears down the session if it is malformed.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn decode(mut data: &[u8]) -> Result<Self, TunnelError> {
        let host = read_string(&mut data)?;
        let port = read_u32(&mut data)?;
        let origin_host = read_string(&mut data)?;
        let origin_port = read_u32(&mut data)?;
        Ok(Self {
            host,
            port,
            origin_host,
            origin_port,
        })
    }

    /// Encode into the wire layout accepted by [`DirectTcpip::decode`].
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16 + self.host.len() + self.origin_host.len());
        buf.put_u32(self.host.len() as u32);
        buf.put_slice(self.host.as_bytes());
        buf.put_u32(self.port);
        buf.put_u32(self.origin_host.len() as u32);
        buf.put_slice(self.origin_host.as_bytes());
        buf.put_u32(self.origin_port);
        buf.to_vec()
    }

    /// `host:port` of the requested target.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:port` of the connection originator.
    pub fn origin(&self) -> String {
        format!("{}:{}", self.origin_host, self.origin_port)
    }
}

#[cfg_attr(not(test), allow(dead_code))]
fn read_u32(data: &mut &[u8]) -> Result<u32, TunnelError> {
    if data.remaining() < 4 {
        return Err(TunnelError::MalformedChannelRequest);
    }
    Ok(data.get_u32())
}

#[cfg_attr(not(test), allow(dead_code))]
fn read_string(data: &mut &[u8]) -> Result<String, TunnelError> {
    let len = read_u32(data)? as usize;
    if data.remaining() < len {
        return Err(TunnelError::MalformedChannelRequest);
    }
    let (value, rest) = data.split_at(len);
    let value = std::str::from_utf8(value)
        .map_err(|_| TunnelError::MalformedChannelRequest)?
        .to_string();
    *data = rest;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DirectTcpip {
        DirectTcpip::new("host-a", 2222, "203.0.113.9", 51000)
    }

    #[test]
    fn test_decode_known_bytes() {
        let mut data = Vec::new();
        data.extend_from_slice(&6u32.to_be_bytes());
        data.extend_from_slice(b"host-a");
        data.extend_from_slice(&2222u32.to_be_bytes());
        data.extend_from_slice(&11u32.to_be_bytes());
        data.extend_from_slice(b"203.0.113.9");
        data.extend_from_slice(&51000u32.to_be_bytes());

        let decoded = DirectTcpip::decode(&data).unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(decoded.target(), "host-a:2222");
        assert_eq!(decoded.origin(), "203.0.113.9:51000");
        assert_eq!(sample().encode(), data);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut data = sample().encode();
        data.extend_from_slice(b"trailing garbage");
        assert_eq!(DirectTcpip::decode(&data).unwrap(), sample());
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        let data = sample().encode();
        for len in 0..data.len() {
            let result = DirectTcpip::decode(&data[..len]);
            assert!(
                matches!(result, Err(TunnelError::MalformedChannelRequest)),
                "truncated to {} bytes should fail",
                len
            );
        }
    }

    #[test]
    fn test_length_prefix_past_end() {
        let mut data = Vec::new();
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        data.extend_from_slice(b"short");
        assert!(matches!(
            DirectTcpip::decode(&data),
            Err(TunnelError::MalformedChannelRequest)
        ));
    }

    #[test]
    fn test_non_utf8_host() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[0xff, 0xfe]);
        data.extend_from_slice(&80u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        assert!(DirectTcpip::decode(&data).is_err());
    }

    #[test]
    fn test_empty_hosts() {
        let value = DirectTcpip::new("", 0, "", 0);
        let decoded = DirectTcpip::decode(&value.encode()).unwrap();
        assert_eq!(decoded.target(), ":0");
        assert_eq!(decoded.origin(), ":0");
    }

    #[test]
    fn test_round_trip_ipv6_and_large_ports() {
        let value = DirectTcpip::new("::1", u32::MAX, "fe80::1%eth0", 65535);
        assert_eq!(DirectTcpip::decode(&value.encode()).unwrap(), value);
    }
}
