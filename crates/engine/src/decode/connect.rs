//! Socket address decoding for connect.

use super::SyscallDecoder;
use crate::error::Error;
use crate::notification::SyscallEntry;
use crate::tracer::Tracer;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, info};

const MAX_SOCKADDR_LEN: usize = 128;

pub(super) fn syscalls() -> Vec<i64> {
    vec![libc::SYS_connect]
}

/// Pretty-prints the destination of every connect call.
#[derive(Default)]
pub struct ConnectDecoder {
    destinations: Vec<String>,
}

fn render_sockaddr(bytes: &[u8]) -> String {
    if bytes.len() < 2 {
        return "<truncated sockaddr>".into();
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    match family as i32 {
        libc::AF_INET if bytes.len() >= 8 => {
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let addr = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
            format!("{addr}:{port}")
        }
        libc::AF_INET6 if bytes.len() >= 24 => {
            let port = u16::from_be_bytes([bytes[2], bytes[3]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[8..24]);
            format!("[{}]:{port}", Ipv6Addr::from(octets))
        }
        libc::AF_UNIX => {
            let path: Vec<u8> = bytes[2..]
                .iter()
                .copied()
                .take_while(|&b| b != 0)
                .collect();
            format!("unix:{}", String::from_utf8_lossy(&path))
        }
        other => format!("<address family {other}>"),
    }
}

impl SyscallDecoder for ConnectDecoder {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn entry(&mut self, tracer: &Tracer, entry: &SyscallEntry) -> Result<(), Error> {
        let len = (entry.argument(2) as usize).min(MAX_SOCKADDR_LEN);
        if len < 2 {
            return Ok(());
        }
        let bytes = tracer.extract_bytes(entry.argument(1), len)?;
        let destination = render_sockaddr(&bytes);
        debug!(
            spid = entry.spid().as_raw(),
            fd = entry.argument(0),
            %destination,
            "connect observed"
        );
        self.destinations.push(destination);
        Ok(())
    }

    fn report(&self) {
        for destination in &self.destinations {
            info!(%destination, "connect attempted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_inet_sockaddr() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
        bytes.extend_from_slice(&80u16.to_be_bytes());
        bytes.extend_from_slice(&[127, 0, 0, 1]);
        assert_eq!(render_sockaddr(&bytes), "127.0.0.1:80");
    }

    #[test]
    fn renders_unix_sockaddr() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
        bytes.extend_from_slice(b"/run/app.sock\0\0");
        assert_eq!(render_sockaddr(&bytes), "unix:/run/app.sock");
    }
}
