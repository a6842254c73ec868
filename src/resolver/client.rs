//! The iterative DNS client.
//!
//! UDP by default, falling back to TCP when a response arrives truncated;
//! retries with exponential backoff up to the configured attempt limit,
//! rotating across the configured server endpoints.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::resolver::config::ResolverConfig;
use crate::resolver::message::Message;
use crate::{Error, Result};

const MAX_UDP_RESPONSE: usize = 4_096;

static NEXT_QUERY_ID: AtomicU16 = AtomicU16::new(1);

pub(crate) struct DnsClient {
    servers: Vec<SocketAddr>,
    attempts: usize,
    timeout: Duration,
}

impl DnsClient {
    pub(crate) fn new(config: &ResolverConfig) -> DnsClient {
        DnsClient {
            servers: config.servers.clone(),
            attempts: config.attempts.max(1),
            timeout: config.timeout,
        }
    }

    /// Sends one question and returns the first well-formed response.
    pub(crate) fn query(&self, name: &str, qtype: u16) -> Result<Message> {
        if self.servers.is_empty() {
            return Err(Error::NotImplemented);
        }
        let mut last_error = Error::Unreachable;
        for attempt in 0..self.attempts {
            // Exponential backoff across retry rounds.
            let timeout = self.timeout * (1 << attempt.min(4)) as u32;
            for server in &self.servers {
                let id = NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed);
                let query = Message::query(id, name, qtype);
                trace!(
                    "query {:#06x} {} type {} via {} (attempt {})",
                    id,
                    name,
                    qtype,
                    server,
                    attempt + 1
                );
                match self.query_udp(*server, &query, timeout) {
                    Ok(response) if response.truncated => {
                        debug!("response for {} truncated; retrying over tcp", name);
                        match self.query_tcp(*server, &query, timeout) {
                            Ok(response) => return Ok(response),
                            Err(error) => last_error = error,
                        }
                    }
                    Ok(response) => return Ok(response),
                    Err(error) => {
                        warn!("query {} via {} failed: {}", name, server, error);
                        last_error = error;
                    }
                }
            }
        }
        Err(last_error)
    }

    fn query_udp(&self, server: SocketAddr, query: &Message, timeout: Duration) -> Result<Message> {
        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(timeout))?;
        let wire = query.encode()?;
        socket.send_to(&wire, server)?;

        let mut buf = [0u8; MAX_UDP_RESPONSE];
        loop {
            let (n, from) = socket.recv_from(&mut buf).map_err(|err| {
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut
                {
                    Error::WouldBlock
                } else {
                    Error::from(err)
                }
            })?;
            if from != server {
                continue;
            }
            let response = Message::decode(&buf[..n])?;
            // Stale answers from earlier attempts are skipped.
            if response.id != query.id || !response.response {
                continue;
            }
            return Ok(response);
        }
    }

    fn query_tcp(&self, server: SocketAddr, query: &Message, timeout: Duration) -> Result<Message> {
        let mut stream = TcpStream::connect_timeout(&server, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let wire = query.encode()?;
        let mut framed = Vec::with_capacity(wire.len() + 2);
        framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        framed.extend_from_slice(&wire);
        stream.write_all(&framed)?;

        let mut length = [0u8; 2];
        stream.read_exact(&mut length)?;
        let length = u16::from_be_bytes(length) as usize;
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body)?;

        let response = Message::decode(&body)?;
        if response.id != query.id || !response.response {
            return Err(Error::AddressMalformed);
        }
        Ok(response)
    }
}
