//! In-memory connector for tests.
//!
//! Each accepted connection is a `tokio::io::duplex` pair; the server half is
//! handed to the test through a channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::Protocol;

use super::{Connector, Socket};

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Outcome of one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    Refuse,
    Accept,
}

#[derive(Debug)]
pub(crate) struct MockConnector {
    protocol: Protocol,
    plan: Mutex<VecDeque<Plan>>,
    fallback: Plan,
    attempts: AtomicUsize,
    accepted: mpsc::UnboundedSender<DuplexStream>,
}

impl MockConnector {
    /// Follows `plan` attempt by attempt, then `fallback` forever.
    pub(crate) fn new(
        protocol: Protocol,
        plan: impl IntoIterator<Item = Plan>,
        fallback: Plan,
    ) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        let connector = Self {
            protocol,
            plan: Mutex::new(plan.into_iter().collect()),
            fallback,
            attempts: AtomicUsize::new(0),
            accepted,
        };
        (connector, servers)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self.plan.lock().pop_front().unwrap_or(self.fallback);

        match plan {
            Plan::Refuse => Err(Error::connection(format!("{host}:{port}: refused"))),
            Plan::Accept => {
                let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
                self.accepted
                    .send(server)
                    .map_err(|_| Error::connection("mock server gone"))?;
                Ok(Socket::spawn(client, self.protocol))
            }
        }
    }
}

/// Reads one HTTP head (through the blank line) from the server half.
pub(crate) async fn read_head(server: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        server.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}
