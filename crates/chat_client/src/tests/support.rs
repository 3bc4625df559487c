//! In-memory transport for unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportLink};

pub(crate) enum OpenStep {
    Accept,
    Reject(&'static str),
}

/// The server end of one accepted fake connection. Dropping it looks like a
/// transport drop to the client.
pub(crate) struct ServerSide {
    pub to_client: mpsc::UnboundedSender<ServerEvent>,
    pub from_client: mpsc::UnboundedReceiver<ClientRequest>,
}

impl ServerSide {
    pub async fn next_request(&mut self) -> ClientRequest {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("request in time")
            .expect("client end open")
    }
}

pub(crate) struct FakeTransport {
    script: StdMutex<VecDeque<OpenStep>>,
    open_delay: Duration,
    opens: AtomicUsize,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

impl FakeTransport {
    pub fn new(
        script: impl IntoIterator<Item = OpenStep>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::with_open_delay(script, Duration::ZERO)
    }

    pub fn with_open_delay(
        script: impl IntoIterator<Item = OpenStep>,
        open_delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: StdMutex::new(script.into_iter().collect()),
            open_delay,
            opens: AtomicUsize::new(0),
            accepted,
        });
        (transport, accepted_rx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _auth_token: &str) -> Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(OpenStep::Accept);
        match step {
            OpenStep::Reject(reason) => Err(anyhow!(reason)),
            OpenStep::Accept => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let _ = self.accepted.send(ServerSide {
                    to_client,
                    from_client,
                });
                Ok(TransportLink::new(outbound, inbound))
            }
        }
    }
}
