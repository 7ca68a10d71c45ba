//! Connection Broadcaster
//!
//! Registry of live sockets keyed by channel. A channel is a resource owner's
//! id, or the reserved wildcard channel that receives a copy of every
//! broadcast. The registry is a `parking_lot` mutex around a map of maps; it
//! is only locked for bookkeeping and never across a send. Every send is
//! bounded by a timeout, so a peer that stops reading is dropped instead of
//! stalling the broadcast.

use crate::error::{SessionError, SessionResult};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = u64;

pub const WILDCARD_CHANNEL: &str = "*";

/// Close code sent to every socket on shutdown (going away)
pub const CLOSE_GOING_AWAY: u16 = 1001;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Owner(Uuid),
    Wildcard,
}

impl Channel {
    /// Parse a resource-owner channel id. The wildcard literal is reserved
    /// and can never be claimed as an owner.
    pub fn parse_owner(raw: &str) -> SessionResult<Uuid> {
        let raw = raw.trim();
        if raw == WILDCARD_CHANNEL {
            return Err(SessionError::ConnectionRejected(
                "wildcard channel is reserved".to_string(),
            ));
        }
        Uuid::parse_str(raw)
            .map_err(|_| SessionError::ConnectionRejected(format!("invalid channel id: {raw}")))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Owner(id) => write!(f, "{id}"),
            Channel::Wildcard => f.write_str(WILDCARD_CHANNEL),
        }
    }
}

/// Structured message frame delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    pub sender: Uuid,
    pub payload: serde_json::Value,
}

impl Frame {
    pub fn new(channel: Channel, sender: Uuid, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.to_string(),
            sender,
            payload,
        }
    }
}

/// Write half of a live socket
#[async_trait]
pub trait SocketSink: Send + Sync {
    fn id(&self) -> ConnectionId;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn close(&self, code: u16, reason: &str) -> Result<()>;
}

type Members = HashMap<ConnectionId, Arc<dyn SocketSink>>;

pub struct ConnectionBroadcaster {
    registry: Mutex<HashMap<Channel, Members>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl Default for ConnectionBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBroadcaster {
    pub fn new() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `socket` to `channel`, creating the channel if absent
    pub fn connect(&self, channel: Channel, socket: Arc<dyn SocketSink>) {
        let id = socket.id();
        self.registry
            .lock()
            .entry(channel)
            .or_default()
            .insert(id, socket);
        debug!(connection = id, channel = %channel, "Socket registered");
    }

    /// Remove a socket from `channel`, or from the first channel holding it
    /// when no channel is given. Empty channels are pruned. Removing a socket
    /// that was never registered is a no-op.
    pub fn disconnect(&self, id: ConnectionId, channel: Option<Channel>) -> bool {
        let mut registry = self.registry.lock();

        let target = match channel {
            Some(channel) => channel,
            None => match registry
                .iter()
                .find(|(_, members)| members.contains_key(&id))
                .map(|(channel, _)| *channel)
            {
                Some(found) => found,
                None => return false,
            },
        };

        let Some(members) = registry.get_mut(&target) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if members.is_empty() {
            registry.remove(&target);
        }
        if removed {
            debug!(connection = id, channel = %target, "Socket deregistered");
        }
        removed
    }

    /// Remove a socket from every channel it belongs to
    pub fn disconnect_everywhere(&self, id: ConnectionId) -> usize {
        let mut removed = 0;
        while self.disconnect(id, None) {
            removed += 1;
        }
        removed
    }

    /// Register one socket on several channels; dropping the returned guard
    /// deregisters it from all of them.
    pub fn register(
        self: &Arc<Self>,
        socket: Arc<dyn SocketSink>,
        channels: &[Channel],
    ) -> Registration {
        for channel in channels {
            self.connect(*channel, socket.clone());
        }
        Registration {
            broadcaster: Arc::clone(self),
            id: socket.id(),
            channels: channels.to_vec(),
        }
    }

    /// Deliver `message` to `channel` (if given) and to the wildcard channel.
    /// A socket subscribed to both receives it once. A failed delivery
    /// disconnects that socket and does not affect the others; a send that
    /// outlives the send timeout counts as failed. Returns the number of
    /// successful deliveries.
    pub async fn broadcast(&self, message: &str, channel: Option<Channel>) -> usize {
        let recipients: Vec<Arc<dyn SocketSink>> = {
            let registry = self.registry.lock();
            let mut unique: HashMap<ConnectionId, Arc<dyn SocketSink>> = HashMap::new();
            let targets = channel.into_iter().chain(std::iter::once(Channel::Wildcard));
            for target in targets {
                if let Some(members) = registry.get(&target) {
                    for (id, sink) in members {
                        unique.entry(*id).or_insert_with(|| sink.clone());
                    }
                }
            }
            unique.into_values().collect()
        };

        let limit = self.send_timeout;
        let results = join_all(recipients.iter().map(|sink| {
            let text = message.to_string();
            async move {
                let result = match tokio::time::timeout(limit, sink.send_text(text)).await {
                    Ok(sent) => sent,
                    Err(_) => Err(anyhow::anyhow!("send timed out after {:?}", limit)),
                };
                (sink.id(), result)
            }
        }))
        .await;

        let mut delivered = 0;
        for (id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection = id, "Delivery failed, dropping socket: {:#}", e);
                    self.disconnect_everywhere(id);
                }
            }
        }
        delivered
    }

    pub async fn broadcast_frame(&self, frame: &Frame, channel: Option<Channel>) -> Result<usize> {
        let text = serde_json::to_string(frame)?;
        Ok(self.broadcast(&text, channel).await)
    }

    /// Number of distinct live sockets
    pub fn connection_count(&self) -> usize {
        let registry = self.registry.lock();
        let mut ids: Vec<ConnectionId> = registry.values().flat_map(|m| m.keys().copied()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn channel_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn members(&self, channel: Channel) -> usize {
        self.registry.lock().get(&channel).map_or(0, |m| m.len())
    }

    /// Drain the registry and close every socket
    pub async fn shutdown(&self) -> usize {
        let sockets: Vec<Arc<dyn SocketSink>> = {
            let mut registry = self.registry.lock();
            let mut unique: HashMap<ConnectionId, Arc<dyn SocketSink>> = HashMap::new();
            for (_, members) in registry.drain() {
                unique.extend(members);
            }
            unique.into_values().collect()
        };

        let count = sockets.len();
        let limit = self.send_timeout;
        join_all(sockets.iter().map(|sink| async move {
            match tokio::time::timeout(limit, sink.close(CLOSE_GOING_AWAY, "server shutting down"))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(connection = sink.id(), "Close on shutdown failed: {:#}", e),
                Err(_) => debug!(connection = sink.id(), "Close on shutdown timed out"),
            }
        }))
        .await;

        info!(closed = count, "📴 Broadcaster shut down");
        count
    }
}

/// Keeps a socket registered for as long as it lives
pub struct Registration {
    broadcaster: Arc<ConnectionBroadcaster>,
    id: ConnectionId,
    channels: Vec<Channel>,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        for channel in &self.channels {
            self.broadcaster.disconnect(self.id, Some(*channel));
        }
    }
}
