//! Message transport between a [`NetworkServer`](crate::NetworkServer) and
//! its [`NetworkClient`](crate::NetworkClient)s.
//!
//! Two logical channels share one peer connection:
//!
//! - **Reliable ordered** ([`tcp`]): one TCP stream per peer carrying
//!   length-prefixed frames. Messages of any size up to
//!   [`NetworkConfig::max_reliable_message`](crate::NetworkConfig) arrive
//!   complete and in send order.
//!
//! - **Unreliable unordered** ([`udp`]): one UDP socket per endpoint. Each
//!   message is a single datagram, so it may be dropped or reordered, and is
//!   limited to [`udp::MAX_UNRELIABLE_PAYLOAD`] bytes.
//!
//! All sockets are non-blocking and pumped by the owner's `update()`.

pub mod tcp;
pub mod udp;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{LinkError, Result};
use crate::session::Remote;

/// Delivery guarantee of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    ReliableOrdered,
    UnreliableUnordered,
}

impl ChannelType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::ReliableOrdered => 0,
            Self::UnreliableUnordered => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ReliableOrdered),
            1 => Some(Self::UnreliableUnordered),
            _ => None,
        }
    }

    /// Largest payload this channel accepts.
    pub fn max_payload(self, max_reliable: usize) -> usize {
        match self {
            Self::ReliableOrdered => max_reliable,
            Self::UnreliableUnordered => udp::MAX_UNRELIABLE_PAYLOAD,
        }
    }
}

/// A message to or from a remote.
///
/// For outgoing messages `remote` is the destination; for incoming
/// messages it is the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub remote: Remote,
    pub channel: ChannelType,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(remote: Remote, channel: ChannelType, data: Vec<u8>) -> Self {
        Self {
            remote,
            channel,
            data,
        }
    }
}

/// Cloneable handle for queueing outgoing messages.
///
/// Messages are validated when queued and written to the sockets on the
/// owner's next `update()`. Handles stay valid across restarts but fail
/// with [`LinkError::NotRunning`] while the owner is stopped.
#[derive(Clone)]
pub struct MessageSender {
    outbox: Arc<Mutex<VecDeque<Message>>>,
    connected: Arc<RwLock<HashMap<Uuid, Remote>>>,
    running: Arc<AtomicBool>,
    max_reliable: usize,
}

impl MessageSender {
    pub(crate) fn new(
        outbox: Arc<Mutex<VecDeque<Message>>>,
        connected: Arc<RwLock<HashMap<Uuid, Remote>>>,
        running: Arc<AtomicBool>,
        max_reliable: usize,
    ) -> Self {
        Self {
            outbox,
            connected,
            running,
            max_reliable,
        }
    }

    /// Queue `message` for delivery.
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LinkError::NotRunning);
        }
        if !self.is_connected(&message.remote) {
            return Err(LinkError::InvalidRemote(message.remote.id));
        }
        let max = message.channel.max_payload(self.max_reliable);
        if message.data.len() > max {
            return Err(LinkError::MessageTooLarge {
                size: message.data.len(),
                max,
                channel: message.channel,
            });
        }

        tracing::trace!(
            remote = %message.remote.id,
            channel = ?message.channel,
            size = message.data.len(),
            "message queued"
        );
        self.outbox.lock().push_back(message);
        Ok(())
    }

    /// Whether `remote` is currently connected to the owning endpoint.
    pub fn is_connected(&self, remote: &Remote) -> bool {
        self.connected
            .read()
            .get(&remote.id)
            .is_some_and(|r| r == remote)
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("queued", &self.outbox.lock().len())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> Remote {
        Remote {
            id: Uuid::new_v4(),
            addr: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    fn sender(running: bool, remotes: &[Remote]) -> (MessageSender, Arc<Mutex<VecDeque<Message>>>) {
        let outbox = Arc::new(Mutex::new(VecDeque::new()));
        let connected = remotes.iter().map(|r| (r.id, *r)).collect();
        let sender = MessageSender::new(
            outbox.clone(),
            Arc::new(RwLock::new(connected)),
            Arc::new(AtomicBool::new(running)),
            1024,
        );
        (sender, outbox)
    }

    #[test]
    fn queues_valid_messages() {
        let r = remote();
        let (sender, outbox) = sender(true, &[r]);
        sender
            .send(Message::new(r, ChannelType::ReliableOrdered, vec![1, 2, 3]))
            .unwrap();
        assert_eq!(outbox.lock().len(), 1);
    }

    #[test]
    fn rejects_when_stopped() {
        let r = remote();
        let (sender, _) = sender(false, &[r]);
        assert!(matches!(
            sender.send(Message::new(r, ChannelType::ReliableOrdered, vec![])),
            Err(LinkError::NotRunning)
        ));
    }

    #[test]
    fn rejects_unknown_remote() {
        let (sender, _) = sender(true, &[remote()]);
        let other = remote();
        assert!(matches!(
            sender.send(Message::new(other, ChannelType::ReliableOrdered, vec![])),
            Err(LinkError::InvalidRemote(id)) if id == other.id
        ));
    }

    #[test]
    fn enforces_channel_limits() {
        let r = remote();
        let (sender, _) = sender(true, &[r]);
        assert!(matches!(
            sender.send(Message::new(r, ChannelType::ReliableOrdered, vec![0; 1025])),
            Err(LinkError::MessageTooLarge { max: 1024, .. })
        ));
        assert!(matches!(
            sender.send(Message::new(
                r,
                ChannelType::UnreliableUnordered,
                vec![0; udp::MAX_UNRELIABLE_PAYLOAD + 1]
            )),
            Err(LinkError::MessageTooLarge { channel: ChannelType::UnreliableUnordered, .. })
        ));
    }

    #[test]
    fn channel_codes() {
        for channel in [ChannelType::ReliableOrdered, ChannelType::UnreliableUnordered] {
            assert_eq!(ChannelType::from_u8(channel.to_u8()), Some(channel));
        }
        assert_eq!(ChannelType::from_u8(7), None);
    }
}
