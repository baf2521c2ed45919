//! In-process broker
//!
//! Keeps queues in memory with the same delivery rules as the Postgres backend:
//! per-channel prefetch, reservation until ack/reject, requeue on channel loss,
//! dead-lettering on reject without requeue. On top of that it can simulate an
//! unreachable broker, a restart (only durable queues and persistent messages
//! survive) and publish failures.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use filescan_core::ChannelError;

use super::{
    Connector, Delivery, DeliveryTag, MessageChannel, PublishOptions, QueueOptions,
};

/// Failure injected into the next publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFault {
    /// The broker answers but does not accept the message.
    NotSent,
    /// The connection drops during the publish; the channel is closed.
    ConnectionLost,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    body: Vec<u8>,
    persistent: bool,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    dead_letter: Option<String>,
    messages: VecDeque<StoredMessage>,
}

impl QueueState {
    /// Put a message back at its original position.
    fn requeue(&mut self, message: StoredMessage) {
        let position = self
            .messages
            .iter()
            .position(|m| m.id > message.id)
            .unwrap_or(self.messages.len());
        self.messages.insert(position, message);
    }
}

struct Held {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    prefetch: u16,
    unacked: HashMap<DeliveryTag, Held>,
    next_tag: DeliveryTag,
    notify: Arc<Notify>,
}

struct BrokerState {
    reachable: bool,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
    next_message_id: u64,
    publish_faults: VecDeque<PublishFault>,
    connections_opened: u64,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            reachable: true,
            queues: HashMap::new(),
            channels: HashMap::new(),
            next_channel_id: 0,
            next_message_id: 0,
            publish_faults: VecDeque::new(),
            connections_opened: 0,
        }
    }

    fn ensure_open(&self, channel: u64) -> Result<(), ChannelError> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    fn enqueue(&mut self, queue: &str, body: &[u8], persistent: bool) -> Result<(), ChannelError> {
        self.next_message_id += 1;
        let message = StoredMessage {
            id: self.next_message_id,
            body: body.to_vec(),
            persistent,
            delivery_count: 0,
        };
        self.queues
            .get_mut(queue)
            .ok_or_else(|| ChannelError::QueueNotDeclared(queue.to_string()))?
            .messages
            .push_back(message);
        self.wake_consumers();
        Ok(())
    }

    /// Drop a channel, returning its unacknowledged deliveries to their queues.
    fn close_channel(&mut self, channel: u64) -> usize {
        let Some(state) = self.channels.remove(&channel) else {
            return 0;
        };
        let mut held: Vec<Held> = state.unacked.into_values().collect();
        let returned = held.len();
        held.sort_by_key(|h| h.message.id);
        for h in held {
            if let Some(queue) = self.queues.get_mut(&h.queue) {
                queue.requeue(h.message);
            }
        }
        returned
    }

    fn close_all_channels(&mut self) {
        let ids: Vec<u64> = self.channels.keys().copied().collect();
        for id in ids {
            self.close_channel(id);
        }
    }

    fn wake_consumers(&self) {
        for channel in self.channels.values() {
            channel.notify.notify_one();
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a shared in-memory broker. Clones see the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// An unreachable broker refuses new connections and drops existing ones.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = lock(&self.state);
        state.reachable = reachable;
        if !reachable {
            state.close_all_channels();
        }
    }

    /// Simulate a broker restart: connections are dropped, non-durable queues and
    /// transient messages are lost.
    pub fn restart(&self) {
        let mut state = lock(&self.state);
        state.close_all_channels();
        state.queues.retain(|_, queue| queue.durable);
        for queue in state.queues.values_mut() {
            queue.messages.retain(|m| m.persistent);
        }
        tracing::debug!(queues = state.queues.len(), "In-memory broker restarted");
    }

    /// Make the next `count` publish calls fail with `fault`.
    pub fn fail_next_publishes(&self, count: usize, fault: PublishFault) {
        let mut state = lock(&self.state);
        state.publish_faults.extend(std::iter::repeat(fault).take(count));
    }

    /// Store a raw body directly, bypassing channels and injected faults.
    pub fn push_raw(&self, queue: &str, body: &[u8]) -> Result<(), ChannelError> {
        lock(&self.state).enqueue(queue, body, true)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    /// Messages waiting in `queue`, not counting reserved deliveries.
    pub fn queue_len(&self, name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Bodies waiting in `queue`, in delivery order.
    pub fn messages(&self, name: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .queues
            .get(name)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries reserved by any open channel.
    pub fn unacked_count(&self) -> usize {
        lock(&self.state)
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    pub fn connections_opened(&self) -> u64 {
        lock(&self.state).connections_opened
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        let mut state = lock(&self.broker.state);
        if !state.reachable {
            return Err(ChannelError::Connection(
                "in-memory broker is unreachable".to_string(),
            ));
        }

        state.next_channel_id += 1;
        state.connections_opened += 1;
        let id = state.next_channel_id;
        let notify = Arc::new(Notify::new());
        state.channels.insert(
            id,
            ChannelState {
                prefetch: 0,
                unacked: HashMap::new(),
                next_tag: 0,
                notify: notify.clone(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            state: self.broker.state.clone(),
            id,
            notify,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

pub struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
    notify: Arc<Notify>,
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                durable: options.durable,
                dead_letter: options.dead_letter.clone(),
                messages: VecDeque::new(),
            });
        options.ensure_matches(
            name,
            &QueueOptions {
                durable: queue.durable,
                dead_letter: queue.dead_letter.clone(),
            },
        )
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        let channel = state.channels.get_mut(&self.id).ok_or(ChannelError::Closed)?;
        channel.prefetch = count;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<bool, ChannelError> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        match state.publish_faults.pop_front() {
            Some(PublishFault::NotSent) => return Ok(false),
            Some(PublishFault::ConnectionLost) => {
                state.close_channel(self.id);
                return Err(ChannelError::Connection(
                    "connection reset during publish".to_string(),
                ));
            }
            None => {}
        }

        state.enqueue(queue, body, options.persistent)?;
        Ok(true)
    }

    async fn next_delivery(&self, queue: &str) -> Result<Option<Delivery>, ChannelError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let channel = state.channels.get_mut(&self.id).ok_or(ChannelError::Closed)?;

        if channel.prefetch > 0 && channel.unacked.len() >= usize::from(channel.prefetch) {
            return Ok(None);
        }

        let Some(source) = state.queues.get_mut(queue) else {
            return Err(ChannelError::QueueNotDeclared(queue.to_string()));
        };
        let Some(mut message) = source.messages.pop_front() else {
            return Ok(None);
        };

        message.delivery_count += 1;
        channel.next_tag += 1;
        let tag = channel.next_tag;
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            body: message.body.clone(),
            redelivered: message.delivery_count > 1,
        };
        channel.unacked.insert(
            tag,
            Held {
                queue: queue.to_string(),
                message,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        let channel = state.channels.get_mut(&self.id).ok_or(ChannelError::Closed)?;
        channel
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(ChannelError::UnknownDelivery(tag))
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), ChannelError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let channel = state.channels.get_mut(&self.id).ok_or(ChannelError::Closed)?;
        let held = channel
            .unacked
            .remove(&tag)
            .ok_or(ChannelError::UnknownDelivery(tag))?;

        if requeue {
            if let Some(queue) = state.queues.get_mut(&held.queue) {
                queue.requeue(held.message);
            }
            state.wake_consumers();
            return Ok(());
        }

        let dead_letter = state
            .queues
            .get(&held.queue)
            .and_then(|q| q.dead_letter.clone());
        match dead_letter.and_then(|name| state.queues.get_mut(&name)) {
            Some(target) => target.messages.push_back(held.message),
            None => {
                tracing::debug!(queue = %held.queue, tag, "Rejected message dropped");
            }
        }
        Ok(())
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn is_open(&self) -> bool {
        lock(&self.state).channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        let returned = state.close_channel(self.id);
        if returned > 0 {
            state.wake_consumers();
        }
        Ok(())
    }
}
