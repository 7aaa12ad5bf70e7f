//! The dispatch algorithm and per-operation state transitions of §4.
//!
//! `QueueState` owns every entity of §3's data model and is only ever
//! touched from inside [`crate::process::QueueProcess`]'s mailbox loop, so
//! none of its methods need internal locking (§5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bq_common::{
    Channel, ChannelId, ConsumerTag, Delivery, DeliveryId, DeliveryIdGenerator, Limiter, Message,
    PersistItem, Persister, QueueConfig, QueueOpError, TxnId, TxnScope,
};
use tracing::{debug, warn};

use crate::command::{GetResult, RouteOutcome};
use crate::consumer_queue::ConsumerQueue;
use crate::metrics;
use crate::record::{
    Buffered, ChannelRecord, ConsumerKey, ConsumerRecord, ExclusiveConsumer, Owner,
    QueueDescriptor, TxnRecord,
};

enum DeliverAttempt {
    Delivered,
    NotDelivered,
}

pub struct QueueState {
    pub descriptor: QueueDescriptor,
    pub owner: Option<Owner>,
    pub exclusive_consumer: Option<ExclusiveConsumer>,
    pub has_had_consumers: bool,
    next_delivery_id: DeliveryIdGenerator,
    pub buffer: VecDeque<Buffered>,
    pub active: ConsumerQueue,
    pub blocked: ConsumerQueue,
    pub channels: HashMap<ChannelId, ChannelRecord>,
    pub consumers: HashMap<ConsumerKey, ConsumerRecord>,
    pub transactions: HashMap<TxnId, TxnRecord>,
    persister: Arc<dyn Persister>,
    config: QueueConfig,
}

impl QueueState {
    pub fn new(descriptor: QueueDescriptor, persister: Arc<dyn Persister>, config: QueueConfig) -> Self {
        Self {
            descriptor,
            owner: None,
            exclusive_consumer: None,
            has_had_consumers: false,
            next_delivery_id: DeliveryIdGenerator::new(),
            buffer: VecDeque::new(),
            active: ConsumerQueue::new(),
            blocked: ConsumerQueue::new(),
            channels: HashMap::new(),
            consumers: HashMap::new(),
            transactions: HashMap::new(),
            persister,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// True once no channel holds any consumer (I2/I3 territory, used by
    /// `claim` and the auto-delete gate).
    fn is_unused(&self) -> bool {
        self.active.is_empty() && self.blocked.is_empty()
    }

    pub fn auto_delete_due(&self) -> bool {
        self.descriptor.auto_delete && self.has_had_consumers && self.is_unused()
    }

    // ---- 4.1.1 Declare/Attach --------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn register_consumer(
        &mut self,
        channel_id: ChannelId,
        channel: Arc<dyn Channel>,
        limiter: Option<Arc<dyn Limiter>>,
        tag: ConsumerTag,
        ack_required: bool,
        exclusive: bool,
    ) -> Result<(), QueueOpError> {
        if let Some(owner) = self.owner {
            if owner.channel_id != channel_id {
                return Err(QueueOpError::QueueOwnedByAnotherConnection);
            }
        }
        if self.exclusive_consumer.is_some() || (exclusive && !self.is_unused()) {
            return Err(QueueOpError::ExclusiveConsumeUnavailable);
        }

        let key = ConsumerKey { channel_id, tag: tag.clone() };
        let record = self
            .channels
            .entry(channel_id)
            .or_insert_with(|| ChannelRecord::new(channel));
        let first_consumer_for_channel = record.consumer_count == 0;
        record.consumer_count += 1;
        if first_consumer_for_channel {
            if let Some(limiter) = &limiter {
                limiter.register().await;
            }
            record.limiter = limiter;
        }
        let blocked_now = record.is_blocked(self.config.unsent_limit);

        self.consumers.insert(key.clone(), ConsumerRecord { tag, ack_required });
        if exclusive {
            self.exclusive_consumer = Some(ExclusiveConsumer {
                channel_id,
                tag: self.consumers.get(&key).expect("just inserted").tag.clone(),
            });
        }
        self.has_had_consumers = true;

        if blocked_now {
            self.blocked.push_back(key);
        } else {
            self.active.push_back(key);
            self.dispatch_loop().await;
        }
        Ok(())
    }

    pub async fn cancel_consumer(&mut self, channel_id: ChannelId, tag: ConsumerTag) {
        let key = ConsumerKey { channel_id, tag: tag.clone() };
        self.active.remove(&key);
        self.blocked.remove(&key);
        self.consumers.remove(&key);

        if self.exclusive_consumer.as_ref().map(|e| (e.channel_id, &e.tag)) == Some((channel_id, &tag)) {
            self.exclusive_consumer = None;
        }

        if let Some(record) = self.channels.get_mut(&channel_id) {
            record.consumer_count = record.consumer_count.saturating_sub(1);
            if record.consumer_count == 0 {
                if let Some(limiter) = record.limiter.take() {
                    limiter.unregister().await;
                }
            }
        }
    }

    pub fn claim(&mut self, channel_id: ChannelId) -> Result<(), QueueOpError> {
        if let Some(owner) = self.owner {
            if owner.channel_id == channel_id {
                return Ok(());
            }
            return Err(QueueOpError::Locked);
        }
        if !self.is_unused() {
            return Err(QueueOpError::Locked);
        }
        self.owner = Some(Owner { channel_id });
        Ok(())
    }

    // ---- 4.1.2 Publish ------------------------------------------------

    pub async fn deliver(&mut self, txn: Option<TxnId>, channel_id: ChannelId, message: Message) -> RouteOutcome {
        if let Some(txn_id) = txn {
            self.record_txn_publish(txn_id, channel_id, message).await;
            return RouteOutcome::Queued;
        }
        self.persist_publish_if_needed(&message).await;
        metrics::message_published(&self.descriptor.name);
        let was_empty = self.buffer.is_empty();
        self.buffer.push_back(Buffered { message, redelivered: false });
        self.dispatch_loop().await;
        if was_empty && self.buffer.is_empty() {
            RouteOutcome::Routed
        } else {
            RouteOutcome::Queued
        }
    }

    /// Resolves the ambiguity noted in SPEC_FULL §9.1: an immediate
    /// publish inside a transaction is recorded as deferred work rather
    /// than attempted now, matching the common paragraph in §4.1.2 that
    /// applies to both publish operations.
    pub async fn deliver_immediately(&mut self, txn: Option<TxnId>, channel_id: ChannelId, message: Message) -> bool {
        if let Some(txn_id) = txn {
            self.record_txn_publish(txn_id, channel_id, message).await;
            return true;
        }
        self.persist_publish_if_needed(&message).await;
        matches!(self.try_deliver(&message, false).await, DeliverAttempt::Delivered)
    }

    /// Stages a transactional publish (§4.2.2: txn items are persisted at
    /// record time via `extend_transaction`, committed atomically later).
    async fn record_txn_publish(&mut self, txn_id: TxnId, channel_id: ChannelId, message: Message) {
        let persist_item = message.persistence_key.clone().map(|key| PersistItem::Publish {
            message: message.clone(),
            queue: self.descriptor.name.clone(),
            key,
        });
        let txn = self
            .transactions
            .entry(txn_id.clone())
            .or_insert_with(|| TxnRecord::new(channel_id));
        txn.pending_publishes.push(message);
        if let Some(item) = persist_item {
            txn.is_persistent = true;
            let scope = TxnScope { txn_id, queue_name: self.descriptor.name.clone() };
            self.persister.extend_transaction(scope, vec![item]).await;
        }
    }

    async fn persist_publish_if_needed(&self, message: &Message) {
        if let Some(key) = &message.persistence_key {
            self.persister
                .dirty_work(vec![PersistItem::Publish {
                    message: message.clone(),
                    queue: self.descriptor.name.clone(),
                    key: key.clone(),
                }])
                .await;
        }
    }

    // ---- 4.1.3 Consume-side --------------------------------------------

    pub async fn basic_get(&mut self, channel_id: ChannelId, channel: Arc<dyn Channel>, ack_required: bool) -> GetResult {
        let Some(buffered) = self.buffer.pop_front() else {
            return GetResult::Empty;
        };
        let delivery_id = self.next_delivery_id.next();
        if ack_required {
            let record = self.channels.entry(channel_id).or_insert_with(|| ChannelRecord::new(channel));
            record.unacked.insert(delivery_id, buffered.message.clone());
        } else if let Some(key) = &buffered.message.persistence_key {
            // §4.2.2: a no-ack get is implicitly acked at delivery time, so
            // its Publish WAL entry must be reclaimed immediately, exactly
            // as a no-ack push delivery is in `try_deliver`.
            self.persister
                .dirty_work(vec![PersistItem::Ack {
                    queue: self.descriptor.name.clone(),
                    key: key.clone(),
                }])
                .await;
        }
        GetResult::Message {
            message: buffered.message,
            delivery_id,
            remaining: self.buffer.len() as u64,
        }
    }

    pub async fn ack(
        &mut self,
        txn: Option<TxnId>,
        channel_id: ChannelId,
        delivery_ids: Vec<DeliveryId>,
    ) -> Result<(), QueueOpError> {
        if delivery_ids.is_empty() {
            return Ok(());
        }
        self.check_known_delivery_tags(channel_id, &delivery_ids)?;
        let record = self.channels.get_mut(&channel_id).expect("checked above");
        let mut removed_ids = Vec::with_capacity(delivery_ids.len());
        let mut removed_messages = Vec::with_capacity(delivery_ids.len());
        for id in &delivery_ids {
            if let Some(message) = record.unacked.remove(id) {
                removed_ids.push(*id);
                removed_messages.push(message);
            }
        }
        record.unsent_message_count = record.unsent_message_count.saturating_sub(removed_ids.len() as u32);

        match txn {
            None => {
                // §4.3.3: a tagged consumer's ack frees Limiter credit;
                // basic-get acks carry no consumer tag and so never
                // touch the Limiter. Approximated per-channel rather than
                // per-delivery-id (`unacked` stores no origin tag): a
                // channel that both has a registered consumer and makes
                // basic-get calls will over-credit the Limiter for any
                // get-originated ids in the same ack batch. See open
                // questions in SPEC_FULL.md.
                let has_tagged_consumer = self.consumers.keys().any(|k| k.channel_id == channel_id);
                if has_tagged_consumer && !removed_ids.is_empty() {
                    if let Some(limiter) = &self.channels.get(&channel_id).expect("checked above").limiter {
                        limiter.notify_ack(removed_ids.len() as u32).await;
                    }
                }
                let items: Vec<PersistItem> = removed_messages
                    .iter()
                    .filter_map(|m| {
                        m.persistence_key.clone().map(|key| PersistItem::Ack {
                            queue: self.descriptor.name.clone(),
                            key,
                        })
                    })
                    .collect();
                if !items.is_empty() {
                    self.persister.dirty_work(items).await;
                }
                if !removed_ids.is_empty() {
                    metrics::message_acked(&self.descriptor.name, removed_ids.len() as u64);
                }
                self.reevaluate_flow_control(channel_id).await;
            }
            Some(txn_id) => {
                let persist_items: Vec<PersistItem> = removed_messages
                    .iter()
                    .filter_map(|m| {
                        m.persistence_key.clone().map(|key| PersistItem::Ack {
                            queue: self.descriptor.name.clone(),
                            key,
                        })
                    })
                    .collect();
                let became_persistent = !persist_items.is_empty();
                {
                    let txn = self
                        .transactions
                        .entry(txn_id.clone())
                        .or_insert_with(|| TxnRecord::new(channel_id));
                    txn.pending_ack_batches.push(removed_ids);
                    if became_persistent {
                        txn.is_persistent = true;
                    }
                }
                if became_persistent {
                    let scope = TxnScope { txn_id: txn_id.clone(), queue_name: self.descriptor.name.clone() };
                    self.persister.extend_transaction(scope, persist_items).await;
                }
                if let Some(record) = self.channels.get_mut(&channel_id) {
                    record.current_txn = Some(txn_id);
                }
            }
        }
        Ok(())
    }

    pub async fn reject(
        &mut self,
        channel_id: ChannelId,
        delivery_ids: Vec<DeliveryId>,
        requeue: bool,
    ) -> Result<(), QueueOpError> {
        if delivery_ids.is_empty() {
            return Ok(());
        }
        self.check_known_delivery_tags(channel_id, &delivery_ids)?;
        let record = self.channels.get_mut(&channel_id).expect("checked above");
        let mut reclaimed = Vec::with_capacity(delivery_ids.len());
        for id in &delivery_ids {
            if let Some(message) = record.unacked.remove(id) {
                reclaimed.push(message);
            }
        }
        record.unsent_message_count = record.unsent_message_count.saturating_sub(reclaimed.len() as u32);
        if requeue {
            for message in reclaimed {
                self.buffer.push_back(Buffered { message, redelivered: true });
            }
            self.dispatch_loop().await;
        } else {
            // A discarding reject behaves like an ack as far as the
            // Limiter and persister are concerned (§4.1.3): the message
            // is gone for good.
            let items: Vec<PersistItem> = reclaimed
                .iter()
                .filter_map(|m| {
                    m.persistence_key.clone().map(|key| PersistItem::Ack {
                        queue: self.descriptor.name.clone(),
                        key,
                    })
                })
                .collect();
            if !items.is_empty() {
                self.persister.dirty_work(items).await;
            }
            if !reclaimed.is_empty() {
                if let Some(limiter) = &self.channels.get(&channel_id).expect("checked above").limiter {
                    limiter.notify_ack(reclaimed.len() as u32).await;
                }
            }
        }
        self.reevaluate_flow_control(channel_id).await;
        Ok(())
    }

    pub async fn requeue(&mut self, channel_id: ChannelId, delivery_ids: Vec<DeliveryId>) -> Result<(), QueueOpError> {
        if delivery_ids.is_empty() {
            return Ok(());
        }
        self.check_known_delivery_tags(channel_id, &delivery_ids)?;
        let record = self.channels.get_mut(&channel_id).expect("checked above");
        let mut reclaimed = Vec::with_capacity(delivery_ids.len());
        for id in &delivery_ids {
            if let Some(message) = record.unacked.remove(id) {
                reclaimed.push(message);
            }
        }
        record.unsent_message_count = record.unsent_message_count.saturating_sub(reclaimed.len() as u32);
        for message in reclaimed {
            self.buffer.push_back(Buffered { message, redelivered: true });
        }
        self.dispatch_loop().await;
        Ok(())
    }

    /// §7 `unknown-delivery-tag`: fatal channel error, queue state left
    /// untouched. Checked before any removal so a batch with one bad id
    /// does not partially apply.
    fn check_known_delivery_tags(&self, channel_id: ChannelId, delivery_ids: &[DeliveryId]) -> Result<(), QueueOpError> {
        let record = self.channels.get(&channel_id);
        for id in delivery_ids {
            let known = record.map(|r| r.unacked.contains_key(id)).unwrap_or(false);
            if !known {
                return Err(QueueOpError::UnknownDeliveryTag(id.0));
            }
        }
        Ok(())
    }

    pub async fn redeliver(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.buffer.push_back(Buffered { message, redelivered: true });
        }
        self.dispatch_loop().await;
    }

    // ---- 4.1.4 Transaction coordination ---------------------------------

    pub async fn commit(&mut self, txn_id: TxnId) -> Result<(), QueueOpError> {
        let Some(txn) = self.transactions.get(&txn_id) else {
            return Ok(());
        };
        if txn.is_persistent {
            let scope = TxnScope { txn_id: txn_id.clone(), queue_name: self.descriptor.name.clone() };
            self.persister
                .commit_transaction(scope)
                .await
                .map_err(QueueOpError::PersisterCommitFailure)?;
        }

        let Some(txn) = self.transactions.remove(&txn_id) else {
            return Ok(());
        };

        for message in txn.pending_publishes {
            self.buffer.push_back(Buffered { message, redelivered: false });
        }
        self.dispatch_loop().await;

        for batch in txn.pending_ack_batches {
            if let Some(record) = self.channels.get_mut(&txn.origin_channel) {
                let mut removed = 0u32;
                for id in batch {
                    if record.unacked.remove(&id).is_some() {
                        removed += 1;
                    }
                }
                record.unsent_message_count = record.unsent_message_count.saturating_sub(removed);
            }
        }
        self.reevaluate_flow_control(txn.origin_channel).await;
        Ok(())
    }

    pub async fn rollback(&mut self, txn_id: TxnId) {
        let Some(txn) = self.transactions.remove(&txn_id) else {
            return;
        };
        if txn.is_persistent {
            let scope = TxnScope { txn_id, queue_name: self.descriptor.name.clone() };
            self.persister.rollback_transaction(scope).await;
        }
    }

    async fn rollback_txns_owned_by(&mut self, channel_id: ChannelId) {
        let dead: Vec<TxnId> = self
            .transactions
            .iter()
            .filter(|(_, t)| t.origin_channel == channel_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            self.rollback(id).await;
        }
    }

    // ---- 4.1.5 Lifecycle --------------------------------------------

    pub fn delete(&self, if_unused: bool, if_empty: bool) -> Result<u64, QueueOpError> {
        if if_unused && !self.is_unused() {
            return Err(QueueOpError::InUse);
        }
        if if_empty && !self.buffer.is_empty() {
            return Err(QueueOpError::NotEmpty);
        }
        Ok(self.buffer.len() as u64)
    }

    pub async fn purge(&mut self) -> u64 {
        let drained: Vec<Buffered> = self.buffer.drain(..).collect();
        let count = drained.len() as u64;
        let items: Vec<PersistItem> = drained
            .iter()
            .filter_map(|b| {
                b.message.persistence_key.clone().map(|key| PersistItem::Ack {
                    queue: self.descriptor.name.clone(),
                    key,
                })
            })
            .collect();
        if !items.is_empty() {
            self.persister.dirty_work(items).await;
        }
        count
    }

    /// §4.4 channel-death handling. Returns the messages to hand back to
    /// [`crate::process::QueueProcess`] so it can notify the channel of
    /// cancellation, plus whether this state change triggers auto-delete.
    pub async fn notify_channel_down(&mut self, channel_id: ChannelId) -> (Vec<ConsumerTag>, bool) {
        if self.exclusive_consumer.as_ref().map(|e| e.channel_id) == Some(channel_id) {
            self.exclusive_consumer = None;
        }

        let cancelled_tags: Vec<ConsumerTag> = self
            .consumers
            .keys()
            .filter(|k| k.channel_id == channel_id)
            .map(|k| k.tag.clone())
            .collect();
        self.active.remove_channel(channel_id);
        self.blocked.remove_channel(channel_id);
        for tag in &cancelled_tags {
            self.consumers.remove(&ConsumerKey { channel_id, tag: tag.clone() });
        }

        self.rollback_txns_owned_by(channel_id).await;

        if let Some(mut record) = self.channels.remove(&channel_id) {
            let redelivered: Vec<Message> = record.unacked.drain().map(|(_, m)| m).collect();
            if !redelivered.is_empty() {
                metrics::message_redelivered(&self.descriptor.name, redelivered.len() as u64);
            }
            for message in redelivered {
                self.buffer.push_back(Buffered { message, redelivered: true });
            }
            if let Some(limiter) = record.limiter.take() {
                limiter.unregister().await;
            }
        }
        self.dispatch_loop().await;

        if self.owner.as_ref().map(|o| o.channel_id) == Some(channel_id) {
            self.owner = None;
        }

        (cancelled_tags, self.auto_delete_due())
    }

    /// §4.1.5 `notify-owner-down`. True if this was an exclusive queue and
    /// should now terminate.
    pub fn notify_owner_down(&mut self) -> bool {
        let was_exclusive = self.owner.is_some();
        self.owner = None;
        was_exclusive
    }

    async fn reevaluate_flow_control(&mut self, channel_id: ChannelId) {
        let Some(record) = self.channels.get_mut(&channel_id) else {
            return;
        };
        let was_blocked = self.blocked.has_channel(channel_id);
        record.is_limit_active = false;
        let still_blocked = record.is_blocked(self.config.unsent_limit);
        if was_blocked && !still_blocked {
            self.move_channel_blocked_to_active(channel_id);
            self.dispatch_loop().await;
        }
    }

    /// Explicit unblock signal forwarded from the channel's Limiter
    /// (§4.2.1 `notify-sent`).
    pub async fn notify_sent(&mut self, channel_id: ChannelId) {
        self.reevaluate_flow_control(channel_id).await;
    }

    // ---- 4.2 dispatch algorithm -----------------------------------------

    async fn dispatch_loop(&mut self) {
        loop {
            let Some(buffered) = self.buffer.front() else {
                break;
            };
            let message = buffered.message.clone();
            let redelivered = buffered.redelivered;
            match self.try_deliver(&message, redelivered).await {
                DeliverAttempt::Delivered => {
                    self.buffer.pop_front();
                }
                DeliverAttempt::NotDelivered => break,
            }
        }
    }

    async fn try_deliver(&mut self, message: &Message, redelivered: bool) -> DeliverAttempt {
        loop {
            let Some(key) = self.active.pop_front() else {
                return DeliverAttempt::NotDelivered;
            };
            self.active.push_back(key.clone());

            let ack_required = match self.consumers.get(&key) {
                Some(c) => c.ack_required,
                None => continue,
            };

            let can_send = {
                let record = self
                    .channels
                    .get(&key.channel_id)
                    .expect("active consumer must have a channel record");
                match &record.limiter {
                    Some(limiter) => limiter.can_send(ack_required).await,
                    None => true,
                }
            };
            if !can_send {
                if let Some(record) = self.channels.get_mut(&key.channel_id) {
                    record.is_limit_active = true;
                }
                self.move_channel_active_to_blocked(key.channel_id);
                continue;
            }

            let delivery_id = self.next_delivery_id.next();
            let channel = self
                .channels
                .get(&key.channel_id)
                .expect("active consumer must have a channel record")
                .channel
                .clone();
            channel
                .deliver(
                    &key.tag,
                    Delivery {
                        queue_name: self.descriptor.name.clone(),
                        delivery_id,
                        redelivered,
                        message: message.clone(),
                    },
                )
                .await;

            let old_blocked = self.channel_is_blocked(key.channel_id);
            if let Some(record) = self.channels.get_mut(&key.channel_id) {
                if ack_required {
                    record.unacked.insert(delivery_id, message.clone());
                } else if let Some(persist_key) = &message.persistence_key {
                    self.persister
                        .dirty_work(vec![PersistItem::Ack {
                            queue: self.descriptor.name.clone(),
                            key: persist_key.clone(),
                        }])
                        .await;
                }
            }
            if let Some(record) = self.channels.get_mut(&key.channel_id) {
                record.unsent_message_count += 1;
            }
            let new_blocked = self.channel_is_blocked(key.channel_id);
            if !old_blocked && new_blocked {
                self.move_channel_active_to_blocked(key.channel_id);
            }
            metrics::message_delivered(&self.descriptor.name);
            metrics::buffer_depth(&self.descriptor.name, self.buffer.len() as u64);
            metrics::blocked_consumers(&self.descriptor.name, self.blocked.len() as u64);
            return DeliverAttempt::Delivered;
        }
    }

    fn channel_is_blocked(&self, channel_id: ChannelId) -> bool {
        self.channels
            .get(&channel_id)
            .map(|r| r.is_blocked(self.config.unsent_limit))
            .unwrap_or(false)
    }

    fn move_channel_active_to_blocked(&mut self, channel_id: ChannelId) {
        let moved = self.active.remove_channel(channel_id);
        if !moved.is_empty() {
            warn!(channel = %channel_id, moved = moved.len(), "channel flow-blocked");
        }
        for key in moved {
            self.blocked.push_back(key);
        }
    }

    /// §3 lifecycle: on termination, roll back every open transaction and
    /// reclaim durable state for whatever is still buffered or unacked by
    /// submitting artificial acks.
    pub async fn terminate(&mut self) {
        let open_txns: Vec<TxnId> = self.transactions.keys().cloned().collect();
        for txn_id in open_txns {
            self.rollback(txn_id).await;
        }

        let mut items = Vec::new();
        for buffered in self.buffer.drain(..) {
            if let Some(key) = buffered.message.persistence_key {
                items.push(PersistItem::Ack { queue: self.descriptor.name.clone(), key });
            }
        }
        for (_, record) in self.channels.drain() {
            for (_, message) in record.unacked {
                if let Some(key) = message.persistence_key {
                    items.push(PersistItem::Ack { queue: self.descriptor.name.clone(), key });
                }
            }
        }
        if !items.is_empty() {
            self.persister.dirty_work(items).await;
        }
    }

    /// Correctness-neutral idle optimization (§5 "Hibernation"): release
    /// spare capacity from the collections without changing any state.
    pub fn hibernate(&mut self) {
        self.buffer.shrink_to_fit();
        self.active.shrink_to_fit();
        self.blocked.shrink_to_fit();
        self.channels.shrink_to_fit();
        self.consumers.shrink_to_fit();
        self.transactions.shrink_to_fit();
    }

    fn move_channel_blocked_to_active(&mut self, channel_id: ChannelId) {
        let moved = self.blocked.remove_channel(channel_id);
        if !moved.is_empty() {
            debug!(channel = %channel_id, moved = moved.len(), "channel unblocked");
        }
        for key in moved {
            self.active.push_back(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingChannel {
        deliveries: Mutex<Vec<Delivery>>,
        cancellations: Mutex<Vec<ConsumerTag>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self { deliveries: Mutex::new(Vec::new()), cancellations: Mutex::new(Vec::new()) })
        }

        fn deliveries(&self) -> Vec<Delivery> {
            self.deliveries.lock().clone()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        async fn deliver(&self, _tag: &ConsumerTag, delivery: Delivery) {
            self.deliveries.lock().push(delivery);
        }

        async fn consumer_cancelled(&self, tag: ConsumerTag) {
            self.cancellations.lock().push(tag);
        }
    }

    struct NullPersister;

    #[async_trait]
    impl Persister for NullPersister {
        async fn dirty_work(&self, _items: Vec<PersistItem>) {}
        async fn extend_transaction(&self, _scope: TxnScope, _items: Vec<PersistItem>) {}
        async fn commit_transaction(&self, _scope: TxnScope) -> Result<(), String> {
            Ok(())
        }
        async fn rollback_transaction(&self, _scope: TxnScope) {}
    }

    /// A limiter whose credit can be toggled mid-test, tracking how many
    /// times each method fired.
    struct ToggleLimiter {
        allowed: std::sync::atomic::AtomicBool,
        acked: std::sync::atomic::AtomicU32,
    }

    impl ToggleLimiter {
        fn new(allowed: bool) -> Arc<Self> {
            Arc::new(Self {
                allowed: std::sync::atomic::AtomicBool::new(allowed),
                acked: std::sync::atomic::AtomicU32::new(0),
            })
        }

        fn set_allowed(&self, allowed: bool) {
            self.allowed.store(allowed, std::sync::atomic::Ordering::SeqCst);
        }

        fn acked_count(&self) -> u32 {
            self.acked.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Limiter for ToggleLimiter {
        async fn can_send(&self, _ack_required: bool) -> bool {
            self.allowed.load(std::sync::atomic::Ordering::SeqCst)
        }
        async fn register(&self) {}
        async fn unregister(&self) {}
        async fn notify_ack(&self, count: u32) {
            self.acked.fetch_add(count, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn state(config: QueueConfig) -> QueueState {
        QueueState::new(QueueDescriptor::new("q"), Arc::new(NullPersister), config)
    }

    fn tag(s: &str) -> ConsumerTag {
        ConsumerTag(s.to_string())
    }

    #[tokio::test]
    async fn publish_with_no_consumers_just_buffers() {
        let mut s = state(QueueConfig::default());
        let outcome = s.deliver(None, ChannelId(1), Message::new("body")).await;
        assert_eq!(outcome, RouteOutcome::Queued);
        assert_eq!(s.buffer.len(), 1);
    }

    #[tokio::test]
    async fn publish_routes_directly_to_waiting_consumer() {
        let mut s = state(QueueConfig::default());
        let channel = RecordingChannel::new();
        s.register_consumer(ChannelId(1), channel.clone(), None, tag("c1"), false, false)
            .await
            .unwrap();

        let outcome = s.deliver(None, ChannelId(1), Message::new("body")).await;
        assert_eq!(outcome, RouteOutcome::Routed);
        assert_eq!(channel.deliveries().len(), 1);
        assert!(s.buffer.is_empty());
    }

    #[tokio::test]
    async fn active_consumers_rotate_round_robin() {
        let mut s = state(QueueConfig::default());
        let c1 = RecordingChannel::new();
        let c2 = RecordingChannel::new();
        s.register_consumer(ChannelId(1), c1.clone(), None, tag("c1"), false, false).await.unwrap();
        s.register_consumer(ChannelId(2), c2.clone(), None, tag("c2"), false, false).await.unwrap();

        for _ in 0..4 {
            s.deliver(None, ChannelId(99), Message::new("body")).await;
        }

        assert_eq!(c1.deliveries().len(), 2);
        assert_eq!(c2.deliveries().len(), 2);
    }

    #[tokio::test]
    async fn channel_blocks_at_unsent_cap_and_unblocks_on_ack() {
        let mut s = state(QueueConfig { unsent_limit: 1, ..QueueConfig::default() });
        let channel = RecordingChannel::new();
        s.register_consumer(ChannelId(1), channel.clone(), None, tag("c1"), true, false).await.unwrap();

        s.deliver(None, ChannelId(9), Message::new("one")).await;
        s.deliver(None, ChannelId(9), Message::new("two")).await;

        // Second message stays buffered: the channel hit its unsent cap.
        assert_eq!(channel.deliveries().len(), 1);
        assert_eq!(s.buffer.len(), 1);
        assert!(s.active.is_empty());
        assert_eq!(s.blocked.len(), 1);

        let first_id = channel.deliveries()[0].delivery_id;
        s.ack(None, ChannelId(1), vec![first_id]).await.unwrap();

        assert_eq!(channel.deliveries().len(), 2);
        assert!(s.buffer.is_empty());
    }

    #[tokio::test]
    async fn limiter_false_blocks_channel_until_true_and_notify_sent() {
        let mut s = state(QueueConfig::default());
        let channel = RecordingChannel::new();
        let limiter = ToggleLimiter::new(false);
        s.register_consumer(ChannelId(1), channel.clone(), Some(limiter.clone()), tag("c1"), false, false)
            .await
            .unwrap();

        s.deliver(None, ChannelId(9), Message::new("one")).await;
        assert!(channel.deliveries().is_empty());
        assert_eq!(s.blocked.len(), 1);

        limiter.set_allowed(true);
        s.notify_sent(ChannelId(1)).await;
        assert_eq!(channel.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn reject_with_requeue_redelivers_to_the_same_consumer() {
        let mut s = state(QueueConfig::default());
        let channel = RecordingChannel::new();
        s.register_consumer(ChannelId(1), channel.clone(), None, tag("c1"), true, false).await.unwrap();
        s.deliver(None, ChannelId(9), Message::new("body")).await;

        let id = channel.deliveries()[0].delivery_id;
        s.reject(ChannelId(1), vec![id], true).await.unwrap();

        let deliveries = channel.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert!(!deliveries[0].redelivered);
        assert!(deliveries[1].redelivered);
    }

    #[tokio::test]
    async fn reject_without_requeue_discards_and_notifies_limiter() {
        let mut s = state(QueueConfig::default());
        let channel = RecordingChannel::new();
        let limiter = ToggleLimiter::new(true);
        s.register_consumer(ChannelId(1), channel.clone(), Some(limiter.clone()), tag("c1"), true, false)
            .await
            .unwrap();
        s.deliver(None, ChannelId(9), Message::new("body")).await;

        let id = channel.deliveries()[0].delivery_id;
        s.reject(ChannelId(1), vec![id], false).await.unwrap();

        assert_eq!(channel.deliveries().len(), 1);
        assert_eq!(limiter.acked_count(), 1);
    }

    #[tokio::test]
    async fn ack_with_unknown_delivery_tag_errors_and_leaves_state_untouched() {
        let mut s = state(QueueConfig::default());
        let channel = RecordingChannel::new();
        s.register_consumer(ChannelId(1), channel.clone(), None, tag("c1"), true, false).await.unwrap();
        s.deliver(None, ChannelId(9), Message::new("body")).await;

        let real_id = channel.deliveries()[0].delivery_id;
        let bogus_id = DeliveryId(real_id.0 + 1000);

        let err = s.ack(None, ChannelId(1), vec![real_id, bogus_id]).await.unwrap_err();
        assert!(matches!(err, QueueOpError::UnknownDeliveryTag(id) if id == bogus_id.0));

        // The whole batch was rejected, so the known id was not acked either.
        assert_eq!(s.channels.get(&ChannelId(1)).unwrap().unacked.len(), 1);
    }

    #[tokio::test]
    async fn transactional_publish_is_deferred_until_commit() {
        let mut s = state(QueueConfig::default());
        let channel = RecordingChannel::new();
        s.register_consumer(ChannelId(1), channel.clone(), None, tag("c1"), false, false).await.unwrap();

        let txn = TxnId("t1".to_string());
        s.deliver(Some(txn.clone()), ChannelId(1), Message::new("body")).await;
        assert!(channel.deliveries().is_empty());

        s.commit(txn).await.unwrap();
        assert_eq!(channel.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_pending_publish() {
        let mut s = state(QueueConfig::default());
        let channel = RecordingChannel::new();
        s.register_consumer(ChannelId(1), channel.clone(), None, tag("c1"), false, false).await.unwrap();

        let txn = TxnId("t2".to_string());
        s.deliver(Some(txn.clone()), ChannelId(1), Message::new("body")).await;
        s.rollback(txn).await;

        assert!(channel.deliveries().is_empty());
        assert!(s.buffer.is_empty());
    }

    #[tokio::test]
    async fn exclusive_consumer_blocks_second_registration() {
        let mut s = state(QueueConfig::default());
        let c1 = RecordingChannel::new();
        let c2 = RecordingChannel::new();
        s.register_consumer(ChannelId(1), c1, None, tag("c1"), false, true).await.unwrap();

        let err = s
            .register_consumer(ChannelId(2), c2, None, tag("c2"), false, false)
            .await
            .unwrap_err();
        assert_eq!(err, QueueOpError::ExclusiveConsumeUnavailable);
    }

    #[tokio::test]
    async fn claim_locks_queue_to_a_single_owner() {
        let mut s = state(QueueConfig::default());
        s.claim(ChannelId(1)).unwrap();
        // Re-claiming from the same channel is idempotent.
        s.claim(ChannelId(1)).unwrap();
        assert_eq!(s.claim(ChannelId(2)).unwrap_err(), QueueOpError::Locked);
    }

    #[tokio::test]
    async fn channel_down_redelivers_its_unacked_messages() {
        let mut s = state(QueueConfig::default());
        let c1 = RecordingChannel::new();
        let c2 = RecordingChannel::new();
        s.register_consumer(ChannelId(1), c1.clone(), None, tag("c1"), true, false).await.unwrap();
        s.deliver(None, ChannelId(9), Message::new("body")).await;
        assert_eq!(c1.deliveries().len(), 1);

        let (cancelled, _) = s.notify_channel_down(ChannelId(1)).await;
        assert_eq!(cancelled, vec![tag("c1")]);

        s.register_consumer(ChannelId(2), c2.clone(), None, tag("c2"), true, false).await.unwrap();
        assert_eq!(c2.deliveries().len(), 1);
        assert!(c2.deliveries()[0].redelivered);
    }

    /// P5: round-robin over k identical active consumers with m > k
    /// messages gives each consumer floor(m/k) or ceil(m/k) deliveries.
    #[tokio::test]
    async fn round_robin_splits_messages_within_one_of_equal() {
        let mut s = state(QueueConfig::default());
        let channels: Vec<Arc<RecordingChannel>> = (0..3).map(|_| RecordingChannel::new()).collect();
        for (i, c) in channels.iter().enumerate() {
            s.register_consumer(ChannelId(i as u64), c.clone(), None, tag(&format!("c{i}")), false, false)
                .await
                .unwrap();
        }

        let m = 7;
        for _ in 0..m {
            s.deliver(None, ChannelId(99), Message::new("body")).await;
        }

        let counts: Vec<usize> = channels.iter().map(|c| c.deliveries().len()).collect();
        assert_eq!(counts.iter().sum::<usize>(), m);
        for count in &counts {
            assert!(*count == m / 3 || *count == m / 3 + 1, "unfair split: {counts:?}");
        }
    }

    /// P4: a channel with N unacked messages releases exactly N back to
    /// MessageBuffer on death, with no trace left in any bookkeeping map.
    #[tokio::test]
    async fn channel_death_releases_exactly_its_unacked_count() {
        let mut s = state(QueueConfig { unsent_limit: 10, ..QueueConfig::default() });
        let channel = RecordingChannel::new();
        s.register_consumer(ChannelId(1), channel.clone(), None, tag("c1"), true, false).await.unwrap();
        for _ in 0..3 {
            s.deliver(None, ChannelId(9), Message::new("body")).await;
        }
        assert_eq!(channel.deliveries().len(), 3);

        let before = s.buffer.len();
        s.notify_channel_down(ChannelId(1)).await;

        assert_eq!(s.buffer.len(), before + 3);
        assert!(!s.channels.contains_key(&ChannelId(1)));
        assert!(s.active.is_empty());
        assert!(s.blocked.is_empty());
    }

    #[tokio::test]
    async fn auto_delete_not_due_until_a_consumer_has_come_and_gone() {
        let mut s = state(QueueConfig::default());
        s.descriptor.auto_delete = true;
        assert!(!s.auto_delete_due());

        let channel = RecordingChannel::new();
        s.register_consumer(ChannelId(1), channel, None, tag("c1"), false, false).await.unwrap();
        assert!(!s.auto_delete_due());

        s.cancel_consumer(ChannelId(1), tag("c1")).await;
        assert!(s.auto_delete_due());
    }
}
