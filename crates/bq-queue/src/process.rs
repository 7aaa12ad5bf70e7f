//! The `QueueProcess` actor (§4.1, §4.5, §5): a single mailbox-serialized
//! task per queue, plus the [`QueueHandle`] callers use to talk to it.

use std::convert::Infallible;
use std::sync::Arc;

use bq_common::{
    BrokerError, Channel, ChannelId, ConsumerTag, DeliveryId, Limiter, Message, Persister,
    QueueConfig, QueueOpError, TxnId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::command::{Command, GetResult, RouteOutcome};
use crate::record::QueueDescriptor;
use crate::state::QueueState;

const MAILBOX_CAPACITY: usize = 1024;

/// A liveness token: the receiving half of a channel whose sender is held
/// by the counterparty this queue is monitoring (a channel or a queue
/// owner). Because `Infallible` can never be constructed, the only way
/// this ever resolves is the sender being dropped — i.e. the counterparty
/// dying (§9 "Monitor references").
pub type LivenessToken = oneshot::Receiver<Infallible>;

/// A cloneable, cheap-to-share handle to a running `QueueProcess`.
/// Every method sends one [`Command`] and, for synchronous operations,
/// awaits the reply.
#[derive(Clone)]
pub struct QueueHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the actor task has exited and its mailbox dropped —
    /// used by the [`crate::supervisor::Supervisor`] to detect a dead
    /// process needing a restart.
    pub fn is_dead(&self) -> bool {
        self.tx.is_closed()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn register_consumer(
        &self,
        channel_id: ChannelId,
        channel: Arc<dyn Channel>,
        liveness: LivenessToken,
        limiter: Option<Arc<dyn Limiter>>,
        tag: ConsumerTag,
        ack_required: bool,
        exclusive: bool,
    ) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::RegisterConsumer {
            channel_id,
            channel,
            liveness,
            limiter,
            tag,
            ack_required,
            exclusive,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)?.map_err(Into::into)
    }

    pub async fn cancel_consumer(&self, channel_id: ChannelId, tag: ConsumerTag) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::CancelConsumer { channel_id, tag, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)
    }

    pub async fn claim(&self, channel_id: ChannelId, liveness: LivenessToken) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Claim { channel_id, liveness, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)?.map_err(Into::into)
    }

    /// Mandatory publish. `want_outcome` mirrors §4.1.2's "returns routed
    /// vs queued only when the caller requested it".
    pub async fn deliver(
        &self,
        txn: Option<TxnId>,
        channel_id: ChannelId,
        message: Message,
        want_outcome: bool,
    ) -> Result<Option<RouteOutcome>, BrokerError> {
        if !want_outcome {
            self.send(Command::Deliver { txn, channel_id, message, reply: None }).await?;
            return Ok(None);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Deliver { txn, channel_id, message, reply: Some(reply_tx) }).await?;
        Ok(Some(reply_rx.await.map_err(|_| BrokerError::MailboxClosed)?))
    }

    pub async fn deliver_immediately(
        &self,
        txn: Option<TxnId>,
        channel_id: ChannelId,
        message: Message,
    ) -> Result<bool, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::DeliverImmediately { txn, channel_id, message, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)
    }

    pub async fn basic_get(
        &self,
        channel_id: ChannelId,
        channel: Arc<dyn Channel>,
        ack_required: bool,
    ) -> Result<GetResult, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::BasicGet { channel_id, channel, ack_required, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)
    }

    pub async fn ack(&self, txn: Option<TxnId>, channel_id: ChannelId, delivery_ids: Vec<DeliveryId>) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Ack { txn, channel_id, delivery_ids, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)?.map_err(Into::into)
    }

    pub async fn reject(&self, channel_id: ChannelId, delivery_ids: Vec<DeliveryId>, requeue: bool) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Reject { channel_id, delivery_ids, requeue, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)?.map_err(Into::into)
    }

    pub async fn requeue(&self, channel_id: ChannelId, delivery_ids: Vec<DeliveryId>) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Requeue { channel_id, delivery_ids, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)?.map_err(Into::into)
    }

    pub async fn redeliver(&self, messages: Vec<Message>) -> Result<(), BrokerError> {
        self.send(Command::Redeliver { messages }).await
    }

    pub async fn commit(&self, txn: TxnId) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Commit { txn, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)?.map_err(Into::into)
    }

    pub async fn rollback(&self, txn: TxnId) -> Result<(), BrokerError> {
        self.send(Command::Rollback { txn }).await
    }

    pub async fn delete(&self, if_unused: bool, if_empty: bool) -> Result<u64, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Delete { if_unused, if_empty, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)?.map_err(Into::into)
    }

    pub async fn purge(&self) -> Result<u64, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Purge { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| BrokerError::MailboxClosed)
    }

    pub async fn notify_sent(&self, channel_id: ChannelId) -> Result<(), BrokerError> {
        self.send(Command::NotifySent { channel_id }).await
    }

    pub async fn terminate(&self) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Terminate { reply: reply_tx }).await?;
        let _ = reply_rx.await;
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<(), BrokerError> {
        self.tx.send(command).await.map_err(|_| BrokerError::MailboxClosed)
    }
}

/// Runs a queue's mailbox loop to completion and returns once the process
/// has terminated (§4.5). Spawned by [`crate::supervisor::Supervisor`].
pub struct QueueProcess {
    state: QueueState,
    mailbox: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
    hibernate_after: std::time::Duration,
}

impl QueueProcess {
    /// Spawns the actor task and returns a handle to it.
    pub fn spawn(descriptor: QueueDescriptor, persister: Arc<dyn Persister>, config: QueueConfig) -> QueueHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let name: Arc<str> = Arc::from(descriptor.name.as_str());
        let process = QueueProcess {
            state: QueueState::new(descriptor, persister, config),
            mailbox: rx,
            self_tx: tx.clone(),
            hibernate_after: config.hibernate_after,
        };
        tokio::spawn(process.run());
        QueueHandle { name, tx }
    }

    fn watch_liveness(&self, liveness: LivenessToken, on_death: Command) {
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let _ = liveness.await;
            let _ = self_tx.send(on_death).await;
        });
    }

    async fn run(mut self) {
        let queue = self.state.name().to_string();
        info!(queue = %queue, "queue process started");
        loop {
            let command = match tokio::time::timeout(self.hibernate_after, self.mailbox.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => {
                    debug!(queue = %queue, "mailbox closed, terminating");
                    break;
                }
                Err(_) => {
                    self.state.hibernate();
                    continue;
                }
            };

            if self.handle(command).await {
                self.drain_as_terminating();
                break;
            }
        }
        self.state.terminate().await;
        info!(queue = %queue, "queue process terminated");
    }

    /// §7 `persister-commit-failure`/`queue-process-terminating`: once a
    /// command has decided this process is ending, anything already
    /// sitting in the mailbox gets a synchronous `Terminating` error
    /// instead of being silently dropped (which would otherwise surface
    /// to callers only as a generic `MailboxClosed`).
    fn drain_as_terminating(&mut self) {
        while let Ok(command) = self.mailbox.try_recv() {
            match command {
                Command::RegisterConsumer { reply, .. } => {
                    let _ = reply.send(Err(QueueOpError::Terminating));
                }
                Command::Claim { reply, .. } => {
                    let _ = reply.send(Err(QueueOpError::Terminating));
                }
                Command::Ack { reply, .. } => {
                    let _ = reply.send(Err(QueueOpError::Terminating));
                }
                Command::Reject { reply, .. } => {
                    let _ = reply.send(Err(QueueOpError::Terminating));
                }
                Command::Requeue { reply, .. } => {
                    let _ = reply.send(Err(QueueOpError::Terminating));
                }
                Command::Commit { reply, .. } => {
                    let _ = reply.send(Err(QueueOpError::Terminating));
                }
                Command::Delete { reply, .. } => {
                    let _ = reply.send(Err(QueueOpError::Terminating));
                }
                Command::Terminate { reply } => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }
    }

    /// Returns true if this command ends the process's life.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::RegisterConsumer {
                channel_id,
                channel,
                liveness,
                limiter,
                tag,
                ack_required,
                exclusive,
                reply,
            } => {
                let result = self
                    .state
                    .register_consumer(channel_id, channel, limiter, tag, ack_required, exclusive)
                    .await;
                if result.is_ok() {
                    self.watch_liveness(liveness, Command::NotifyChannelDown { channel_id });
                }
                let _ = reply.send(result);
                false
            }
            Command::CancelConsumer { channel_id, tag, reply } => {
                self.state.cancel_consumer(channel_id, tag).await;
                let _ = reply.send(());
                self.check_auto_delete().await
            }
            Command::Claim { channel_id, liveness, reply } => {
                let result = self.state.claim(channel_id);
                if result.is_ok() {
                    self.watch_liveness(liveness, Command::NotifyOwnerDown);
                }
                let _ = reply.send(result);
                false
            }
            Command::Deliver { txn, channel_id, message, reply } => {
                let outcome = self.state.deliver(txn, channel_id, message).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
                false
            }
            Command::DeliverImmediately { txn, channel_id, message, reply } => {
                let delivered = self.state.deliver_immediately(txn, channel_id, message).await;
                let _ = reply.send(delivered);
                false
            }
            Command::BasicGet { channel_id, channel, ack_required, reply } => {
                let result = self.state.basic_get(channel_id, channel, ack_required).await;
                let _ = reply.send(result);
                false
            }
            Command::Ack { txn, channel_id, delivery_ids, reply } => {
                let result = self.state.ack(txn, channel_id, delivery_ids).await;
                let _ = reply.send(result);
                false
            }
            Command::Reject { channel_id, delivery_ids, requeue, reply } => {
                let result = self.state.reject(channel_id, delivery_ids, requeue).await;
                let _ = reply.send(result);
                false
            }
            Command::Requeue { channel_id, delivery_ids, reply } => {
                let result = self.state.requeue(channel_id, delivery_ids).await;
                let _ = reply.send(result);
                false
            }
            Command::Redeliver { messages } => {
                self.state.redeliver(messages).await;
                false
            }
            Command::Commit { txn, reply } => {
                let result = self.state.commit(txn).await;
                let terminate = matches!(result, Err(QueueOpError::PersisterCommitFailure(_)));
                let _ = reply.send(result);
                terminate
            }
            Command::Rollback { txn } => {
                self.state.rollback(txn).await;
                false
            }
            Command::Delete { if_unused, if_empty, reply } => {
                let result = self.state.delete(if_unused, if_empty);
                let terminate = result.is_ok();
                let _ = reply.send(result);
                terminate
            }
            Command::Purge { reply } => {
                let count = self.state.purge().await;
                let _ = reply.send(count);
                false
            }
            Command::NotifyChannelDown { channel_id } => {
                let (cancelled_tags, auto_delete) = self.state.notify_channel_down(channel_id).await;
                if !cancelled_tags.is_empty() {
                    debug!(channel = %channel_id, count = cancelled_tags.len(), "cancelled consumers for dead channel");
                }
                auto_delete
            }
            Command::NotifySent { channel_id } => {
                self.state.notify_sent(channel_id).await;
                false
            }
            Command::NotifyOwnerDown => {
                if self.state.notify_owner_down() {
                    warn!(queue = %self.state.name(), "exclusive owner died, terminating");
                    true
                } else {
                    false
                }
            }
            Command::Terminate { reply } => {
                let _ = reply.send(());
                true
            }
        }
    }

    async fn check_auto_delete(&mut self) -> bool {
        self.state.auto_delete_due()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bq_common::{Delivery, PersistItem};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingChannel {
        deliveries: Mutex<Vec<Delivery>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self { deliveries: Mutex::new(Vec::new()) })
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
        async fn consumer_cancelled(&self, _tag: ConsumerTag) {}
    }

    struct NullPersister;

    #[async_trait]
    impl Persister for NullPersister {
        async fn dirty_work(&self, _items: Vec<PersistItem>) {}
        async fn extend_transaction(&self, _scope: bq_common::TxnScope, _items: Vec<PersistItem>) {}
        async fn commit_transaction(&self, _scope: bq_common::TxnScope) -> Result<(), String> {
            Ok(())
        }
        async fn rollback_transaction(&self, _scope: bq_common::TxnScope) {}
    }

    fn liveness_pair() -> (oneshot::Sender<Infallible>, LivenessToken) {
        oneshot::channel()
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    fn spawn_test_queue(descriptor: QueueDescriptor) -> QueueHandle {
        QueueProcess::spawn(descriptor, Arc::new(NullPersister), QueueConfig::default())
    }

    #[tokio::test]
    async fn register_and_deliver_round_trip() {
        let handle = spawn_test_queue(QueueDescriptor::new("q1"));
        let channel = RecordingChannel::new();
        let (_keepalive, liveness) = liveness_pair();

        handle
            .register_consumer(ChannelId(1), channel.clone(), liveness, None, ConsumerTag("c1".into()), false, false)
            .await
            .unwrap();

        let outcome = handle.deliver(None, ChannelId(9), Message::new("body"), true).await.unwrap();
        assert_eq!(outcome, Some(RouteOutcome::Routed));
        wait_until(|| !channel.deliveries().is_empty()).await;
    }

    #[tokio::test]
    async fn channel_death_triggers_redelivery() {
        let handle = spawn_test_queue(QueueDescriptor::new("q2"));
        let channel = RecordingChannel::new();
        let (keepalive, liveness) = liveness_pair();

        handle
            .register_consumer(ChannelId(1), channel.clone(), liveness, None, ConsumerTag("c1".into()), true, false)
            .await
            .unwrap();
        handle.deliver(None, ChannelId(9), Message::new("body"), false).await.unwrap();
        wait_until(|| channel.deliveries().len() == 1).await;

        drop(keepalive);

        let channel2 = RecordingChannel::new();
        let (_keepalive2, liveness2) = liveness_pair();
        wait_until(|| !handle.is_dead()).await;
        handle
            .register_consumer(ChannelId(2), channel2.clone(), liveness2, None, ConsumerTag("c2".into()), true, false)
            .await
            .unwrap();
        wait_until(|| !channel2.deliveries().is_empty()).await;
        assert!(channel2.deliveries()[0].redelivered);
    }

    #[tokio::test]
    async fn auto_delete_queue_terminates_once_last_consumer_cancels() {
        let handle = spawn_test_queue(QueueDescriptor::new("q3").auto_delete(true));
        let channel = RecordingChannel::new();
        let (_keepalive, liveness) = liveness_pair();

        handle
            .register_consumer(ChannelId(1), channel, liveness, None, ConsumerTag("c1".into()), false, false)
            .await
            .unwrap();
        handle.cancel_consumer(ChannelId(1), ConsumerTag("c1".into())).await.unwrap();

        wait_until(|| handle.is_dead()).await;
    }

    #[tokio::test]
    async fn supervisor_restarts_a_dead_queue() {
        use crate::supervisor::Supervisor;

        let sup = Supervisor::new(Arc::new(NullPersister), QueueConfig::default());
        let handle = sup.declare(QueueDescriptor::new("q4").auto_delete(true));
        let channel = RecordingChannel::new();
        let (_keepalive, liveness) = liveness_pair();
        handle
            .register_consumer(ChannelId(1), channel, liveness, None, ConsumerTag("c1".into()), false, false)
            .await
            .unwrap();
        handle.cancel_consumer(ChannelId(1), ConsumerTag("c1".into())).await.unwrap();
        wait_until(|| handle.is_dead()).await;

        let restarted = sup.declare(QueueDescriptor::new("q4"));
        assert!(!restarted.is_dead());
        assert_eq!(sup.queue_count(), 1);
    }
}
