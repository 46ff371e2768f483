//! Redis broker
//!
//! Publishing and subscribing use separate connections: Redis dedicates a
//! connection to subscriber mode, so commands and PUBLISH cannot share it.
//! Subscription changes are forwarded to the task owning the pubsub
//! connection over a command channel.

use super::broker::{Broker, BrokerMessage};
use crate::errors::{FabricError, FabricResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info};

enum SubCommand {
    Subscribe(String, oneshot::Sender<FabricResult<()>>),
    PSubscribe(String, oneshot::Sender<FabricResult<()>>),
    Unsubscribe(String, oneshot::Sender<FabricResult<()>>),
    PUnsubscribe(String, oneshot::Sender<FabricResult<()>>),
}

/// Redis-backed pub/sub broker
pub struct RedisBroker {
    publisher: Mutex<redis::aio::Connection>,
    commands: mpsc::UnboundedSender<SubCommand>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<BrokerMessage>>>,
}

impl RedisBroker {
    /// Connect both broker roles to the given Redis instance
    pub async fn connect(url: &str) -> FabricResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| FabricError::broker(format!("Failed to create Redis client: {}", e)))?;

        let publisher = client
            .get_async_connection()
            .await
            .map_err(|e| FabricError::broker(format!("Failed to connect publisher: {}", e)))?;

        let subscriber = client
            .get_async_connection()
            .await
            .map_err(|e| FabricError::broker(format!("Failed to connect subscriber: {}", e)))?
            .into_pubsub();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_subscriber(subscriber, command_rx, message_tx));

        info!("Redis broker connected");
        Ok(Self {
            publisher: Mutex::new(publisher),
            commands: command_tx,
            incoming: Mutex::new(Some(message_rx)),
        })
    }

    async fn send_command<F>(&self, make: F) -> FabricResult<()>
    where
        F: FnOnce(oneshot::Sender<FabricResult<()>>) -> SubCommand,
    {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(make(ack_tx))
            .map_err(|_| FabricError::broker("Subscriber task is gone"))?;
        ack_rx
            .await
            .map_err(|_| FabricError::broker("Subscriber task dropped the request"))?
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> FabricResult<usize> {
        let mut conn = self.publisher.lock().await;
        let subscribers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| FabricError::broker(format!("Publish to '{}' failed: {}", channel, e)))?;
        Ok(subscribers as usize)
    }

    async fn subscribe(&self, channel: &str) -> FabricResult<()> {
        let channel = channel.to_string();
        self.send_command(|ack| SubCommand::Subscribe(channel, ack))
            .await
    }

    async fn psubscribe(&self, pattern: &str) -> FabricResult<()> {
        let pattern = pattern.to_string();
        self.send_command(|ack| SubCommand::PSubscribe(pattern, ack))
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> FabricResult<()> {
        let channel = channel.to_string();
        self.send_command(|ack| SubCommand::Unsubscribe(channel, ack))
            .await
    }

    async fn punsubscribe(&self, pattern: &str) -> FabricResult<()> {
        let pattern = pattern.to_string();
        self.send_command(|ack| SubCommand::PUnsubscribe(pattern, ack))
            .await
    }

    async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<BrokerMessage>> {
        self.incoming.lock().await.take()
    }
}

/// Own the pubsub connection: forward broker messages out, apply
/// subscription commands in
async fn run_subscriber(
    mut pubsub: redis::aio::PubSub,
    mut commands: mpsc::UnboundedReceiver<SubCommand>,
    messages: mpsc::UnboundedSender<BrokerMessage>,
) {
    loop {
        // on_message borrows the pubsub connection, so the stream is
        // recreated each iteration and dropped before commands touch it
        let mut stream = pubsub.on_message();
        tokio::select! {
            msg = stream.next() => {
                drop(stream);
                let Some(msg) = msg else {
                    error!("Redis pubsub stream ended");
                    break;
                };
                let message = BrokerMessage {
                    channel: msg.get_channel_name().to_string(),
                    pattern: msg.get_pattern::<Option<String>>().ok().flatten(),
                    payload: msg.get_payload_bytes().to_vec(),
                };
                if messages.send(message).is_err() {
                    debug!("Bridge dispatch loop is gone, stopping subscriber");
                    break;
                }
            }
            cmd = commands.recv() => {
                drop(stream);
                let Some(cmd) = cmd else {
                    debug!("Broker dropped, stopping subscriber");
                    break;
                };
                apply_command(&mut pubsub, cmd).await;
            }
        }
    }
}

async fn apply_command(pubsub: &mut redis::aio::PubSub, cmd: SubCommand) {
    let result = match cmd {
        SubCommand::Subscribe(channel, ack) => {
            let result = pubsub
                .subscribe(&channel)
                .await
                .map_err(|e| FabricError::broker(format!("SUBSCRIBE '{}' failed: {}", channel, e)));
            (result, ack)
        }
        SubCommand::PSubscribe(pattern, ack) => {
            let result = pubsub
                .psubscribe(&pattern)
                .await
                .map_err(|e| FabricError::broker(format!("PSUBSCRIBE '{}' failed: {}", pattern, e)));
            (result, ack)
        }
        SubCommand::Unsubscribe(channel, ack) => {
            let result = pubsub
                .unsubscribe(&channel)
                .await
                .map_err(|e| FabricError::broker(format!("UNSUBSCRIBE '{}' failed: {}", channel, e)));
            (result, ack)
        }
        SubCommand::PUnsubscribe(pattern, ack) => {
            let result = pubsub
                .punsubscribe(&pattern)
                .await
                .map_err(|e| {
                    FabricError::broker(format!("PUNSUBSCRIBE '{}' failed: {}", pattern, e))
                });
            (result, ack)
        }
    };
    let _ = result.1.send(result.0);
}
