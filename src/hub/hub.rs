//! Communication hub: point-to-point delivery, topic broadcast, history.
//!
//! An explicit instance owns all agent mailboxes and topic subscriber sets;
//! there is no process-wide singleton. Every agent task holds a clone of the
//! hub handle.
//!
//! Guarantees:
//! - Per sender-recipient pair, point-to-point messages arrive in send order
//!   (each agent has one FIFO queue).
//! - A message to a registered recipient is never silently dropped; sending
//!   to an unregistered name is a hard error so wiring bugs surface at once.
//! - Broadcast is at-most-once with no replay: subscribers joining after a
//!   publish do not receive it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use crate::config::HubConfig;

use super::message::{Address, Message, MessageId, MessageKind};

/// Errors surfaced by the hub. Always synchronous, never retried internally.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error("unknown recipient '{0}'")]
    UnknownRecipient(String),

    /// Non-blocking receive found an empty queue, or a blocking receive
    /// timed out.
    #[error("no message available")]
    NoMessage,

    #[error("response message is missing a correlation id")]
    MissingCorrelation,

    #[error("{0}")]
    InvalidAddress(String),
}

/// Proof of enqueue to a registered recipient.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub recipient: String,
    pub delivered_at: DateTime<Utc>,
}

struct Mailbox {
    queue: mpsc::UnboundedSender<Message>,
    inbox: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    history: Arc<Mutex<VecDeque<Message>>>,
}

impl Mailbox {
    fn new() -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        Self {
            queue,
            inbox: Arc::new(Mutex::new(inbox)),
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

/// Message bus shared by all agent tasks.
#[derive(Clone)]
pub struct CommunicationHub {
    agents: Arc<RwLock<HashMap<String, Mailbox>>>,
    topics: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    config: HubConfig,
}

impl CommunicationHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            topics: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Register an agent, creating its queue and history buffer. Idempotent:
    /// re-registering an existing agent keeps its queue and history.
    pub async fn register(&self, agent: impl Into<String>) {
        let agent = agent.into();
        let mut agents = self.agents.write().await;
        if !agents.contains_key(&agent) {
            agents.insert(agent.clone(), Mailbox::new());
            info!(agent = %agent, "Agent registered with hub");
        }
    }

    /// Remove an agent's mailbox and all of its topic subscriptions.
    /// Undelivered queued messages are dropped with the mailbox.
    pub async fn unregister(&self, agent: &str) {
        let removed = self.agents.write().await.remove(agent).is_some();
        if removed {
            let mut topics = self.topics.write().await;
            for subscribers in topics.values_mut() {
                subscribers.remove(agent);
            }
            info!(agent = %agent, "Agent unregistered from hub");
        }
    }

    pub async fn is_registered(&self, agent: &str) -> bool {
        self.agents.read().await.contains_key(agent)
    }

    /// Deliver a point-to-point message to its recipient's queue.
    ///
    /// On success the message is appended to both the sender's and the
    /// recipient's history. A failed send is recorded nowhere: history holds
    /// delivered messages only.
    ///
    /// # Errors
    /// - `InvalidAddress` if the message is addressed to a topic
    /// - `MissingCorrelation` for a `Response` without a correlation id
    /// - `UnknownRecipient` if the recipient is not registered
    pub async fn send(&self, message: Message) -> Result<DeliveryReceipt, HubError> {
        let recipient = match message.address() {
            Address::Agent(name) => name.clone(),
            Address::Topic(topic) => {
                return Err(HubError::InvalidAddress(format!(
                    "send requires a concrete recipient, got topic '{}'",
                    topic
                )))
            }
        };
        if message.kind() == MessageKind::Response && message.correlation_id().is_none() {
            return Err(HubError::MissingCorrelation);
        }

        let agents = self.agents.read().await;
        let mailbox = agents
            .get(&recipient)
            .ok_or_else(|| HubError::UnknownRecipient(recipient.clone()))?;

        mailbox
            .queue
            .send(message.clone())
            .map_err(|_| HubError::UnknownRecipient(recipient.clone()))?;

        self.append_history(&agents, &recipient, &message).await;
        if message.sender() != recipient {
            self.append_history(&agents, message.sender(), &message).await;
        }
        debug!(
            message_id = %message.id(),
            sender = message.sender(),
            recipient = %recipient,
            "Message delivered"
        );

        Ok(DeliveryReceipt {
            message_id: message.id(),
            recipient,
            delivered_at: Utc::now(),
        })
    }

    /// Broadcast to every agent currently subscribed to the message's topic.
    ///
    /// The subscriber set is snapshotted at publish time: agents subscribing
    /// afterwards never see this message, and agents unregistering while the
    /// publish is in flight are skipped. Returns one receipt per delivery.
    ///
    /// # Errors
    /// `InvalidAddress` if the message is not addressed to a topic.
    pub async fn publish(&self, message: Message) -> Result<Vec<DeliveryReceipt>, HubError> {
        let topic = match message.address() {
            Address::Topic(topic) => topic.clone(),
            Address::Agent(name) => {
                return Err(HubError::InvalidAddress(format!(
                    "publish requires a topic address, got agent '{}'",
                    name
                )))
            }
        };

        let subscribers: Vec<String> = {
            let topics = self.topics.read().await;
            topics
                .get(&topic)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        let agents = self.agents.read().await;
        let mut receipts = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            // The subscriber set and the mailbox map are read under separate
            // locks, so an agent unregistering in between leaves a stale
            // entry here. A stale subscriber is no longer registered: skip
            // it and keep the receipts for deliveries that did happen.
            let Some(mailbox) = agents.get(&subscriber) else {
                debug!(topic = %topic, subscriber = %subscriber, "Skipping stale subscriber");
                continue;
            };
            if mailbox.queue.send(message.clone()).is_err() {
                continue;
            }
            self.append_history(&agents, &subscriber, &message).await;
            receipts.push(DeliveryReceipt {
                message_id: message.id(),
                recipient: subscriber,
                delivered_at: Utc::now(),
            });
        }
        if !receipts.is_empty() {
            self.append_history(&agents, message.sender(), &message).await;
        }
        debug!(
            topic = %topic,
            deliveries = receipts.len(),
            "Broadcast published"
        );
        Ok(receipts)
    }

    /// Subscribe a registered agent to a topic.
    ///
    /// # Errors
    /// `UnknownRecipient` if the agent is not registered.
    pub async fn subscribe(&self, agent: &str, topic: impl Into<String>) -> Result<(), HubError> {
        if !self.is_registered(agent).await {
            return Err(HubError::UnknownRecipient(agent.to_string()));
        }
        self.topics
            .write()
            .await
            .entry(topic.into())
            .or_default()
            .insert(agent.to_string());
        Ok(())
    }

    /// Remove an agent from a topic's subscriber set. No-op if absent.
    pub async fn unsubscribe(&self, agent: &str, topic: &str) {
        if let Some(subscribers) = self.topics.write().await.get_mut(topic) {
            subscribers.remove(agent);
        }
    }

    /// Remove and return the oldest queued message for `agent`, waiting up to
    /// `timeout` (forever if `None`) when the queue is empty.
    ///
    /// The timeout bounds the whole wait, the inbox lock included, so a
    /// receiver never overstays its budget behind another consumer of the
    /// same agent.
    ///
    /// # Errors
    /// - `UnknownRecipient` if the agent is not registered
    /// - `NoMessage` if the timeout elapses first
    pub async fn receive(&self, agent: &str, timeout: Option<Duration>) -> Result<Message, HubError> {
        let inbox = self.inbox(agent).await?;
        let wait = async {
            let mut inbox = inbox.lock().await;
            inbox.recv().await
        };
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(Some(message)) => Ok(message),
                Ok(None) | Err(_) => Err(HubError::NoMessage),
            },
            None => wait.await.ok_or(HubError::NoMessage),
        }
    }

    /// Non-blocking receive: the oldest queued message or `NoMessage`.
    pub async fn try_receive(&self, agent: &str) -> Result<Message, HubError> {
        let inbox = self.inbox(agent).await?;
        let mut inbox = inbox.lock().await;
        inbox.try_recv().map_err(|_| HubError::NoMessage)
    }

    /// The most recent `limit` history entries for an agent, oldest first.
    /// Read-only: delivery state is not affected.
    ///
    /// # Errors
    /// `UnknownRecipient` if the agent is not registered.
    pub async fn history(&self, agent: &str, limit: usize) -> Result<Vec<Message>, HubError> {
        let history = {
            let agents = self.agents.read().await;
            agents
                .get(agent)
                .ok_or_else(|| HubError::UnknownRecipient(agent.to_string()))?
                .history
                .clone()
        };
        let history = history.lock().await;
        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }

    async fn inbox(
        &self,
        agent: &str,
    ) -> Result<Arc<Mutex<mpsc::UnboundedReceiver<Message>>>, HubError> {
        let agents = self.agents.read().await;
        agents
            .get(agent)
            .map(|mailbox| mailbox.inbox.clone())
            .ok_or_else(|| HubError::UnknownRecipient(agent.to_string()))
    }

    /// Ring-buffer append; the oldest entry falls out past the limit.
    async fn append_history(
        &self,
        agents: &HashMap<String, Mailbox>,
        agent: &str,
        message: &Message,
    ) {
        if let Some(mailbox) = agents.get(agent) {
            let mut history = mailbox.history.lock().await;
            history.push_back(message.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
    }
}
