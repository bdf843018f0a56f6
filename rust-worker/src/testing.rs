//! In-memory broker for tests.
//!
//! Routes like RabbitMQ for the default, direct, fanout and topic exchanges,
//! rejects inequivalent redeclarations, and applies dead-letter arguments on
//! non-requeue nacks and on [`MemoryBroker::expire`], which stands in for a
//! queue's message TTL elapsing.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, ShortString};

use crate::broker::BrokerChannel;
use crate::envelope::{Envelope, Incoming};
use crate::error::ChannelError;
use crate::topology::{ExchangeKind, DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG};

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    envelope: Envelope,
}

struct QueueState {
    durable: bool,
    arguments: FieldTable,
    messages: VecDeque<Stored>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, (String, Stored)>,
    next_tag: u64,
    published: Vec<Published>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    fail_publish: bool,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<usize, ChannelError> {
        let stored = Stored {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        };

        if exchange.is_empty() {
            return match self.queues.get_mut(routing_key) {
                Some(queue) => {
                    queue.messages.push_back(stored);
                    Ok(1)
                }
                None => Ok(0),
            };
        }

        let (kind, _) = *self.exchanges.get(exchange).ok_or_else(|| {
            ChannelError::new("basic.publish", format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            })
            .map(|b| b.queue.clone())
            .collect();

        for queue in &targets {
            if let Some(queue) = self.queues.get_mut(queue) {
                queue.messages.push_back(stored.clone());
            }
        }
        Ok(targets.len())
    }

    /// Apply a queue's dead-letter arguments to a message leaving it.
    fn dead_letter(&mut self, queue: &str, message: Stored) -> Result<(), ChannelError> {
        let args = match self.queues.get(queue) {
            Some(queue) => queue.arguments.clone(),
            None => return Ok(()),
        };
        let Some(exchange) = string_arg(&args, DEAD_LETTER_EXCHANGE_ARG) else {
            return Ok(());
        };
        let routing_key =
            string_arg(&args, DEAD_LETTER_ROUTING_KEY_ARG).unwrap_or(message.routing_key.clone());

        self.route(&exchange, &routing_key, &message.envelope).map(|_| ())
    }
}

fn string_arg(args: &FieldTable, key: &str) -> Option<String> {
    match args.inner().get(&ShortString::from(key))? {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.with(|s| s.queues.contains_key(name))
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.with(|s| s.exchanges.get(name).map(|(kind, _)| *kind))
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        let wanted = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        self.with(|s| s.bindings.contains(&wanted))
    }

    pub fn queue_count(&self) -> usize {
        self.with(|s| s.queues.len())
    }

    pub fn exchange_count(&self) -> usize {
        self.with(|s| s.exchanges.len())
    }

    pub fn binding_count(&self) -> usize {
        self.with(|s| s.bindings.len())
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.with(|s| s.queues.get(queue).map_or(0, |q| q.messages.len()))
    }

    /// Envelopes currently waiting in `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Envelope> {
        self.with(|s| {
            s.queues
                .get(queue)
                .map(|q| q.messages.iter().map(|m| m.envelope.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Hand the oldest message of `queue` to a consumer.
    pub fn deliver(&self, queue: &str) -> Option<Incoming> {
        self.with(|s| {
            let message = s.queues.get_mut(queue)?.messages.pop_front()?;
            s.next_tag += 1;
            let delivery_tag = s.next_tag;
            let incoming = Incoming {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: false,
                envelope: message.envelope.clone(),
            };
            s.unacked.insert(delivery_tag, (queue.to_string(), message));
            Some(incoming)
        })
    }

    /// Expire every message in `queue` as if its TTL elapsed.
    pub fn expire(&self, queue: &str) -> usize {
        self.with(|s| {
            let messages: Vec<Stored> = match s.queues.get_mut(queue) {
                Some(q) => q.messages.drain(..).collect(),
                None => return 0,
            };
            let count = messages.len();
            for message in messages {
                s.dead_letter(queue, message).unwrap();
            }
            count
        })
    }

    pub fn published(&self) -> Vec<Published> {
        self.with(|s| s.published.clone())
    }

    pub fn acked(&self) -> Vec<u64> {
        self.with(|s| s.acked.clone())
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.with(|s| s.nacked.clone())
    }

    pub fn unacked_count(&self) -> usize {
        self.with(|s| s.unacked.len())
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.with(|s| s.fail_publish = fail);
    }
}

#[async_trait]
impl BrokerChannel for MemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ChannelError> {
        self.with(|s| match s.exchanges.get(name) {
            Some(existing) if *existing != (kind, durable) => Err(ChannelError::new(
                "exchange.declare",
                format!("PRECONDITION_FAILED - inequivalent arg for exchange '{name}'"),
            )),
            Some(_) => Ok(()),
            None => {
                s.exchanges.insert(name.to_string(), (kind, durable));
                Ok(())
            }
        })
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), ChannelError> {
        self.with(|s| match s.queues.get(name) {
            Some(existing) if existing.durable != durable || existing.arguments != arguments => {
                Err(ChannelError::new(
                    "queue.declare",
                    format!("PRECONDITION_FAILED - inequivalent arg for queue '{name}'"),
                ))
            }
            Some(_) => Ok(()),
            None => {
                s.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable,
                        arguments,
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ChannelError> {
        self.with(|s| {
            if !s.queues.contains_key(queue) || !s.exchanges.contains_key(exchange) {
                return Err(ChannelError::new("queue.bind", "NOT_FOUND"));
            }
            let binding = Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            };
            if !s.bindings.contains(&binding) {
                s.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), ChannelError> {
        self.with(|s| {
            if s.fail_publish {
                return Err(ChannelError::new("basic.publish", "channel closed"));
            }
            if s.route(exchange, routing_key, envelope)? == 0 {
                return Err(ChannelError::new(
                    "basic.publish",
                    "message was returned as unroutable",
                ));
            }
            s.published.push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                envelope: envelope.clone(),
            });
            Ok(())
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.with(|s| {
            s.unacked
                .remove(&delivery_tag)
                .ok_or_else(|| ChannelError::new("basic.ack", "PRECONDITION_FAILED - unknown delivery tag"))?;
            s.acked.push(delivery_tag);
            Ok(())
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.with(|s| {
            let (queue, message) = s
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| ChannelError::new("basic.nack", "PRECONDITION_FAILED - unknown delivery tag"))?;
            s.nacked.push((delivery_tag, requeue));
            if requeue {
                if let Some(q) = s.queues.get_mut(&queue) {
                    q.messages.push_front(message);
                }
                Ok(())
            } else {
                s.dead_letter(&queue, message)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("email.#", "email.send-otp"));
        assert!(topic_matches("email.#", "email"));
        assert!(topic_matches("email.#", "email.#"));
        assert!(topic_matches("*.created", "order.created"));
        assert!(!topic_matches("*.created", "order.x.created"));
        assert!(!topic_matches("email.#", "order.created"));
        assert!(topic_matches("#", "anything.at.all"));
    }
}
