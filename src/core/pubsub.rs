//! Subscriber-mode frame dispatch.
//!
//! While a connection is subscribed, the server interleaves three things on
//! the same socket: acknowledgements for subscription changes, pushed
//! `message`/`pmessage` frames, and replies to the still-allowed commands
//! (PING, QUIT). The dispatcher classifies every inbound value: pushed
//! messages fan out to registered receivers without consuming a pending
//! reply, acknowledgements mutate the registry, and everything else flows to
//! the correlator untouched.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::core::metrics;
use crate::proto::error::{Error, Result};
use crate::proto::frame::RespValue;

/// A message pushed by the server to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    /// The channel the message was published to.
    pub channel: Bytes,
    /// The pattern that matched, for pattern subscriptions.
    pub pattern: Option<Bytes>,
    /// The published payload.
    pub payload: Bytes,
}

/// Receiver invoked on the driver task for every pushed message.
pub type MessageReceiver = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

/// Hook invoked when a subscription is added or removed, carrying the target
/// name and the server-reported subscription count.
pub type SubscriptionChangeHook = Arc<dyn Fn(&[u8], usize) + Send + Sync>;

/// Which registry a subscription change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionKind {
    /// Exact channel names (SUBSCRIBE/UNSUBSCRIBE).
    Channel,
    /// Server-side glob patterns (PSUBSCRIBE/PUNSUBSCRIBE).
    Pattern,
}

/// Direction of a subscription change acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionChange {
    Added,
    Removed,
}

/// A parsed subscription-control acknowledgement.
#[derive(Debug)]
pub(crate) struct SubscriptionAck {
    pub change: SubscriptionChange,
    pub kind: SubscriptionKind,
    /// `None` for the null target of an unsubscribe-all with nothing left.
    pub target: Option<Bytes>,
    /// Total subscriptions remaining on the connection, as the server sees it.
    pub count: i64,
}

/// Outcome of classifying one inbound value while subscribed.
#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    /// A regular command reply; feed the correlator.
    Response(RespValue),
    /// A subscription-change acknowledgement; the driver settles the
    /// matching pending entry and registers or unregisters the target.
    Ack(SubscriptionAck),
    /// A pushed message, already fanned out to its receiver.
    Delivered,
}

struct Subscription {
    receiver: MessageReceiver,
    on_unsubscribe: Option<SubscriptionChangeHook>,
}

/// Registry of live subscriptions plus the inbound classification logic.
///
/// Owned by the driver task and carried inside the connection's `PubSub`
/// state, so it cannot be observed while the connection is in `Open`.
pub(crate) struct PubSubDispatcher {
    channels: HashMap<Bytes, Subscription>,
    patterns: HashMap<Bytes, Subscription>,
}

impl PubSubDispatcher {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            patterns: HashMap::new(),
        }
    }

    /// Classifies one inbound value.
    ///
    /// Pushed messages are routed to their receiver before returning.
    /// Malformed control frames are protocol errors: the server is speaking
    /// something other than RESP2 pub/sub and the connection cannot recover.
    pub fn handle(&mut self, value: RespValue) -> Result<DispatchOutcome> {
        if let Some(ack) = classify_ack(&value)? {
            return Ok(DispatchOutcome::Ack(ack));
        }

        let items = match value.as_array() {
            Some(items) => items,
            None => return Ok(DispatchOutcome::Response(value)),
        };
        let kind = match items.first().and_then(|v| v.as_bulk_string()) {
            Some(kind) => kind,
            None => return Ok(DispatchOutcome::Response(value)),
        };

        match &kind[..] {
            b"message" => {
                self.route_message(items)?;
                Ok(DispatchOutcome::Delivered)
            }
            b"pmessage" => {
                self.route_pmessage(items)?;
                Ok(DispatchOutcome::Delivered)
            }
            _ => Ok(DispatchOutcome::Response(value)),
        }
    }

    /// Registers a target, firing no hooks; the driver owns hook invocation
    /// for additions because the hook arrives with the pending request.
    pub fn register(
        &mut self,
        kind: SubscriptionKind,
        target: Bytes,
        receiver: MessageReceiver,
        on_unsubscribe: Option<SubscriptionChangeHook>,
    ) {
        let subscription = Subscription {
            receiver,
            on_unsubscribe,
        };
        let registry = self.registry_mut(kind);
        if registry.insert(target, subscription).is_none() {
            metrics::add_gauge(Self::gauge(kind), 1.0);
        }
    }

    /// Removes a target and fires its unsubscribe hook with `count`.
    pub fn unregister(&mut self, kind: SubscriptionKind, target: &Bytes, count: i64) {
        if let Some(subscription) = self.registry_mut(kind).remove(target) {
            metrics::add_gauge(Self::gauge(kind), -1.0);
            if let Some(hook) = subscription.on_unsubscribe {
                hook(target, count.max(0) as usize);
            }
        }
    }

    /// Number of live subscriptions of one kind.
    pub fn len(&self, kind: SubscriptionKind) -> usize {
        match kind {
            SubscriptionKind::Channel => self.channels.len(),
            SubscriptionKind::Pattern => self.patterns.len(),
        }
    }

    /// True when no channel or pattern subscription remains.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    fn registry_mut(&mut self, kind: SubscriptionKind) -> &mut HashMap<Bytes, Subscription> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }

    fn gauge(kind: SubscriptionKind) -> &'static prometheus::Gauge {
        match kind {
            SubscriptionKind::Channel => &metrics::ACTIVE_CHANNEL_SUBSCRIPTIONS,
            SubscriptionKind::Pattern => &metrics::ACTIVE_PATTERN_SUBSCRIPTIONS,
        }
    }

    fn route_message(&self, items: &[RespValue]) -> Result<()> {
        if items.len() != 3 {
            return Err(Error::protocol("message frame with unexpected shape"));
        }
        let channel = items[1]
            .as_bulk_string()
            .ok_or_else(|| Error::protocol("message channel is not a bulk string"))?;
        let payload = items[2]
            .as_bulk_string()
            .ok_or_else(|| Error::protocol("message payload is not a bulk string"))?;

        match self.channels.get(&channel) {
            Some(subscription) => {
                metrics::incr_counter(&metrics::SUBSCRIPTION_MESSAGES_RECEIVED_TOTAL);
                (subscription.receiver)(PubSubMessage {
                    channel,
                    pattern: None,
                    payload,
                });
            }
            None => {
                warn!(
                    channel = %String::from_utf8_lossy(&channel),
                    "dropping message for unknown channel"
                );
            }
        }
        Ok(())
    }

    fn route_pmessage(&self, items: &[RespValue]) -> Result<()> {
        if items.len() != 4 {
            return Err(Error::protocol("pmessage frame with unexpected shape"));
        }
        let pattern = items[1]
            .as_bulk_string()
            .ok_or_else(|| Error::protocol("pmessage pattern is not a bulk string"))?;
        let channel = items[2]
            .as_bulk_string()
            .ok_or_else(|| Error::protocol("pmessage channel is not a bulk string"))?;
        let payload = items[3]
            .as_bulk_string()
            .ok_or_else(|| Error::protocol("pmessage payload is not a bulk string"))?;

        match self.patterns.get(&pattern) {
            Some(subscription) => {
                metrics::incr_counter(&metrics::SUBSCRIPTION_MESSAGES_RECEIVED_TOTAL);
                (subscription.receiver)(PubSubMessage {
                    channel,
                    pattern: Some(pattern),
                    payload,
                });
            }
            None => {
                warn!(
                    pattern = %String::from_utf8_lossy(&pattern),
                    "dropping pmessage for unknown pattern"
                );
            }
        }
        Ok(())
    }
}

/// Attempts to parse a value as a subscription-control acknowledgement.
///
/// Returns `Ok(None)` when the value is not a control frame, and an error
/// when it carries a control word but the shape is wrong. Lives outside the
/// dispatcher because acknowledgements can trail the connection's return to
/// `Open` (the second half of an unsubscribe-all) and still need settling.
pub(crate) fn classify_ack(value: &RespValue) -> Result<Option<SubscriptionAck>> {
    let items = match value.as_array() {
        Some(items) => items,
        None => return Ok(None),
    };
    let word = match items.first().and_then(|v| v.as_bulk_string()) {
        Some(word) => word,
        None => return Ok(None),
    };

    let (change, kind) = match &word[..] {
        b"subscribe" => (SubscriptionChange::Added, SubscriptionKind::Channel),
        b"psubscribe" => (SubscriptionChange::Added, SubscriptionKind::Pattern),
        b"unsubscribe" => (SubscriptionChange::Removed, SubscriptionKind::Channel),
        b"punsubscribe" => (SubscriptionChange::Removed, SubscriptionKind::Pattern),
        _ => return Ok(None),
    };

    if items.len() != 3 {
        return Err(Error::protocol("subscription ack with unexpected shape"));
    }
    let target = match &items[1] {
        RespValue::BulkString(target) => target.clone(),
        _ => {
            return Err(Error::protocol(
                "subscription ack target is not a bulk string",
            ))
        }
    };
    let count = items[2]
        .as_int()
        .ok_or_else(|| Error::protocol("subscription ack count is not an integer"))?;

    Ok(Some(SubscriptionAck {
        change,
        kind,
        target,
        count,
    }))
}

impl Drop for PubSubDispatcher {
    // A dispatcher dropped with live subscriptions (connection death) must
    // not leave the process-wide gauges inflated.
    fn drop(&mut self) {
        if !self.channels.is_empty() {
            metrics::add_gauge(
                &metrics::ACTIVE_CHANNEL_SUBSCRIPTIONS,
                -(self.channels.len() as f64),
            );
        }
        if !self.patterns.is_empty() {
            metrics::add_gauge(
                &metrics::ACTIVE_PATTERN_SUBSCRIPTIONS,
                -(self.patterns.len() as f64),
            );
        }
    }
}

impl std::fmt::Debug for PubSubDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubDispatcher")
            .field("channels", &self.channels.len())
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ack(kind: &str, target: &str, count: i64) -> RespValue {
        RespValue::Array(Some(vec![
            RespValue::bulk(kind.to_string()),
            RespValue::bulk(target.to_string()),
            RespValue::Integer(count),
        ]))
    }

    fn collector() -> (MessageReceiver, Arc<Mutex<Vec<PubSubMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receiver: MessageReceiver =
            Arc::new(move |message| sink.lock().unwrap().push(message));
        (receiver, seen)
    }

    #[test]
    fn test_classifies_subscribe_ack() {
        let mut dispatcher = PubSubDispatcher::new();
        let outcome = dispatcher.handle(ack("subscribe", "news", 1)).unwrap();
        match outcome {
            DispatchOutcome::Ack(ack) => {
                assert_eq!(ack.change, SubscriptionChange::Added);
                assert_eq!(ack.kind, SubscriptionKind::Channel);
                assert_eq!(ack.target, Some(Bytes::from("news")));
                assert_eq!(ack.count, 1);
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_classifies_null_unsubscribe_ack() {
        let mut dispatcher = PubSubDispatcher::new();
        let frame = RespValue::Array(Some(vec![
            RespValue::bulk("unsubscribe"),
            RespValue::BulkString(None),
            RespValue::Integer(0),
        ]));
        match dispatcher.handle(frame).unwrap() {
            DispatchOutcome::Ack(ack) => {
                assert_eq!(ack.change, SubscriptionChange::Removed);
                assert_eq!(ack.target, None);
                assert_eq!(ack.count, 0);
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_non_pubsub_frames_pass_through() {
        let mut dispatcher = PubSubDispatcher::new();
        let pong = RespValue::SimpleString(Bytes::from("PONG"));
        match dispatcher.handle(pong.clone()).unwrap() {
            DispatchOutcome::Response(value) => assert_eq!(value, pong),
            other => panic!("expected response, got {:?}", other),
        }

        // An array that is not a control frame is also a plain response.
        let array = RespValue::Array(Some(vec![RespValue::bulk("results")]));
        assert!(matches!(
            dispatcher.handle(array).unwrap(),
            DispatchOutcome::Response(_)
        ));
    }

    #[test]
    fn test_message_fan_out() {
        let mut dispatcher = PubSubDispatcher::new();
        let (receiver, seen) = collector();
        dispatcher.register(SubscriptionKind::Channel, Bytes::from("news"), receiver, None);

        let frame = RespValue::Array(Some(vec![
            RespValue::bulk("message"),
            RespValue::bulk("news"),
            RespValue::bulk("hello"),
        ]));
        assert!(matches!(
            dispatcher.handle(frame).unwrap(),
            DispatchOutcome::Delivered
        ));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].channel, Bytes::from("news"));
        assert_eq!(seen[0].payload, Bytes::from("hello"));
        assert_eq!(seen[0].pattern, None);
    }

    #[test]
    fn test_pmessage_fan_out_carries_channel() {
        let mut dispatcher = PubSubDispatcher::new();
        let (receiver, seen) = collector();
        dispatcher.register(SubscriptionKind::Pattern, Bytes::from("news.*"), receiver, None);

        let frame = RespValue::Array(Some(vec![
            RespValue::bulk("pmessage"),
            RespValue::bulk("news.*"),
            RespValue::bulk("news.sports"),
            RespValue::bulk("goal"),
        ]));
        assert!(matches!(
            dispatcher.handle(frame).unwrap(),
            DispatchOutcome::Delivered
        ));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].pattern, Some(Bytes::from("news.*")));
        assert_eq!(seen[0].channel, Bytes::from("news.sports"));
    }

    #[test]
    fn test_message_for_unknown_channel_is_dropped() {
        let mut dispatcher = PubSubDispatcher::new();
        let frame = RespValue::Array(Some(vec![
            RespValue::bulk("message"),
            RespValue::bulk("ghost"),
            RespValue::bulk("boo"),
        ]));
        assert!(matches!(
            dispatcher.handle(frame).unwrap(),
            DispatchOutcome::Delivered
        ));
    }

    #[test]
    fn test_unregister_fires_hook_and_empties() {
        let mut dispatcher = PubSubDispatcher::new();
        let (receiver, _) = collector();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let hook: SubscriptionChangeHook = Arc::new(move |target, count| {
            sink.lock()
                .unwrap()
                .push((Bytes::copy_from_slice(target), count));
        });

        let target = Bytes::from("news");
        dispatcher.register(
            SubscriptionKind::Channel,
            target.clone(),
            receiver,
            Some(hook),
        );
        assert_eq!(dispatcher.len(SubscriptionKind::Channel), 1);
        assert!(!dispatcher.is_empty());

        dispatcher.unregister(SubscriptionKind::Channel, &target, 0);
        assert!(dispatcher.is_empty());
        assert_eq!(
            fired.lock().unwrap().as_slice(),
            &[(Bytes::from("news"), 0)]
        );
    }

    #[test]
    fn test_malformed_control_frame_is_protocol_error() {
        let mut dispatcher = PubSubDispatcher::new();
        let frame = RespValue::Array(Some(vec![
            RespValue::bulk("subscribe"),
            RespValue::bulk("news"),
            RespValue::bulk("not-a-count"),
        ]));
        assert!(dispatcher.handle(frame).is_err());
    }
}
