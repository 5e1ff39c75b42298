//! Subscription handle.
//!
//! Ties one SUBSCRIBE request to its SUBACK and to the stream of matching
//! publishes. Observation runs on spawned tasks and stops on
//! [`Subscription::unsubscribe`] or drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{Frame, Publish, Subscribe, Unsubscribe};
use crate::session::SessionManager;
use crate::topic;
use crate::types::QoS;

/// A received message, payload decoded as UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the broker delivered it on.
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Self {
            payload: publish.payload_text().into_owned(),
            topic: publish.topic,
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

type ErrorListener = Box<dyn FnOnce(Error) + Send>;

/// One SUBSCRIBE request bound to a session.
pub struct Subscription {
    session: SessionManager,
    request: Subscribe,
    acknowledged: Arc<AtomicBool>,
    sent: bool,
    ack_task: Option<JoinHandle<()>>,
    message_task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Bind `request` to `session`. Nothing is sent yet.
    pub fn new(session: SessionManager, request: Subscribe) -> Self {
        Self {
            session,
            request,
            acknowledged: Arc::new(AtomicBool::new(false)),
            sent: false,
            ack_task: None,
            message_task: None,
        }
    }

    /// Subscription to a single filter, with a fresh packet id from `session`.
    pub fn to(session: &SessionManager, topic: impl Into<String>, qos: QoS) -> Result<Self> {
        let request = Subscribe::single(topic, qos, session.next_packet_id())?;
        Ok(Self::new(session.clone(), request))
    }

    /// The SUBSCRIBE request this subscription sends.
    pub fn request(&self) -> &Subscribe {
        &self.request
    }

    /// Whether the broker acknowledged the request.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Send the SUBSCRIBE request.
    pub fn subscribe(&mut self) -> Result<()> {
        self.subscribe_with(|| {})
    }

    /// Send the SUBSCRIBE request; `on_success` runs once on its SUBACK.
    ///
    /// The SUBACK watch starts before the request is sent, so an immediate
    /// acknowledgement is never missed.
    pub fn subscribe_with<F>(&mut self, on_success: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut frames = self.session.frames();
        let packet_id = self.request.packet_id();
        let acknowledged = Arc::clone(&self.acknowledged);

        if let Some(task) = self.ack_task.take() {
            task.abort();
        }
        self.ack_task = Some(tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(Frame::Suback(ack)) if ack.packet_id == packet_id => {
                        if ack.has_failures() {
                            warn!(packet_id, return_codes = ?ack.return_codes, "subscription rejected by broker");
                        } else {
                            debug!(packet_id, "subscription acknowledged");
                        }
                        acknowledged.store(true, Ordering::SeqCst);
                        on_success();
                        return;
                    }
                    Ok(_) => {}
                    Err(Error::Lagged(skipped)) => warn!(packet_id, skipped, "suback watch lagged"),
                    Err(e) => {
                        debug!(packet_id, error = %e, "suback watch ended");
                        return;
                    }
                }
            }
        }));

        debug!(packet_id, filters = ?self.request.filters(), "subscribing");
        self.session.send(Frame::Subscribe(self.request.clone()))?;
        self.sent = true;
        Ok(())
    }

    /// Deliver every publish matching this subscription's filters.
    ///
    /// Delivery does not wait for the SUBACK. Stream errors are logged and
    /// dropped.
    pub fn on_message<L>(&mut self, listener: L)
    where
        L: FnMut(Message) + Send + 'static,
    {
        self.watch_messages(listener, None);
    }

    /// Like [`on_message`](Self::on_message), but the error that ends the
    /// stream goes to `on_error`, once.
    pub fn on_message_with_errors<L, E>(&mut self, listener: L, on_error: E)
    where
        L: FnMut(Message) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.watch_messages(listener, Some(Box::new(on_error)));
    }

    /// Start message delivery, then subscribe.
    pub fn listen<S, L, E>(&mut self, on_success: S, listener: L, on_error: E) -> Result<()>
    where
        S: FnOnce() + Send + 'static,
        L: FnMut(Message) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.on_message_with_errors(listener, on_error);
        self.subscribe_with(on_success)
    }

    /// Stop observing and, if the request went out, unsubscribe at the broker.
    pub fn unsubscribe(&mut self) -> Result<()> {
        self.stop();

        if std::mem::take(&mut self.sent) {
            let unsubscribe = Unsubscribe {
                packet_id: self.session.next_packet_id(),
                topics: self.request.topics().map(str::to_owned).collect(),
            };
            debug!(packet_id = unsubscribe.packet_id, topics = ?unsubscribe.topics, "unsubscribing");
            self.session.send(Frame::Unsubscribe(unsubscribe))?;
        }
        Ok(())
    }

    fn watch_messages<L>(&mut self, mut listener: L, on_error: Option<ErrorListener>)
    where
        L: FnMut(Message) + Send + 'static,
    {
        let mut publishes = self.session.publishes();
        let filters: Vec<String> = self.request.topics().map(str::to_owned).collect();

        if let Some(task) = self.message_task.take() {
            task.abort();
        }
        self.message_task = Some(tokio::spawn(async move {
            loop {
                match publishes.recv().await {
                    Ok(publish) => {
                        if filters.iter().any(|filter| topic::matches(filter, &publish.topic)) {
                            listener(publish.into());
                        }
                    }
                    Err(Error::Lagged(skipped)) => {
                        warn!(?filters, skipped, "message listener lagged");
                    }
                    Err(e) => {
                        match on_error {
                            Some(on_error) => on_error(e),
                            None => debug!(?filters, error = %e, "message stream ended"),
                        }
                        return;
                    }
                }
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.ack_task.take() {
            task.abort();
        }
        if let Some(task) = self.message_task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("request", &self.request)
            .field("acknowledged", &self.is_acknowledged())
            .field("sent", &self.sent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    #[test]
    fn test_message_from_publish() {
        let publish = Publish::new("a/b", vec![0x68, 0x69, 0xFF]).with_retain(true);
        let message = Message::from(publish);
        assert_eq!(message.topic, "a/b");
        assert_eq!(message.payload, "hi\u{FFFD}");
        assert!(message.retain);
    }

    #[tokio::test]
    async fn test_unsubscribe_before_subscribe_sends_nothing() {
        let session = SessionManager::new(ConnectionConfig::new("127.0.0.1", "c")).unwrap();
        let mut frames = session.frames();
        let mut subscription = Subscription::to(&session, "a/b", QoS::AtMostOnce).unwrap();
        subscription.unsubscribe().unwrap();

        session.close();
        assert!(matches!(frames.recv().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_subscribe_after_close_fails() {
        let session = SessionManager::new(ConnectionConfig::new("127.0.0.1", "c")).unwrap();
        session.close();
        let mut subscription = Subscription::to(&session, "a/b", QoS::AtMostOnce).unwrap();
        assert!(matches!(subscription.subscribe(), Err(Error::ConnectionClosed)));
        assert!(!subscription.is_acknowledged());
    }

    #[test]
    fn test_invalid_filter() {
        let session = SessionManager::new(ConnectionConfig::new("127.0.0.1", "c")).unwrap();
        assert!(Subscription::to(&session, "a/#/b", QoS::AtMostOnce).is_err());
    }
}
