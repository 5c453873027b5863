use super::{spawn_watched, InboundMessage, MessageHandler};
use crate::AgentError;
use common::topics::topic_matches;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, warn, Instrument};

struct Route {
    filter: String,
    lane: mpsc::UnboundedSender<InboundMessage>,
}

/// Dispatch table from subscription filter to handler.
///
/// Every filter owns one lane: a channel drained by a dedicated task, so
/// messages on a filter reach its handler in delivery order while the
/// transport's I/O loop never waits on a handler. Handler errors are
/// forwarded to the session's failure channel.
pub struct TopicRouter {
    routes: RwLock<Vec<Route>>,
    failures: mpsc::UnboundedSender<AgentError>,
}

impl TopicRouter {
    pub fn new(failures: mpsc::UnboundedSender<AgentError>) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            failures,
        }
    }

    /// Register (or replace) the handler for a filter and start its lane.
    pub fn register(&self, filter: &str, handler: Arc<dyn MessageHandler>) {
        let (lane, mut inbox) = mpsc::unbounded_channel::<InboundMessage>();
        let failures = self.failures.clone();
        let span = info_span!("topic_lane", filter = %filter);

        let on_abort = {
            let failures = failures.clone();
            move |err: AgentError| async move {
                let _ = failures.send(err);
            }
        };
        spawn_watched(
            "topic lane",
            async move {
                while let Some(message) = inbox.recv().await {
                    let topic = message.topic.clone();
                    if let Err(err) = handler.handle(message).await {
                        error!(topic = %topic, error = %err, "message handler failed");
                        if failures.send(err).is_err() {
                            debug!("session already closed, dropping handler failure");
                        }
                    }
                }
                debug!("topic lane closed");
            }
            .instrument(span),
            on_abort,
        );

        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.retain(|route| route.filter != filter);
        routes.push(Route {
            filter: filter.to_string(),
            lane,
        });
    }

    /// Drop the route for a filter; its lane finishes the queued messages and stops.
    pub fn unregister(&self, filter: &str) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.retain(|route| route.filter != filter);
    }

    /// Queue a message on every lane whose filter matches. Returns the number of lanes.
    pub fn dispatch(&self, message: InboundMessage) -> usize {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;

        for route in routes.iter().filter(|r| topic_matches(&r.filter, &message.topic)) {
            if route.lane.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            warn!(topic = %message.topic, "no handler registered for topic");
        }
        delivered
    }

    pub fn filters(&self) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().map(|r| r.filter.clone()).collect()
    }
}
