//! One request, one reply over HTTP.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tracing::warn;

use super::{Dispatcher, ResponseSink, TimeoutHook};
use crate::codec::HttpCodec;
use crate::status::StatusReport;

#[derive(Clone, Debug)]
pub struct HttpGateway {
    dispatcher: Dispatcher<HttpCodec>,
}

impl HttpGateway {
    pub fn new(dispatcher: Dispatcher<HttpCodec>) -> Self {
        Self { dispatcher }
    }

    pub fn with_timeout_hook(mut self, hook: TimeoutHook) -> Self {
        self.dispatcher = self.dispatcher.with_timeout_hook(hook);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<HttpCodec> {
        &self.dispatcher
    }

    /// Handles one request body and returns the reply body.
    ///
    /// An undecodable body is answered with code 300 and an unknown command
    /// with 404. A handler answering with the no-reply code yields an empty
    /// body.
    pub async fn respond(&self, body: &[u8]) -> Vec<u8> {
        let (sink, mut replies) = ResponseSink::channel();
        if let Err(err) = self.dispatcher.dispatch(body, &sink, None).await {
            warn!("{} rejected request: {}", self.dispatcher.name(), err);
            if let Some(reply) = Dispatcher::<HttpCodec>::rejection(&err) {
                self.dispatcher.send_reply(&sink, &reply);
            }
        }
        drop(sink);
        replies.try_recv().unwrap_or_default()
    }

    /// Every path is served by the same handler; `POST /` is the documented
    /// endpoint.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(handle))
            .fallback(handle)
            .with_state(self.clone())
    }
}

async fn handle(State(gateway): State<HttpGateway>, body: Bytes) -> impl IntoResponse {
    let supervisor = gateway.dispatcher.supervisor().clone();
    let reply = supervisor.track(gateway.respond(&body)).await;
    (
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::CONTENT_TYPE, "application/json"),
        ],
        reply,
    )
}

impl StatusReport for HttpGateway {
    fn status_line(&self) -> String {
        let stats = self.dispatcher.stats();
        format!(
            "{}: {}/{} (running/requests)",
            self.dispatcher.name(),
            stats.running(),
            stats.requests()
        )
    }
}
