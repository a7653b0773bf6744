//! Webhook ingest — the endpoint boundary.
//!
//! RULE: Nothing internal crosses this line. The vendor sees a status code
//! and a fixed body; reasons go to the log and the audit trail.
//!
//!   401  verification failed
//!   400  authentic but unparseable
//!   500  storage failure (the vendor should retry)
//!   200  everything else, including conflicts and ignored events

use crate::{
    engine::PaymentEngine,
    error::{PayError, PayResult},
    event::{AuditEvent, AuditSink},
    processors::Headers,
    reconciler::{EventSource, ReconcileOutcome},
    types::ProcessorType,
};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub processor: ProcessorType,
    pub headers:   Headers,
    pub body:      Vec<u8>,
}

impl WebhookRequest {
    /// Header names are lowercased on the way in.
    pub fn new<K, V>(
        processor: ProcessorType,
        headers: impl IntoIterator<Item = (K, V)>,
        body: impl Into<Vec<u8>>,
    ) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            processor,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: &'static str,
}

impl WebhookResponse {
    pub const OK: Self = Self {
        status: 200,
        body: "ok",
    };
    pub const REJECTED: Self = Self {
        status: 401,
        body: "rejected",
    };
    pub const BAD_REQUEST: Self = Self {
        status: 400,
        body: "bad request",
    };
    pub const RETRY: Self = Self {
        status: 500,
        body: "temporarily unavailable",
    };

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct WebhookIngest<'a> {
    engine: &'a PaymentEngine,
}

impl<'a> WebhookIngest<'a> {
    pub fn new(engine: &'a PaymentEngine) -> Self {
        Self { engine }
    }

    pub fn handle(&self, request: &WebhookRequest) -> WebhookResponse {
        self.handle_with_outcome(request).0
    }

    /// `handle`, also returning what reconciliation did when it got that far.
    pub fn handle_with_outcome(
        &self,
        request: &WebhookRequest,
    ) -> (WebhookResponse, Option<ReconcileOutcome>) {
        match self.process(request) {
            Ok(outcome) => (WebhookResponse::OK, Some(outcome)),
            Err(PayError::Verification(_)) => (WebhookResponse::REJECTED, None),
            Err(PayError::Normalization(_)) => (WebhookResponse::BAD_REQUEST, None),
            Err(e) => {
                log::error!("processor={} ingest: {e}", request.processor);
                (WebhookResponse::RETRY, None)
            }
        }
    }

    /// Verify, normalize and reconcile one delivery.
    pub fn process(&self, request: &WebhookRequest) -> PayResult<ReconcileOutcome> {
        let started = Instant::now();
        let verified = match self
            .engine
            .verifier()
            .verify(request.processor, &request.headers, &request.body)
        {
            Ok(verified) => verified,
            Err(e) => {
                self.check_budget(started, request.processor, None, "rejected");
                return Err(e);
            }
        };
        let connection_id = verified.connection.connection_id.as_str();

        let event = match self
            .engine
            .normalizer()
            .normalize(request.processor, &verified.payload)
        {
            Ok(event) => event,
            Err(e) => {
                log::warn!(
                    "connection={connection_id} ingest: unparseable {} payload: {e}",
                    request.processor
                );
                self.check_budget(started, request.processor, Some(connection_id), "unparseable");
                self.engine.store().record(
                    self.engine.clock().now(),
                    &AuditEvent::WebhookUnparseable {
                        processor: request.processor,
                        connection_id: connection_id.to_string(),
                        detail: e.to_string(),
                    },
                )?;
                return Err(e.into());
            }
        };
        self.check_budget(started, request.processor, Some(connection_id), "accepted");

        self.engine
            .reconciler()
            .apply(&verified.connection, &event, EventSource::Webhook)
    }

    /// Audit a delivery whose verify+normalize ran past the budget.
    fn check_budget(
        &self,
        started: Instant,
        processor: ProcessorType,
        connection_id: Option<&str>,
        stage: &str,
    ) {
        let elapsed = started.elapsed();
        let budget_ms = self.engine.config().verification.budget_ms;
        if elapsed <= Duration::from_millis(budget_ms) {
            return;
        }
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        log::warn!(
            "connection={} ingest: {processor} verify+normalize took {elapsed_ms} ms (budget {budget_ms} ms, {stage})",
            connection_id.unwrap_or("-")
        );
        let event = AuditEvent::WebhookSlow {
            processor,
            connection_id: connection_id.map(str::to_string),
            elapsed_ms,
            budget_ms,
            stage: stage.to_string(),
        };
        if let Err(e) = self.engine.store().record(self.engine.clock().now(), &event) {
            log::error!("processor={processor} ingest: could not audit slow delivery: {e}");
        }
    }
}
