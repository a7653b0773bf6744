//! Webhook verifier — authenticity check and connection resolution.
//!
//! RULE: Fails closed. Only a `fail_open` policy may let a payload with a
//! bad signature through, and never one whose connection is unknown or
//! inactive. Every rejection is audited; the caller only learns "rejected".

use crate::{
    clock::Clock,
    config::{VerificationConfig, VerificationPolicy},
    error::{PayResult, VerificationError},
    event::{AuditEvent, AuditSink},
    processors::{AuthContext, Headers, ProcessorTable},
    settings::{PaymentSettings, ProcessorConnection},
    types::ProcessorType,
};

/// A payload whose origin is established.
#[derive(Debug, Clone)]
pub struct VerifiedWebhook {
    pub processor:  ProcessorType,
    pub connection: ProcessorConnection,
    pub payload:    serde_json::Value,
    /// True when a signature failure was let through by `fail_open`.
    pub bypassed:   bool,
}

pub struct WebhookVerifier<'a> {
    settings:   &'a dyn PaymentSettings,
    audit:      &'a dyn AuditSink,
    processors: &'a ProcessorTable,
    config:     &'a VerificationConfig,
    clock:      &'a dyn Clock,
}

impl<'a> WebhookVerifier<'a> {
    pub fn new(
        settings: &'a dyn PaymentSettings,
        audit: &'a dyn AuditSink,
        processors: &'a ProcessorTable,
        config: &'a VerificationConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            settings,
            audit,
            processors,
            config,
            clock,
        }
    }

    /// `Err(PayError::Verification(_))` means rejected; any other error is
    /// an infrastructure failure the vendor should retry.
    pub fn verify(
        &self,
        processor: ProcessorType,
        headers: &Headers,
        body: &[u8],
    ) -> PayResult<VerifiedWebhook> {
        match self.resolve(processor, headers, body)? {
            Ok(verified) => Ok(verified),
            Err(e) => {
                log::warn!("processor={processor} verify: rejected webhook: {e}");
                self.audit.record(
                    self.clock.now(),
                    &AuditEvent::WebhookRejected {
                        processor,
                        reason: e.to_string(),
                    },
                )?;
                Err(e.into())
            }
        }
    }

    fn resolve(
        &self,
        processor: ProcessorType,
        headers: &Headers,
        body: &[u8],
    ) -> PayResult<Result<VerifiedWebhook, VerificationError>> {
        let Some(strategy) = self.processors.get(processor) else {
            return Ok(Err(VerificationError::UnsupportedProcessor(processor)));
        };
        let payload: serde_json::Value = match serde_json::from_slice(body) {
            Ok(p) => p,
            Err(e) => return Ok(Err(VerificationError::UnreadablePayload(e.to_string()))),
        };
        let account_id = match strategy.authenticator.account_reference(&payload) {
            Ok(a) => a,
            Err(e) => return Ok(Err(e)),
        };

        let Some(connection) = self.settings.connection_for_account(processor, &account_id)? else {
            return Ok(Err(VerificationError::UnknownConnection {
                processor,
                account_id,
            }));
        };
        if !connection.is_active() {
            return Ok(Err(VerificationError::InactiveConnection {
                connection_id: connection.connection_id.clone(),
                status: connection.status.as_str().to_string(),
            }));
        }

        let ctx = AuthContext {
            now: self.clock.now(),
            tolerance_secs: self.config.signature_tolerance_secs,
            square_notification_url: &self.config.square_notification_url,
        };
        let outcome = match connection.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => strategy.authenticator.authenticate(headers, body, secret, &ctx),
            None => Err(VerificationError::MissingSecret(connection.connection_id.clone())),
        };

        let bypassed = match outcome {
            Ok(()) => false,
            Err(e) if self.config.policy == VerificationPolicy::FailOpen && e.is_signature_failure() => {
                log::warn!(
                    "connection={} verify: fail_open policy accepting payload despite: {e}",
                    connection.connection_id
                );
                self.audit.record(
                    ctx.now,
                    &AuditEvent::VerificationBypassed {
                        processor,
                        connection_id: Some(connection.connection_id.clone()),
                        reason: e.to_string(),
                    },
                )?;
                true
            }
            Err(e) => return Ok(Err(e)),
        };

        Ok(Ok(VerifiedWebhook {
            processor,
            connection,
            payload,
            bypassed,
        }))
    }
}
