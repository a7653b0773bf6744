//! Shared primitive types used across the payments core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A barber (tenant) identifier, owned by the booking system.
pub type BarberId = String;

/// Internal identifier of a processor connection.
pub type ConnectionId = String;

/// Internal identifier of an external transaction row.
pub type TransactionId = String;

/// Internal identifier of a commission collection.
pub type CollectionId = String;

/// External payment processors a barber can link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorType {
    Stripe,
    Square,
    Paypal,
}

impl ProcessorType {
    pub const ALL: [ProcessorType; 3] = [Self::Stripe, Self::Square, Self::Paypal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Square => "square",
            Self::Paypal => "paypal",
        }
    }
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "square" => Ok(Self::Square),
            "paypal" => Ok(Self::Paypal),
            other => Err(format!("unknown processor type '{other}'")),
        }
    }
}

/// Who executes a payment: the platform gateway or one of the barber's processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "processor")]
pub enum PaymentProcessor {
    Platform,
    External(ProcessorType),
}

impl PaymentProcessor {
    /// Key used to look up a fee schedule in `FeeConfig::processors`.
    pub fn fee_key(&self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::External(p) => p.as_str(),
        }
    }
}

/// Per-barber payment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Centralized,
    Decentralized,
    Hybrid,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Centralized => "centralized",
            Self::Decentralized => "decentralized",
            Self::Hybrid => "hybrid",
        }
    }
}

impl FromStr for PaymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "centralized" => Ok(Self::Centralized),
            "decentralized" => Ok(Self::Decentralized),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown payment mode '{other}'")),
        }
    }
}

/// Connectivity state of a processor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown connection status '{other}'")),
        }
    }
}

/// Lifecycle of an external transaction.
///
/// ```text
/// pending ──► succeeded ──► refunded
///    │            └───────► disputed ─(reopen_dispute)─► succeeded
///    ├──► failed
///    └──► canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
    Refunded,
    Disputed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
        }
    }

    /// Whether an event may move a transaction from `self` to `next`.
    /// `disputed → succeeded` is deliberately absent: only `reopen_dispute` does that.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Succeeded)
                | (Pending, Failed)
                | (Pending, Canceled)
                | (Succeeded, Refunded)
                | (Succeeded, Disputed)
        )
    }

    /// States from which no event may move the transaction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled | Self::Refunded | Self::Disputed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "refunded" => Ok(Self::Refunded),
            "disputed" => Ok(Self::Disputed),
            other => Err(format!("unknown transaction status '{other}'")),
        }
    }
}

/// How the platform collects owed commission from a barber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    CardOnFile,
    Invoice,
    PayoutDeduction,
}

impl CollectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardOnFile => "card_on_file",
            Self::Invoice => "invoice",
            Self::PayoutDeduction => "payout_deduction",
        }
    }
}

impl FromStr for CollectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card_on_file" => Ok(Self::CardOnFile),
            "invoice" => Ok(Self::Invoice),
            "payout_deduction" => Ok(Self::PayoutDeduction),
            other => Err(format!("unknown collection method '{other}'")),
        }
    }
}
