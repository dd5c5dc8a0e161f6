use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A strictly positive amount in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(value: i64) -> Result<Self, PaymentError> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "amount must be greater than zero".to_string(),
            ))
        }
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = PaymentError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-user wallet balance.
///
/// `available` and `reserved` are never negative. Reserve and release move
/// value between them without changing the sum; confirm removes it from
/// `reserved` for good.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Balance {
    pub user_id: String,
    pub available: i64,
    pub reserved: i64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(user_id: impl Into<String>, available: i64, reserved: i64) -> Self {
        Self {
            user_id: user_id.into(),
            available,
            reserved,
            updated_at: Utc::now(),
        }
    }

    /// Saturates at `i64::MAX`.
    pub fn total(&self) -> i64 {
        self.available.saturating_add(self.reserved)
    }

    fn overflow(&self) -> PaymentError {
        PaymentError::BalanceOverflow {
            user_id: self.user_id.clone(),
        }
    }

    /// Moves `amount` from available to reserved if enough is available.
    ///
    /// The check and the mutation happen together; on failure nothing changes.
    pub fn reserve(&mut self, amount: Amount) -> Result<(), PaymentError> {
        if self.available < amount.value() {
            return Err(PaymentError::InsufficientFunds {
                user_id: self.user_id.clone(),
                requested: amount.value(),
            });
        }
        let reserved = self
            .reserved
            .checked_add(amount.value())
            .ok_or_else(|| self.overflow())?;
        self.available -= amount.value();
        self.reserved = reserved;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves `amount` back from reserved to available.
    pub fn release(&mut self, amount: Amount) -> Result<(), PaymentError> {
        if self.reserved < amount.value() {
            return Err(PaymentError::PersistenceFailed(format!(
                "reserved balance of user {} is below {}",
                self.user_id, amount
            )));
        }
        let available = self
            .available
            .checked_add(amount.value())
            .ok_or_else(|| self.overflow())?;
        self.reserved -= amount.value();
        self.available = available;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Settles `amount` out of reserved.
    pub fn confirm(&mut self, amount: Amount) -> Result<(), PaymentError> {
        if self.reserved >= amount.value() {
            self.reserved -= amount.value();
            self.updated_at = Utc::now();
            Ok(())
        } else {
            Err(PaymentError::PersistenceFailed(format!(
                "reserved balance of user {} is below {}",
                self.user_id, amount
            )))
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Reserved,
    Confirmed,
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "RESERVED",
            ReservationState::Confirmed => "CONFIRMED",
            ReservationState::Released => "RELEASED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, PaymentError> {
        match value {
            "RESERVED" => Ok(ReservationState::Reserved),
            "CONFIRMED" => Ok(ReservationState::Confirmed),
            "RELEASED" => Ok(ReservationState::Released),
            other => Err(PaymentError::PersistenceFailed(format!(
                "unknown reservation state {other}"
            ))),
        }
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transition request did to a reservation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Transition {
    /// The reservation moved and balances must follow.
    Applied,
    /// The reservation was already in the target state.
    AlreadyApplied,
}

/// A hold of funds taken for one payment. Its id is the payment id.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: String,
    pub amount: Amount,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(id: Uuid, user_id: impl Into<String>, amount: Amount) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: user_id.into(),
            amount,
            state: ReservationState::Reserved,
            created_at: now,
            updated_at: now,
        }
    }

    /// RESERVED -> `target`. Repeating the same terminal transition is a no-op,
    /// crossing to the other terminal state is rejected.
    pub fn transition(&mut self, target: ReservationState) -> Result<Transition, PaymentError> {
        match (self.state, target) {
            (ReservationState::Reserved, ReservationState::Confirmed)
            | (ReservationState::Reserved, ReservationState::Released) => {
                self.state = target;
                self.updated_at = Utc::now();
                Ok(Transition::Applied)
            }
            (current, target) if current == target => Ok(Transition::AlreadyApplied),
            (current, target) => Err(PaymentError::InvalidTransition {
                from: current.to_string(),
                to: target.to_string(),
            }),
        }
    }
}
