//! Appointment, payment, refund and coupon lifecycles.
//!
//! Every status column is a closed enum. Transitions are validated by
//! exhaustive matches so a new state cannot be added without deciding which
//! edges lead into and out of it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Unknown {kind} status: {value}")]
pub struct UnknownStatus {
    kind: &'static str,
    value: String,
}

/// Who is driving an appointment transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer,
    Merchant,
    /// A verified gateway notification or an operator-simulated one.
    PaymentSettled,
    /// The refund sub-flow.
    Refund,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Merchant => "merchant",
            Self::PaymentSettled => "payment",
            Self::Refund => "refund",
        }
    }
}

macro_rules! status_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Get string representation for database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownStatus;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

status_enum!(AppointmentStatus, "appointment", {
    Pending => "pending",
    Confirmed => "confirmed",
    Paid => "paid",
    Refunding => "refunding",
    Completed => "completed",
    Canceled => "canceled",
    Rejected => "rejected",
});

status_enum!(PaymentStatus, "payment", {
    Pending => "pending",
    Success => "success",
    Refunding => "refunding",
    Refunded => "refunded",
    Failed => "failed",
    Closed => "closed",
});

status_enum!(RefundStatus, "refund", {
    Processing => "processing",
    Success => "success",
    Failed => "failed",
});

status_enum!(CouponStatus, "coupon", {
    Unused => "unused",
    Using => "using",
    Used => "used",
    Expired => "expired",
});

impl AppointmentStatus {
    /// Checks whether `actor` may move an appointment from `self` to `to`.
    ///
    /// Completed is terminal for merchants and customers; only the refund
    /// sub-flow may still cancel a completed, paid appointment.
    pub fn can_transition(self, to: AppointmentStatus, actor: Actor) -> bool {
        use AppointmentStatus::*;

        match (self, to, actor) {
            (Pending, Confirmed, Actor::Merchant) => true,
            (Pending, Rejected, Actor::Merchant) => true,
            (Pending, Canceled, Actor::Customer) => true,
            (Confirmed, Completed, Actor::Merchant) => true,
            (Confirmed, Canceled, Actor::Merchant) => true,
            (Confirmed, Paid, Actor::PaymentSettled) => true,
            (Paid, Completed, Actor::Merchant) => true,
            (Paid, Refunding, Actor::Merchant) => true,
            (Paid | Refunding | Completed, Canceled, Actor::Refund) => true,
            (
                Pending | Confirmed | Paid | Refunding | Completed | Canceled | Rejected,
                Pending | Confirmed | Paid | Refunding | Completed | Canceled | Rejected,
                Actor::Customer | Actor::Merchant | Actor::PaymentSettled | Actor::Refund,
            ) => false,
        }
    }

    /// States from which no merchant or customer action is accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Rejected)
    }

    /// Entering these states gives the slot back to the schedule.
    pub fn releases_slot(self) -> bool {
        matches!(self, Self::Canceled | Self::Rejected)
    }

    /// A refund may be requested once money has been taken.
    pub fn is_refundable(self) -> bool {
        matches!(self, Self::Paid | Self::Refunding | Self::Completed)
    }
}

impl PaymentStatus {
    pub fn can_transition(self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;

        match (self, to) {
            (Pending, Success | Failed | Closed) => true,
            (Failed, Success) => true,
            (Success, Refunding | Refunded) => true,
            (Refunding, Refunded | Success) => true,
            (Pending | Success | Refunding | Refunded | Failed | Closed, _) => false,
        }
    }
}

impl RefundStatus {
    pub fn can_transition(self, to: RefundStatus) -> bool {
        matches!(
            (self, to),
            (RefundStatus::Processing, RefundStatus::Success | RefundStatus::Failed)
        )
    }
}
