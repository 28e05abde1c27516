pub mod booking;
pub mod coupons;
pub mod database;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod payments;
pub mod slots;
pub mod wechat;

pub use booking::{BookingOrchestrator, NewAppointment};
pub use coupons::{CouponLedger, NewCouponTemplate};
pub use database::Database;
pub use error::{CouponError, GatewayError, ServiceError};
pub use gateway::PaymentGateway;
pub use metrics::{get_metrics, init_metrics};
pub use payments::{NotificationOutcome, PaymentIntent, PaymentReconciler, PaymentRequest};
pub use slots::SlotLedger;
pub use wechat::WechatPayClient;
