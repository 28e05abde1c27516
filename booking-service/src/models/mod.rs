//! Domain models for booking-service.

pub mod appointment;
pub mod catalog;
pub mod coupon;
pub mod payment;
pub mod status;
pub mod time_slot;

pub use appointment::{Appointment, APPOINTMENT_COLUMNS};
pub use catalog::{Customer, Service, Staff};
pub use coupon::{
    CouponApplication, CouponTemplate, DiscountType, UserCoupon, COUPON_TEMPLATE_COLUMNS,
    USER_COUPON_COLUMNS,
};
pub use payment::{Payment, PrepayPayload, Refund, PAYMENT_COLUMNS, REFUND_COLUMNS};
pub use status::{
    Actor, AppointmentStatus, CouponStatus, PaymentStatus, RefundStatus, UnknownStatus,
};
pub use time_slot::{NewSlot, TimeSlot, TIME_SLOT_COLUMNS};
