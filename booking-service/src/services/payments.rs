//! Payment reconciler: payment intents, gateway notifications and refunds.
//!
//! Every state change runs under row locks on the payment (and the linked
//! appointment), so a redelivered notification observes the first one's
//! committed result instead of re-applying it.

use crate::models::{
    Actor, Appointment, AppointmentStatus, Customer, Payment, PaymentStatus, PrepayPayload, Refund,
    RefundStatus, APPOINTMENT_COLUMNS, PAYMENT_COLUMNS, REFUND_COLUMNS,
};
use crate::services::booking::{ensure_transition, lock_appointment, update_status};
use crate::services::error::ServiceError;
use crate::services::gateway::{GatewayOrder, GatewayRefund, PaymentGateway};
use crate::services::metrics::{record_payment_notification, record_refund, DB_QUERY_DURATION};
use crate::services::slots::SlotLedger;
use crate::services::wechat::SUCCESS;
use crate::utils::{generate_trade_no, TradePrefix};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: i64,
    pub description: String,
    pub appointment_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub payment: Payment,
    /// Absent for simulated payments, which never reach the gateway.
    pub pay_params: Option<PrepayPayload>,
    pub simulated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Settled {
        payment_id: Uuid,
        appointment_id: Option<Uuid>,
    },
    /// Redelivery for a payment that already succeeded.
    AlreadySettled { payment_id: Uuid },
}

#[derive(Clone)]
pub struct PaymentReconciler {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
    slots: SlotLedger,
    simulate: bool,
}

impl PaymentReconciler {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        slots: SlotLedger,
        simulate: bool,
    ) -> Self {
        Self {
            pool,
            gateway,
            slots,
            simulate,
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulate
    }

    /// Persists a pending payment, then asks the gateway for client payment
    /// parameters. A gateway failure leaves the row behind as `failed`.
    #[instrument(skip(self, request, client_ip), fields(customer_id = %customer_id, amount = request.amount, appointment_id = ?request.appointment_id))]
    pub async fn create_payment_intent(
        &self,
        customer_id: Uuid,
        request: PaymentRequest,
        client_ip: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        if request.amount < 1 {
            return Err(ServiceError::Validation(
                "Amount must be at least 1".to_string(),
            ));
        }

        let openid = if self.simulate {
            None
        } else {
            Some(self.customer_openid(customer_id).await?)
        };

        let mut tx = self.pool.begin().await?;

        let merchant_id = match request.appointment_id {
            Some(appointment_id) => {
                let appointment = lock_appointment(&mut tx, appointment_id).await?;
                check_payable(&appointment, customer_id, request.amount)?;
                ensure_not_settled(&mut tx, appointment_id).await?;
                Some(appointment.merchant_id)
            }
            None => None,
        };

        let prefix = if self.simulate {
            TradePrefix::SimulatedPayment
        } else {
            TradePrefix::Payment
        };

        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (payment_id, customer_id, merchant_id, appointment_id, out_trade_no, amount, description, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(merchant_id)
        .bind(request.appointment_id)
        .bind(generate_trade_no(prefix))
        .bind(request.amount)
        .bind(&request.description)
        .bind(PaymentStatus::Pending.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            payment_id = %payment.payment_id,
            out_trade_no = %payment.out_trade_no,
            simulated = self.simulate,
            "Payment intent recorded"
        );

        let Some(openid) = openid else {
            return Ok(PaymentIntent {
                payment,
                pay_params: None,
                simulated: true,
            });
        };

        let order = GatewayOrder {
            out_trade_no: payment.out_trade_no.clone(),
            description: payment.description.clone(),
            total_fee: payment.amount,
            openid,
            client_ip: client_ip.to_string(),
        };

        match self.gateway.create_order(&order).await {
            Ok(pay_params) => Ok(PaymentIntent {
                payment,
                pay_params: Some(pay_params),
                simulated: false,
            }),
            Err(e) => {
                self.mark_failed(&payment.out_trade_no, &e.to_string())
                    .await?;
                Err(ServiceError::Gateway(e))
            }
        }
    }

    /// Payment intent for the full amount of a confirmed appointment.
    #[instrument(skip(self, client_ip))]
    pub async fn pay_for_appointment(
        &self,
        customer_id: Uuid,
        appointment_id: Uuid,
        client_ip: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        let appointment = sqlx::query_as::<_, Appointment>(&format!(
            "SELECT {} FROM appointments WHERE appointment_id = $1",
            APPOINTMENT_COLUMNS
        ))
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?
        .filter(|a| a.is_owned_by(customer_id))
        .ok_or(ServiceError::AppointmentNotFound(appointment_id))?;

        let request = PaymentRequest {
            amount: appointment.amount,
            description: format!("Appointment {}", appointment.order_no),
            appointment_id: Some(appointment_id),
        };
        self.create_payment_intent(customer_id, request, client_ip)
            .await
    }

    /// Processes a gateway notification. The signature is checked before any
    /// field is trusted.
    #[instrument(skip(self, fields), fields(out_trade_no = ?fields.get("out_trade_no")))]
    pub async fn handle_notification(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<NotificationOutcome, ServiceError> {
        let result = self.reconcile(fields).await;

        let outcome = match &result {
            Ok(NotificationOutcome::Settled { .. }) => "settled",
            Ok(NotificationOutcome::AlreadySettled { .. }) => "duplicate",
            Err(e) => e.kind(),
        };
        record_payment_notification(outcome);

        result
    }

    async fn reconcile(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<NotificationOutcome, ServiceError> {
        if !self.gateway.verify_notification(fields)? {
            error!("Rejected notification with invalid signature");
            return Err(ServiceError::InvalidSignature);
        }

        let return_code = fields.get("return_code").map(String::as_str);
        if return_code != Some(SUCCESS) {
            return Err(ServiceError::MalformedNotification(format!(
                "return_code is {}",
                return_code.unwrap_or("missing")
            )));
        }

        let out_trade_no = fields
            .get("out_trade_no")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ServiceError::MalformedNotification("out_trade_no is missing".to_string())
            })?;

        if fields.get("result_code").map(String::as_str) != Some(SUCCESS) {
            let reason = fields
                .get("err_code_des")
                .or_else(|| fields.get("err_code"))
                .cloned()
                .unwrap_or_else(|| "payment failed".to_string());
            self.mark_failed(out_trade_no, &reason).await?;
            warn!(reason = %reason, "Gateway reported payment failure");
            return Err(ServiceError::GatewayReportedFailure(reason));
        }

        let total_fee = fields
            .get("total_fee")
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                ServiceError::MalformedNotification("total_fee is missing or invalid".to_string())
            })?;

        let payload = serde_json::Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        );

        self.settle(
            out_trade_no,
            total_fee,
            fields.get("transaction_id").cloned(),
            payload,
        )
        .await
    }

    /// Marks a pending payment successful and advances its appointment to
    /// `paid`, all in one transaction.
    async fn settle(
        &self,
        out_trade_no: &str,
        notified_amount: i64,
        transaction_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<NotificationOutcome, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        let payment = lock_payment_by_trade_no(&mut tx, out_trade_no).await?;
        match payment.status {
            PaymentStatus::Success => {
                info!(payment_id = %payment.payment_id, "Duplicate notification acknowledged");
                return Ok(NotificationOutcome::AlreadySettled {
                    payment_id: payment.payment_id,
                });
            }
            PaymentStatus::Pending => {}
            // The order may exist at the gateway even though creating it
            // looked like a failure here; money actually taken wins.
            PaymentStatus::Failed => {
                warn!(
                    payment_id = %payment.payment_id,
                    failure_reason = ?payment.failure_reason,
                    "Settling payment previously marked failed"
                );
            }
            status => {
                warn!(payment_id = %payment.payment_id, status = %status, "Notification for unsettleable payment");
                return Err(ServiceError::InvalidPaymentState {
                    status,
                    expected: PaymentStatus::Pending,
                });
            }
        }

        if payment.amount != notified_amount {
            error!(
                payment_id = %payment.payment_id,
                recorded = payment.amount,
                notified = notified_amount,
                "Notified amount does not match payment"
            );
            return Err(ServiceError::AmountMismatch {
                out_trade_no: out_trade_no.to_string(),
                recorded: payment.amount,
                notified: notified_amount,
            });
        }

        sqlx::query(
            r#"
            UPDATE payments
            SET status = $1, paid_utc = NOW(), transaction_id = $2, notify_payload = $3,
                failure_reason = NULL, updated_utc = NOW()
            WHERE payment_id = $4
            "#,
        )
        .bind(PaymentStatus::Success.as_str())
        .bind(&transaction_id)
        .bind(&payload)
        .bind(payment.payment_id)
        .execute(&mut *tx)
        .await?;

        if let Some(appointment_id) = payment.appointment_id {
            let appointment = lock_appointment(&mut tx, appointment_id).await?;
            if appointment
                .status
                .can_transition(AppointmentStatus::Paid, Actor::PaymentSettled)
            {
                sqlx::query(
                    r#"
                    UPDATE appointments
                    SET status = $1, payment_id = $2, updated_utc = NOW()
                    WHERE appointment_id = $3
                    "#,
                )
                .bind(AppointmentStatus::Paid.as_str())
                .bind(payment.payment_id)
                .bind(appointment_id)
                .execute(&mut *tx)
                .await?;
            } else {
                error!(
                    payment_id = %payment.payment_id,
                    appointment_id = %appointment_id,
                    status = %appointment.status,
                    "Payment settled for appointment that cannot be paid; manual refund required"
                );
            }
        }

        tx.commit().await?;
        timer.observe_duration();

        info!(
            payment_id = %payment.payment_id,
            transaction_id = ?transaction_id,
            "Payment settled"
        );

        Ok(NotificationOutcome::Settled {
            payment_id: payment.payment_id,
            appointment_id: payment.appointment_id,
        })
    }

    /// Operator-triggered notification for simulated payments.
    #[instrument(skip(self))]
    pub async fn simulate_notification(
        &self,
        out_trade_no: &str,
        success: bool,
    ) -> Result<NotificationOutcome, ServiceError> {
        if !self.simulate {
            return Err(ServiceError::SimulationDisabled);
        }

        if !success {
            self.mark_failed(out_trade_no, "simulated failure").await?;
            record_payment_notification("simulated_failure");
            return Err(ServiceError::GatewayReportedFailure(
                "simulated failure".to_string(),
            ));
        }

        let amount = sqlx::query_scalar::<_, i64>(
            "SELECT amount FROM payments WHERE out_trade_no = $1",
        )
        .bind(out_trade_no)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::UnknownOrder(out_trade_no.to_string()))?;

        let transaction_id = format!("SIMTX{}", &Uuid::new_v4().simple().to_string()[..16]);
        let payload = serde_json::json!({
            "simulated": true,
            "out_trade_no": out_trade_no,
            "total_fee": amount,
        });

        let result = self
            .settle(out_trade_no, amount, Some(transaction_id), payload)
            .await;
        record_payment_notification(match &result {
            Ok(_) => "simulated",
            Err(e) => e.kind(),
        });
        result
    }

    #[instrument(skip(self))]
    pub async fn get_payment(
        &self,
        customer_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Payment, ServiceError> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE payment_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .filter(|p| p.customer_id == customer_id)
        .ok_or_else(|| ServiceError::PaymentNotFound(payment_id.to_string()))
    }

    /// Refunds a settled appointment. The cap against the original payment is
    /// checked before any refund row is written.
    #[instrument(skip(self, reason), fields(merchant_id = %merchant_id, appointment_id = %appointment_id, amount = amount))]
    pub async fn initiate_refund(
        &self,
        merchant_id: Uuid,
        appointment_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<Refund, ServiceError> {
        let result = self
            .refund_inner(merchant_id, appointment_id, amount, reason)
            .await;

        match &result {
            Ok(refund) => {
                record_refund(refund.status.as_str());
                info!(
                    refund_id = %refund.refund_id,
                    out_refund_no = %refund.out_refund_no,
                    status = %refund.status,
                    "Refund initiated"
                );
            }
            Err(e) => {
                record_refund(e.kind());
                warn!(error = %e, "Refund rejected");
            }
        }
        result
    }

    async fn refund_inner(
        &self,
        merchant_id: Uuid,
        appointment_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<Refund, ServiceError> {
        if amount < 1 {
            return Err(ServiceError::Validation(
                "Refund amount must be at least 1".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let appointment = lock_appointment(&mut tx, appointment_id).await?;
        if appointment.merchant_id != merchant_id {
            return Err(ServiceError::NotOwner);
        }
        if !appointment.status.is_refundable() {
            return Err(ServiceError::NotRefundable(appointment.status));
        }

        let payment_id = appointment
            .payment_id
            .ok_or(ServiceError::PaymentNotSucceeded)?;
        let payment = lock_payment(&mut tx, payment_id).await?;
        if payment.status != PaymentStatus::Success {
            return Err(ServiceError::PaymentNotSucceeded);
        }
        if amount > payment.amount {
            return Err(ServiceError::RefundExceedsPayment {
                requested: amount,
                paid: payment.amount,
            });
        }

        if self.simulate {
            let refund = insert_refund(
                &mut tx,
                &payment,
                appointment_id,
                TradePrefix::SimulatedRefund,
                amount,
                reason,
                RefundStatus::Success,
            )
            .await?;
            set_payment_status(&mut tx, payment_id, PaymentStatus::Refunded).await?;
            self.cancel_for_refund(&mut tx, &appointment).await?;
            tx.commit().await?;
            return Ok(refund);
        }

        let refund = insert_refund(
            &mut tx,
            &payment,
            appointment_id,
            TradePrefix::Refund,
            amount,
            reason,
            RefundStatus::Processing,
        )
        .await?;
        set_payment_status(&mut tx, payment_id, PaymentStatus::Refunding).await?;
        tx.commit().await?;

        let request = GatewayRefund {
            out_trade_no: payment.out_trade_no.clone(),
            out_refund_no: refund.out_refund_no.clone(),
            total_fee: payment.amount,
            refund_fee: amount,
            reason: reason.to_string(),
        };

        match self.gateway.refund(&request).await {
            Ok(receipt) => {
                let mut tx = self.pool.begin().await?;

                let refund = sqlx::query_as::<_, Refund>(&format!(
                    r#"
                    UPDATE refunds
                    SET gateway_refund_id = $1, updated_utc = NOW()
                    WHERE refund_id = $2
                    RETURNING {}
                    "#,
                    REFUND_COLUMNS
                ))
                .bind(&receipt.gateway_refund_id)
                .bind(refund.refund_id)
                .fetch_one(&mut *tx)
                .await?;

                // The gateway already holds the refund; never fail past this point
                // because the appointment moved in the meantime.
                let appointment = lock_appointment(&mut tx, appointment_id).await?;
                if appointment
                    .status
                    .can_transition(AppointmentStatus::Canceled, Actor::Refund)
                {
                    self.cancel_for_refund(&mut tx, &appointment).await?;
                } else {
                    error!(
                        appointment_id = %appointment_id,
                        status = %appointment.status,
                        "Refund accepted but appointment could not be canceled"
                    );
                }

                tx.commit().await?;
                Ok(refund)
            }
            Err(e) => {
                let mut tx = self.pool.begin().await?;
                resolve_refund(&mut tx, refund.refund_id, RefundStatus::Failed, Some(&e.to_string()))
                    .await?;
                set_payment_status(&mut tx, payment_id, PaymentStatus::Success).await?;
                tx.commit().await?;
                Err(ServiceError::Gateway(e))
            }
        }
    }

    async fn cancel_for_refund(
        &self,
        conn: &mut PgConnection,
        appointment: &Appointment,
    ) -> Result<(), ServiceError> {
        ensure_transition(appointment, AppointmentStatus::Canceled, Actor::Refund)?;
        update_status(&mut *conn, appointment.appointment_id, AppointmentStatus::Canceled).await?;
        self.slots.release(&mut *conn, appointment.slot_id).await?;
        Ok(())
    }

    /// Records the asynchronous refund result reported by the gateway.
    #[instrument(skip(self, reason))]
    pub async fn confirm_refund(
        &self,
        out_refund_no: &str,
        success: bool,
        reason: Option<&str>,
    ) -> Result<Refund, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let refund = sqlx::query_as::<_, Refund>(&format!(
            "SELECT {} FROM refunds WHERE out_refund_no = $1 FOR UPDATE",
            REFUND_COLUMNS
        ))
        .bind(out_refund_no)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::RefundNotFound(out_refund_no.to_string()))?;

        let target = if success {
            RefundStatus::Success
        } else {
            RefundStatus::Failed
        };
        if !refund.status.can_transition(target) {
            return Err(ServiceError::RefundAlreadyResolved(refund.status));
        }

        let updated = resolve_refund(&mut tx, refund.refund_id, target, reason).await?;

        let payment = lock_payment(&mut tx, refund.payment_id).await?;
        let payment_target = if success {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::Success
        };
        if payment.status == PaymentStatus::Refunding {
            set_payment_status(&mut tx, payment.payment_id, payment_target).await?;
        } else {
            warn!(
                payment_id = %payment.payment_id,
                status = %payment.status,
                "Payment not refunding when refund result arrived"
            );
        }

        tx.commit().await?;

        record_refund(if success { "confirmed" } else { "failed" });
        if success {
            info!(refund_id = %updated.refund_id, "Refund confirmed");
        } else {
            warn!(refund_id = %updated.refund_id, reason = ?reason, "Refund failed at gateway");
        }
        Ok(updated)
    }

    /// Marks a still-pending payment failed. Settled payments are left alone.
    async fn mark_failed(&self, out_trade_no: &str, reason: &str) -> Result<(), ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $1, failure_reason = $2, updated_utc = NOW()
            WHERE out_trade_no = $3 AND status = $4
            "#,
        )
        .bind(PaymentStatus::Failed.as_str())
        .bind(reason)
        .bind(out_trade_no)
        .bind(PaymentStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, Uuid>(
                "SELECT payment_id FROM payments WHERE out_trade_no = $1",
            )
            .bind(out_trade_no)
            .fetch_optional(&self.pool)
            .await?;
            if exists.is_none() {
                return Err(ServiceError::UnknownOrder(out_trade_no.to_string()));
            }
            warn!(out_trade_no, "Failure reported for payment that is no longer pending");
        } else {
            warn!(out_trade_no, reason, "Payment marked failed");
        }
        Ok(())
    }

    async fn customer_openid(&self, customer_id: Uuid) -> Result<String, ServiceError> {
        sqlx::query_as::<_, Customer>(
            "SELECT customer_id, openid FROM customers WHERE customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?
        .and_then(|customer| customer.openid)
        .filter(|openid| !openid.is_empty())
        .ok_or_else(|| {
            ServiceError::Validation("Customer has no linked WeChat account".to_string())
        })
    }
}

fn check_payable(
    appointment: &Appointment,
    customer_id: Uuid,
    amount: i64,
) -> Result<(), ServiceError> {
    if !appointment.is_owned_by(customer_id) {
        return Err(ServiceError::NotOwner);
    }
    if appointment.status != AppointmentStatus::Confirmed {
        return Err(ServiceError::InvalidTransition {
            from: appointment.status,
            to: AppointmentStatus::Paid,
        });
    }
    if amount != appointment.amount {
        return Err(ServiceError::Validation(format!(
            "Amount {} does not match appointment amount {}",
            amount, appointment.amount
        )));
    }
    Ok(())
}

async fn ensure_not_settled(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> Result<(), ServiceError> {
    let settled = sqlx::query_scalar::<_, Uuid>(
        "SELECT payment_id FROM payments WHERE appointment_id = $1 AND status = $2 LIMIT 1",
    )
    .bind(appointment_id)
    .bind(PaymentStatus::Success.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    match settled {
        Some(_) => Err(ServiceError::InvalidPaymentState {
            status: PaymentStatus::Success,
            expected: PaymentStatus::Pending,
        }),
        None => Ok(()),
    }
}

async fn lock_payment(conn: &mut PgConnection, payment_id: Uuid) -> Result<Payment, ServiceError> {
    sqlx::query_as::<_, Payment>(&format!(
        "SELECT {} FROM payments WHERE payment_id = $1 FOR UPDATE",
        PAYMENT_COLUMNS
    ))
    .bind(payment_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ServiceError::PaymentNotFound(payment_id.to_string()))
}

async fn lock_payment_by_trade_no(
    conn: &mut PgConnection,
    out_trade_no: &str,
) -> Result<Payment, ServiceError> {
    sqlx::query_as::<_, Payment>(&format!(
        "SELECT {} FROM payments WHERE out_trade_no = $1 FOR UPDATE",
        PAYMENT_COLUMNS
    ))
    .bind(out_trade_no)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ServiceError::UnknownOrder(out_trade_no.to_string()))
}

async fn set_payment_status(
    conn: &mut PgConnection,
    payment_id: Uuid,
    status: PaymentStatus,
) -> Result<(), ServiceError> {
    sqlx::query("UPDATE payments SET status = $1, updated_utc = NOW() WHERE payment_id = $2")
        .bind(status.as_str())
        .bind(payment_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_refund(
    conn: &mut PgConnection,
    payment: &Payment,
    appointment_id: Uuid,
    prefix: TradePrefix,
    amount: i64,
    reason: &str,
    status: RefundStatus,
) -> Result<Refund, ServiceError> {
    let refund = sqlx::query_as::<_, Refund>(&format!(
        r#"
        INSERT INTO refunds (refund_id, payment_id, appointment_id, out_refund_no, amount, reason, status, refunded_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, CASE WHEN $7 = 'success' THEN NOW() ELSE NULL END)
        RETURNING {}
        "#,
        REFUND_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(payment.payment_id)
    .bind(appointment_id)
    .bind(generate_trade_no(prefix))
    .bind(amount)
    .bind(reason)
    .bind(status.as_str())
    .fetch_one(&mut *conn)
    .await?;

    Ok(refund)
}

async fn resolve_refund(
    conn: &mut PgConnection,
    refund_id: Uuid,
    status: RefundStatus,
    failure_reason: Option<&str>,
) -> Result<Refund, ServiceError> {
    let refund = sqlx::query_as::<_, Refund>(&format!(
        r#"
        UPDATE refunds
        SET status = $1,
            refunded_utc = CASE WHEN $1 = 'success' THEN NOW() ELSE refunded_utc END,
            failure_reason = $2,
            updated_utc = NOW()
        WHERE refund_id = $3
        RETURNING {}
        "#,
        REFUND_COLUMNS
    ))
    .bind(status.as_str())
    .bind(failure_reason)
    .bind(refund_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(refund)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn appointment(status: AppointmentStatus, customer_id: Uuid) -> Appointment {
        Appointment {
            appointment_id: Uuid::new_v4(),
            order_no: "ORD1700000000000001".to_string(),
            customer_id,
            merchant_id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            staff_id: Uuid::new_v4(),
            slot_id: Uuid::new_v4(),
            appointment_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            start_time: "09:00".to_string(),
            end_time: "10:00".to_string(),
            status,
            amount: 4500,
            payment_id: None,
            remark: String::new(),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn only_confirmed_appointments_are_payable() {
        let customer = Uuid::new_v4();
        assert!(check_payable(&appointment(AppointmentStatus::Confirmed, customer), customer, 4500).is_ok());

        let err = check_payable(&appointment(AppointmentStatus::Pending, customer), customer, 4500)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidTransition {
                from: AppointmentStatus::Pending,
                to: AppointmentStatus::Paid
            }
        ));
    }

    #[test]
    fn payable_amount_must_match() {
        let customer = Uuid::new_v4();
        let err = check_payable(&appointment(AppointmentStatus::Confirmed, customer), customer, 4000)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn other_customers_cannot_pay() {
        let err = check_payable(
            &appointment(AppointmentStatus::Confirmed, Uuid::new_v4()),
            Uuid::new_v4(),
            4500,
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotOwner));
    }
}
