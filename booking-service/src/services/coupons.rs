//! Coupon ledger: template issuance and the per-coupon lifecycle
//! `unused -> using -> used`, reverted to `unused` only by a pre-payment
//! cancellation.

use crate::models::{
    Appointment, AppointmentStatus, CouponApplication, CouponStatus, CouponTemplate,
    DiscountType, UserCoupon, COUPON_TEMPLATE_COLUMNS, USER_COUPON_COLUMNS,
};
use crate::services::error::{CouponError, ServiceError};
use crate::services::metrics::{record_coupon_operation, COUPON_OPERATIONS, DB_QUERY_DURATION};
use crate::utils::generate_coupon_code;
use chrono::{Duration, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Attempts at drawing a redemption code not already taken.
const CODE_ATTEMPTS: usize = 5;

/// Fields for a new template, validated by the caller.
#[derive(Debug, Clone)]
pub struct NewCouponTemplate {
    pub name: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub min_amount: i64,
    pub validity_days: i32,
    pub total_count: i32,
}

#[derive(Clone)]
pub struct CouponLedger {
    pool: PgPool,
}

impl CouponLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, template), fields(merchant_id = %merchant_id))]
    pub async fn create_template(
        &self,
        merchant_id: Uuid,
        template: NewCouponTemplate,
    ) -> Result<CouponTemplate, ServiceError> {
        if template.discount_type == DiscountType::Percent && template.discount_value > 100 {
            return Err(ServiceError::Validation(
                "Percent discount cannot exceed 100".to_string(),
            ));
        }

        let created = sqlx::query_as::<_, CouponTemplate>(&format!(
            r#"
            INSERT INTO coupon_templates (template_id, merchant_id, name, discount_type, discount_value, min_amount, validity_days, remaining_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            COUPON_TEMPLATE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(merchant_id)
        .bind(&template.name)
        .bind(template.discount_type.as_str())
        .bind(template.discount_value)
        .bind(template.min_amount)
        .bind(template.validity_days)
        .bind(template.total_count)
        .fetch_one(&self.pool)
        .await?;

        info!(template_id = %created.template_id, "Coupon template created");
        record_coupon_operation("create_template", "success");
        Ok(created)
    }

    /// Issues one coupon from a template. The template row is locked so a
    /// limited run can never be oversold.
    #[instrument(skip(self), fields(customer_id = %customer_id, template_id = %template_id))]
    pub async fn claim(
        &self,
        customer_id: Uuid,
        template_id: Uuid,
    ) -> Result<UserCoupon, ServiceError> {
        let result = self.claim_inner(customer_id, template_id).await;
        match &result {
            Ok(_) => record_coupon_operation("claim", "success"),
            Err(e) => record_coupon_operation("claim", e.kind()),
        }
        result
    }

    async fn claim_inner(
        &self,
        customer_id: Uuid,
        template_id: Uuid,
    ) -> Result<UserCoupon, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_coupon"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        let template = sqlx::query_as::<_, CouponTemplate>(&format!(
            "SELECT {} FROM coupon_templates WHERE template_id = $1 FOR UPDATE",
            COUPON_TEMPLATE_COLUMNS
        ))
        .bind(template_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CouponError::TemplateNotFound(template_id))?;

        if template.remaining_count <= 0 {
            return Err(CouponError::Exhausted(template_id).into());
        }

        let valid_from = Utc::now();
        let valid_to = valid_from + Duration::days(i64::from(template.validity_days));

        let mut issued = None;
        for _ in 0..CODE_ATTEMPTS {
            issued = sqlx::query_as::<_, UserCoupon>(&format!(
                r#"
                INSERT INTO user_coupons (coupon_id, customer_id, template_id, code, status, valid_from, valid_to)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (code) DO NOTHING
                RETURNING {}
                "#,
                USER_COUPON_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(customer_id)
            .bind(template_id)
            .bind(generate_coupon_code())
            .bind(CouponStatus::Unused.as_str())
            .bind(valid_from)
            .bind(valid_to)
            .fetch_optional(&mut *tx)
            .await?;

            if issued.is_some() {
                break;
            }
        }
        let coupon = issued.ok_or_else(|| {
            ServiceError::Validation("Could not allocate a unique coupon code".to_string())
        })?;

        sqlx::query(
            "UPDATE coupon_templates SET remaining_count = remaining_count - 1 WHERE template_id = $1",
        )
        .bind(template_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        timer.observe_duration();

        info!(coupon_id = %coupon.coupon_id, code = %coupon.code, "Coupon claimed");
        Ok(coupon)
    }

    /// Validates the coupon against the order and soft-locks it as `using`
    /// inside the booking transaction. A rollback of that transaction undoes
    /// the soft lock.
    #[instrument(skip(self, conn), fields(customer_id = %customer_id, coupon_id = %coupon_id))]
    pub async fn apply(
        &self,
        conn: &mut PgConnection,
        customer_id: Uuid,
        coupon_id: Uuid,
        merchant_id: Uuid,
        original_amount: i64,
    ) -> Result<CouponApplication, ServiceError> {
        let result = apply_coupon(conn, customer_id, coupon_id, merchant_id, original_amount).await;
        match &result {
            Ok(_) => record_coupon_operation("apply", "success"),
            Err(e) => {
                warn!(error = %e, "Coupon rejected");
                record_coupon_operation("apply", e.kind());
            }
        }
        result
    }

    /// Marks an applied coupon `used` and links it to the new appointment.
    #[instrument(skip(self, conn), fields(coupon_id = %coupon_id, appointment_id = %appointment_id))]
    pub async fn finalize(
        &self,
        conn: &mut PgConnection,
        coupon_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE user_coupons
            SET status = $1, appointment_id = $2, used_utc = NOW()
            WHERE coupon_id = $3 AND status = $4
            "#,
        )
        .bind(CouponStatus::Used.as_str())
        .bind(appointment_id)
        .bind(coupon_id)
        .bind(CouponStatus::Using.as_str())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CouponError::NotUnused(coupon_id).into());
        }
        Ok(())
    }

    /// Restores the coupon linked to `appointment` to `unused`. Only a
    /// pre-payment appointment gives its coupon back; otherwise nothing changes.
    #[instrument(skip(self, conn, appointment), fields(appointment_id = %appointment.appointment_id))]
    pub async fn revert(
        &self,
        conn: &mut PgConnection,
        appointment: &Appointment,
    ) -> Result<Option<Uuid>, ServiceError> {
        let pre_payment = matches!(
            appointment.status,
            AppointmentStatus::Pending | AppointmentStatus::Confirmed
        ) && appointment.payment_id.is_none();
        if !pre_payment {
            warn!(status = %appointment.status, "Coupon kept: appointment already paid");
            return Ok(None);
        }

        let restored = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE user_coupons
            SET status = $1, appointment_id = NULL, used_utc = NULL
            WHERE appointment_id = $2 AND status IN ($3, $4)
            RETURNING coupon_id
            "#,
        )
        .bind(CouponStatus::Unused.as_str())
        .bind(appointment.appointment_id)
        .bind(CouponStatus::Using.as_str())
        .bind(CouponStatus::Used.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(coupon_id) = restored {
            info!(coupon_id = %coupon_id, "Coupon restored");
            record_coupon_operation("revert", "success");
        }
        Ok(restored)
    }

    #[instrument(skip(self))]
    pub async fn list_user_coupons(
        &self,
        customer_id: Uuid,
        status: Option<CouponStatus>,
    ) -> Result<Vec<UserCoupon>, ServiceError> {
        let coupons = sqlx::query_as::<_, UserCoupon>(&format!(
            r#"
            SELECT {}
            FROM user_coupons
            WHERE customer_id = $1 AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY created_utc DESC
            "#,
            USER_COUPON_COLUMNS
        ))
        .bind(customer_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(coupons)
    }

    /// Moves unused coupons whose window has closed to `expired`.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self) -> Result<u64, ServiceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expire_coupons"])
            .start_timer();

        let expired = sqlx::query(
            "UPDATE user_coupons SET status = $1 WHERE status = $2 AND valid_to < NOW()",
        )
        .bind(CouponStatus::Expired.as_str())
        .bind(CouponStatus::Unused.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        timer.observe_duration();

        if expired > 0 {
            info!(expired, "Expired stale coupons");
            COUPON_OPERATIONS
                .with_label_values(&["expire", "success"])
                .inc_by(expired as f64);
        }
        Ok(expired)
    }
}

async fn apply_coupon(
    conn: &mut PgConnection,
    customer_id: Uuid,
    coupon_id: Uuid,
    merchant_id: Uuid,
    original_amount: i64,
) -> Result<CouponApplication, ServiceError> {
    let coupon = sqlx::query_as::<_, UserCoupon>(&format!(
        "SELECT {} FROM user_coupons WHERE coupon_id = $1 FOR UPDATE",
        USER_COUPON_COLUMNS
    ))
    .bind(coupon_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(CouponError::NotFound(coupon_id))?;

    if coupon.customer_id != customer_id {
        return Err(CouponError::WrongOwner(coupon_id).into());
    }
    if coupon.status != CouponStatus::Unused {
        return Err(CouponError::NotUnused(coupon_id).into());
    }

    let now = Utc::now();
    if now < coupon.valid_from {
        return Err(CouponError::NotYetValid(coupon_id).into());
    }
    if now > coupon.valid_to {
        return Err(CouponError::Expired(coupon_id).into());
    }

    let template = sqlx::query_as::<_, CouponTemplate>(&format!(
        "SELECT {} FROM coupon_templates WHERE template_id = $1",
        COUPON_TEMPLATE_COLUMNS
    ))
    .bind(coupon.template_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(CouponError::TemplateNotFound(coupon.template_id))?;

    if template.merchant_id != merchant_id {
        return Err(CouponError::NotApplicable(coupon_id).into());
    }
    if original_amount < template.min_amount {
        return Err(CouponError::BelowMinimum {
            amount: original_amount,
            minimum: template.min_amount,
        }
        .into());
    }

    let discount_type: DiscountType = template
        .discount_type
        .parse()
        .map_err(CouponError::UnknownDiscountType)?;
    let (discount, final_amount) = discount_type.apply(template.discount_value, original_amount);

    sqlx::query("UPDATE user_coupons SET status = $1 WHERE coupon_id = $2")
        .bind(CouponStatus::Using.as_str())
        .bind(coupon_id)
        .execute(&mut *conn)
        .await?;

    Ok(CouponApplication {
        coupon_id,
        original_amount,
        discount,
        final_amount,
    })
}
