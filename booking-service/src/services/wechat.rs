//! WeChat Pay (v2 API) client.
//!
//! Requests and responses are flat `<xml><key>value</key>...</xml>`
//! documents signed with the sorted-parameter construction from
//! `service_core::utils::signature`.

use crate::config::WechatPayConfig;
use crate::models::PrepayPayload;
use crate::services::error::GatewayError;
use crate::services::gateway::{GatewayOrder, GatewayRefund, PaymentGateway, RefundReceipt};
use crate::services::metrics::record_gateway_request;
use crate::utils::generate_nonce;
use async_trait::async_trait;
use chrono::Utc;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Identity};
use secrecy::ExposeSecret;
use service_core::utils::signature::{sign_params, verify_params, SignType, SIGN_FIELD};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, instrument};

pub const SUCCESS: &str = "SUCCESS";
pub const FAIL: &str = "FAIL";

const UNIFIED_ORDER_PATH: &str = "/pay/unifiedorder";
const REFUND_PATH: &str = "/secapi/pay/refund";

/// Serializes fields as a flat XML document under an `<xml>` root.
pub fn to_xml(fields: &BTreeMap<String, String>) -> Result<String, GatewayError> {
    let mut writer = Writer::new(Vec::new());

    writer
        .write_event(Event::Start(BytesStart::new("xml")))
        .map_err(encode_err)?;
    for (key, value) in fields {
        writer
            .write_event(Event::Start(BytesStart::new(key.as_str())))
            .map_err(encode_err)?;
        writer
            .write_event(Event::Text(BytesText::new(value)))
            .map_err(encode_err)?;
        writer
            .write_event(Event::End(BytesEnd::new(key.as_str())))
            .map_err(encode_err)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("xml")))
        .map_err(encode_err)?;

    String::from_utf8(writer.into_inner()).map_err(encode_err)
}

fn encode_err<E: std::fmt::Display>(e: E) -> GatewayError {
    GatewayError::Client(format!("XML encode failed: {}", e))
}

/// Parses a flat XML document into its child fields. Text and CDATA content
/// are both accepted; nested elements below the first level are ignored.
pub fn parse_xml(body: &str) -> Result<BTreeMap<String, String>, GatewayError> {
    // Field text is kept byte-for-byte; the signature covers it as sent.
    let mut reader = Reader::from_str(body);

    let mut fields = BTreeMap::new();
    let mut depth = 0usize;
    let mut current: Option<String> = None;
    let mut value = String::new();
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 1 {
                    saw_root = true;
                } else if depth == 2 {
                    current = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                    value.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 {
                    let key = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    fields.insert(key, String::new());
                }
            }
            Ok(Event::Text(t)) => {
                if depth == 2 {
                    let text = t
                        .unescape()
                        .map_err(|e| GatewayError::Decode(e.to_string()))?;
                    value.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if depth == 2 {
                    value.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    if let Some(key) = current.take() {
                        fields.insert(key, std::mem::take(&mut value));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(GatewayError::Decode(e.to_string())),
        }
    }

    if !saw_root || depth != 0 {
        return Err(GatewayError::Decode("Incomplete XML document".to_string()));
    }

    Ok(fields)
}

#[derive(Clone)]
pub struct WechatPayClient {
    client: Client,
    /// Client presenting the merchant certificate, needed for refunds.
    refund_client: Option<Client>,
    config: WechatPayConfig,
}

impl WechatPayClient {
    pub fn new(config: WechatPayConfig, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(timeout).build()?;

        let refund_client = match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let mut pem = std::fs::read(cert_path).map_err(|e| {
                    GatewayError::Client(format!("Failed to read {}: {}", cert_path, e))
                })?;
                let key = std::fs::read(key_path).map_err(|e| {
                    GatewayError::Client(format!("Failed to read {}: {}", key_path, e))
                })?;
                pem.push(b'\n');
                pem.extend_from_slice(&key);

                let identity = Identity::from_pem(&pem)?;
                Some(Client::builder().timeout(timeout).identity(identity).build()?)
            }
            _ => None,
        };

        Ok(Self {
            client,
            refund_client,
            config,
        })
    }

    fn api_key(&self) -> &str {
        self.config.api_key.expose_secret()
    }

    fn sign(&self, params: &BTreeMap<String, String>) -> Result<String, GatewayError> {
        sign_params(params, self.api_key(), self.config.sign_type)
            .map_err(|e| GatewayError::Client(e.to_string()))
    }

    fn base_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("appid".to_string(), self.config.app_id.clone());
        params.insert("mch_id".to_string(), self.config.mch_id.clone());
        params.insert("nonce_str".to_string(), generate_nonce());
        if self.config.sign_type != SignType::Md5 {
            params.insert(
                "sign_type".to_string(),
                self.config.sign_type.as_str().to_string(),
            );
        }
        params
    }

    /// Signs and posts a request, then checks transport, protocol and
    /// business result codes of the reply.
    async fn post_xml(
        &self,
        client: &Client,
        path: &str,
        mut params: BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        let sign = self.sign(&params)?;
        params.insert(SIGN_FIELD.to_string(), sign);

        let url = format!(
            "{}{}",
            self.config.api_base_url.trim_end_matches('/'),
            path
        );
        let response = client
            .post(&url)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(to_xml(&params)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::HttpStatus(status.as_u16()));
        }

        let fields = parse_xml(&response.text().await?)?;

        let return_code = fields.get("return_code").map(String::as_str).unwrap_or("");
        if return_code != SUCCESS {
            return Err(GatewayError::Rejected {
                code: return_code.to_string(),
                message: fields.get("return_msg").cloned().unwrap_or_default(),
            });
        }

        let signature = fields
            .get(SIGN_FIELD)
            .ok_or(GatewayError::InvalidSignature)?;
        let valid = verify_params(&fields, self.api_key(), self.config.sign_type, signature)
            .map_err(|e| GatewayError::Client(e.to_string()))?;
        if !valid {
            return Err(GatewayError::InvalidSignature);
        }

        if fields.get("result_code").map(String::as_str) != Some(SUCCESS) {
            return Err(GatewayError::Rejected {
                code: fields.get("err_code").cloned().unwrap_or_default(),
                message: fields.get("err_code_des").cloned().unwrap_or_default(),
            });
        }

        Ok(fields)
    }

    /// Parameters for the client-side payment sheet, signed with the same key.
    fn prepay_payload(&self, prepay_id: &str) -> Result<PrepayPayload, GatewayError> {
        let time_stamp = Utc::now().timestamp().to_string();
        let nonce_str = generate_nonce();
        let package = format!("prepay_id={}", prepay_id);
        let sign_type = self.config.sign_type.as_str().to_string();

        let params: BTreeMap<String, String> = [
            ("appId", self.config.app_id.as_str()),
            ("timeStamp", time_stamp.as_str()),
            ("nonceStr", nonce_str.as_str()),
            ("package", package.as_str()),
            ("signType", sign_type.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let pay_sign = self.sign(&params)?;

        Ok(PrepayPayload {
            app_id: self.config.app_id.clone(),
            time_stamp,
            nonce_str,
            package,
            sign_type,
            pay_sign,
        })
    }
}

fn outcome_label<T>(result: &Result<T, GatewayError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(GatewayError::NotConfigured) => "not_configured",
        Err(GatewayError::Transport(e)) if e.is_timeout() => "timeout",
        Err(GatewayError::Transport(_)) | Err(GatewayError::HttpStatus(_)) => "transport_error",
        Err(GatewayError::Rejected { .. }) => "rejected",
        Err(GatewayError::InvalidSignature) => "invalid_signature",
        Err(GatewayError::Decode(_)) | Err(GatewayError::Client(_)) => "error",
    }
}

#[async_trait]
impl PaymentGateway for WechatPayClient {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    #[instrument(skip(self, order), fields(out_trade_no = %order.out_trade_no, total_fee = order.total_fee))]
    async fn create_order(&self, order: &GatewayOrder) -> Result<PrepayPayload, GatewayError> {
        let result = async {
            if !self.is_configured() {
                return Err(GatewayError::NotConfigured);
            }

            let mut params = self.base_params();
            params.insert("body".to_string(), order.description.clone());
            params.insert("out_trade_no".to_string(), order.out_trade_no.clone());
            params.insert("total_fee".to_string(), order.total_fee.to_string());
            params.insert("spbill_create_ip".to_string(), order.client_ip.clone());
            params.insert("notify_url".to_string(), self.config.notify_url.clone());
            params.insert("trade_type".to_string(), "JSAPI".to_string());
            params.insert("openid".to_string(), order.openid.clone());

            let reply = self.post_xml(&self.client, UNIFIED_ORDER_PATH, params).await?;
            let prepay_id = reply
                .get("prepay_id")
                .filter(|id| !id.is_empty())
                .ok_or_else(|| GatewayError::Decode("Reply has no prepay_id".to_string()))?;

            self.prepay_payload(prepay_id)
        }
        .await;

        record_gateway_request("unified_order", outcome_label(&result));
        match &result {
            Ok(_) => info!("Unified order placed"),
            Err(e) => error!(error = %e, "Unified order failed"),
        }
        result
    }

    #[instrument(skip(self, refund), fields(out_refund_no = %refund.out_refund_no, refund_fee = refund.refund_fee))]
    async fn refund(&self, refund: &GatewayRefund) -> Result<RefundReceipt, GatewayError> {
        let result = async {
            if !self.is_configured() {
                return Err(GatewayError::NotConfigured);
            }
            let client = self
                .refund_client
                .as_ref()
                .ok_or(GatewayError::NotConfigured)?;

            let mut params = self.base_params();
            params.insert("out_trade_no".to_string(), refund.out_trade_no.clone());
            params.insert("out_refund_no".to_string(), refund.out_refund_no.clone());
            params.insert("total_fee".to_string(), refund.total_fee.to_string());
            params.insert("refund_fee".to_string(), refund.refund_fee.to_string());
            if !refund.reason.is_empty() {
                params.insert("refund_desc".to_string(), refund.reason.clone());
            }

            let reply = self.post_xml(client, REFUND_PATH, params).await?;
            let gateway_refund_id = reply
                .get("refund_id")
                .cloned()
                .ok_or_else(|| GatewayError::Decode("Reply has no refund_id".to_string()))?;

            Ok(RefundReceipt { gateway_refund_id })
        }
        .await;

        record_gateway_request("refund", outcome_label(&result));
        match &result {
            Ok(receipt) => info!(gateway_refund_id = %receipt.gateway_refund_id, "Refund accepted by gateway"),
            Err(e) => error!(error = %e, "Refund request failed"),
        }
        result
    }

    fn verify_notification(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<bool, GatewayError> {
        let Some(signature) = fields.get(SIGN_FIELD) else {
            return Ok(false);
        };
        // Notifications may name their own sign type; fall back to ours.
        let sign_type = fields
            .get("sign_type")
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.config.sign_type);

        verify_params(fields, self.api_key(), sign_type, signature)
            .map_err(|e| GatewayError::Client(e.to_string()))
    }
}
