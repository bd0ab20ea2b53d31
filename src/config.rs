use std::env;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,

    pub khalti_base_url: String,
    pub khalti_secret_key: String,
    pub khalti_webhook_secret: String,
    pub khalti_return_url: String,
    pub khalti_website_url: String,

    pub esewa_form_url: String,
    pub esewa_status_url: String,
    pub esewa_product_code: String,
    pub esewa_secret_key: String,
    pub esewa_success_url: String,
    pub esewa_failure_url: String,

    pub sweep_interval_secs: u64,
    pub recheck_after_secs: i64,
    pub expire_after_secs: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4000),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "chargepay.db".to_string()),

            khalti_base_url: env::var("KHALTI_BASE_URL")
                .unwrap_or_else(|_| "https://test-pay.khalti.com/api/v2".to_string()),
            khalti_secret_key: env::var("KHALTI_SECRET_KEY").unwrap_or_default(),
            khalti_webhook_secret: env::var("KHALTI_WEBHOOK_SECRET").unwrap_or_default(),
            khalti_return_url: env::var("KHALTI_RETURN_URL")
                .unwrap_or_else(|_| "http://localhost:3000/payment-success".to_string()),
            khalti_website_url: env::var("KHALTI_WEBSITE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            esewa_form_url: env::var("ESEWA_FORM_URL").unwrap_or_else(|_| {
                "https://rc-epay.esewa.com.np/api/epay/main/v2/form".to_string()
            }),
            esewa_status_url: env::var("ESEWA_STATUS_URL").unwrap_or_else(|_| {
                "https://rc.esewa.com.np/api/epay/transaction/status/".to_string()
            }),
            esewa_product_code: env::var("ESEWA_PRODUCT_CODE")
                .unwrap_or_else(|_| "EPAYTEST".to_string()),
            esewa_secret_key: env::var("ESEWA_SECRET_KEY").unwrap_or_default(),
            esewa_success_url: env::var("ESEWA_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/payment-success".to_string()),
            esewa_failure_url: env::var("ESEWA_FAILURE_URL")
                .unwrap_or_else(|_| "http://localhost:3000/payment-failed".to_string()),

            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            recheck_after_secs: env::var("RECHECK_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            expire_after_secs: env::var("EXPIRE_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
        }
    }
}
