use serde::Deserialize;

/// `GET /getMe` result: the identity of the app the token belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    pub app_id: i64,
    pub name: String,
    pub payment_processing_bot_username: String,
}
