use serde::{Deserialize, Serialize};

/// `POST /transfer` request body (withdrawal to a Telegram user).
///
/// `spend_id` is the provider-side idempotency key: resubmitting a
/// transfer with the same `spend_id` never sends the funds twice.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub user_id: i64,
    pub asset: String,
    pub amount: String,
    pub spend_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Completed transfer record.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferDto {
    pub transfer_id: i64,
    pub user_id: i64,
    pub asset: String,
    pub amount: String,
    pub status: String,
    pub completed_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_request_omits_empty_comment() {
        let req = TransferRequest {
            user_id: 42,
            asset: "USDT".to_string(),
            amount: "5.00000000".to_string(),
            spend_id: "withdraw:abc".to_string(),
            comment: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("comment").is_none());
        assert_eq!(json["spend_id"], "withdraw:abc");
    }

    #[test]
    fn transfer_dto_decodes() {
        let raw = r#"{
            "transfer_id": 999,
            "user_id": 42,
            "asset": "USDT",
            "amount": "5.0",
            "status": "completed",
            "completed_at": "2025-07-01T12:00:00.000Z"
        }"#;
        let dto: TransferDto = serde_json::from_str(raw).unwrap();
        assert_eq!(dto.transfer_id, 999);
        assert_eq!(dto.status, "completed");
    }
}
