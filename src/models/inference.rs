use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display};

use super::work_item::{CardHint, ImageRef};

/// Which remote round trip produced a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, AsRefStr, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InferenceStage {
    Primary,
    Verification,
}

impl InferenceStage {
    pub fn mode(self) -> InferenceMode {
        match self {
            InferenceStage::Primary => InferenceMode::Identify,
            InferenceStage::Verification => InferenceMode::Verify,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    Identify,
    Verify,
}

/// Request body sent to an inference endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InferenceRequest {
    pub image: ImageRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<CardHint>,
    pub mode: InferenceMode,
}

/// Successful identification payload returned by an inference endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyResponse {
    pub name: Option<String>,
    pub set: Option<String>,
    pub number: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

/// Error envelope returned by an inference endpoint for rejected requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteRejection {
    pub error_code: String,
    #[serde(default)]
    pub message: String,
}

/// Either shape an endpoint may answer with.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InferenceResponse {
    Rejected(RemoteRejection),
    Identified(IdentifyResponse),
}

/// Identification of a card as reported by the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CardIdentity {
    pub name: Option<String>,
    pub set: Option<String>,
    pub number: Option<String>,
}

impl CardIdentity {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.set.is_none() && self.number.is_none()
    }

    /// Hint forwarded to the verification call so the second pass can
    /// confirm a specific printing.
    pub fn as_hint(&self) -> Option<CardHint> {
        if self.set.is_none() && self.number.is_none() {
            return None;
        }
        Some(CardHint {
            set: self.set.clone(),
            number: self.number.clone(),
        })
    }
}

/// Outcome of one remote inference call. Immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResult {
    pub stage: InferenceStage,
    pub identity: Option<CardIdentity>,
    pub confidence: f64,
    #[serde(serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub error: Option<RemoteRejection>,
}

impl InferenceResult {
    pub fn identified(stage: InferenceStage, response: IdentifyResponse, latency: Duration) -> Self {
        let identity = CardIdentity {
            name: response.name,
            set: response.set,
            number: response.number,
        };
        Self {
            stage,
            identity: (!identity.is_empty()).then_some(identity),
            confidence: clamp_confidence(response.confidence),
            latency,
            error: None,
        }
    }

    pub fn rejected(stage: InferenceStage, rejection: RemoteRejection, latency: Duration) -> Self {
        Self {
            stage,
            identity: None,
            confidence: 0.0,
            latency,
            error: Some(rejection),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.error.is_some()
    }
}

/// Confidence is reported by the remote model; anything outside [0, 1]
/// (including NaN) is pulled back into range.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_envelope_parsing() {
        let ok: InferenceResponse = serde_json::from_str(
            r#"{"name":"Charizard","set":"Base Set","number":"4/102","confidence":0.97,"latency_ms":41.5}"#,
        )
        .unwrap();
        assert!(matches!(ok, InferenceResponse::Identified(ref r) if r.confidence == 0.97));

        let err: InferenceResponse =
            serde_json::from_str(r#"{"error_code":"bad_image","message":"unreadable"}"#).unwrap();
        assert!(matches!(err, InferenceResponse::Rejected(ref r) if r.error_code == "bad_image"));
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(clamp_confidence(1.4), 1.0);
        assert_eq!(clamp_confidence(-0.1), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(0.5), 0.5);
    }

    #[test]
    fn test_request_serialization() {
        let request = InferenceRequest {
            image: ImageRef::new("card-0001"),
            hint: None,
            mode: InferenceMode::Verify,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, serde_json::json!({"image": "card-0001", "mode": "verify"}));
    }

    #[test]
    fn test_empty_identity_is_none() {
        let response = IdentifyResponse {
            name: None,
            set: None,
            number: None,
            confidence: 0.2,
            latency_ms: None,
        };
        let result = InferenceResult::identified(InferenceStage::Primary, response, Duration::ZERO);
        assert!(result.identity.is_none());
        assert!(!result.is_rejected());
    }
}
