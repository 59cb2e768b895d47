use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::result::Result as StdResult;

#[derive(Clone, PartialEq, Debug)]
pub struct Response {
    pub id: u64,
    pub outcome: Outcome,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
}

#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct ErrorObject {
    pub message: String,
}

/// A complete frame that could not be turned into a `Response`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ParseFailure {
    /// No usable id; the frame cannot be matched to any call.
    Unattributable(String),
    /// The id is readable but the body is not a valid response for it.
    Malformed { id: u64, reason: String },
}

#[derive(Serialize)]
struct WireResponse<'a> {
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorObject>,
}

impl Response {
    pub fn result_of(id: u64, result: Value) -> Response {
        Response {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error_of(id: u64, message: &str) -> Response {
        Response {
            id,
            outcome: Outcome::Error(ErrorObject {
                message: message.to_string(),
            }),
        }
    }

    /// Parse one complete frame. A `null` error member is treated as absent, so peers
    /// that always emit both members (`"error": null` beside a result) are accepted.
    pub fn parse(bs: &[u8]) -> StdResult<Response, ParseFailure> {
        let value: Value = serde_json::from_slice(bs)
            .map_err(|e| ParseFailure::Unattributable(e.to_string()))?;
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(ParseFailure::Unattributable(format!(
                    "expected a JSON object, got {}",
                    other
                )))
            }
        };
        let id = fields
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ParseFailure::Unattributable("missing or non-integer id".into()))?;

        Response::outcome_from(&mut fields)
            .map(|outcome| Response { id, outcome })
            .map_err(|reason| ParseFailure::Malformed { id, reason })
    }

    fn outcome_from(fields: &mut Map<String, Value>) -> StdResult<Outcome, String> {
        let result = fields.remove("result");
        let error = fields.remove("error").filter(|e| !e.is_null());

        match (result, error) {
            (Some(result), Some(_)) if !result.is_null() => {
                Err("response carries both result and error".to_string())
            }
            (_, Some(error)) => serde_json::from_value::<ErrorObject>(error)
                .map(Outcome::Error)
                .map_err(|e| format!("invalid error object: {}", e)),
            (Some(result), None) => Ok(Outcome::Result(result)),
            (None, None) => Err("response carries neither result nor error".to_string()),
        }
    }

    pub fn to_bytes(&self) -> StdResult<Vec<u8>, serde_json::Error> {
        let (result, error) = match &self.outcome {
            Outcome::Result(value) => (Some(value), None),
            Outcome::Error(error) => (None, Some(error)),
        };
        serde_json::to_vec(&WireResponse {
            id: self.id,
            result,
            error,
        })
    }
}
