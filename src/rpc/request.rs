use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::TryFrom;
use std::result::Result as StdResult;

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub id: u64,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Vec<Value>) -> Request {
        Request {
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Serialize to a single compact JSON document. Compact output never contains a raw
    /// newline, so the result is safe to frame with a newline delimiter.
    pub fn to_bytes(&self) -> StdResult<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl TryFrom<Vec<u8>> for Request {
    type Error = serde_json::Error;
    fn try_from(bs: Vec<u8>) -> StdResult<Request, Self::Error> {
        serde_json::from_slice(&bs)
    }
}
