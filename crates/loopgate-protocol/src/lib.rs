use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// RFC7807-style error payload used at service edges.
///
/// Only genuine failures travel in this shape. Expected business outcomes
/// (guardrail block, claim rejection) are ordinary 200 responses.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ProblemCode>,
}

/// Machine-readable failure class carried in [`ProblemDetails::code`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProblemCode {
    Validation,
    NotFound,
    Store,
    CompensationFailed,
    Internal,
}

impl ProblemDetails {
    pub fn new(status: u16, title: impl Into<String>) -> Self {
        Self {
            r#type: "about:blank".into(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
            code: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_code(mut self, code: ProblemCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(400, "Bad Request")
            .with_detail(detail)
            .with_code(ProblemCode::Validation)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(404, "Not Found")
            .with_detail(detail)
            .with_code(ProblemCode::NotFound)
    }

    pub fn store(detail: impl Into<String>) -> Self {
        Self::new(500, "Error")
            .with_detail(detail)
            .with_code(ProblemCode::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn problem_serializes_without_empty_fields() {
        let problem = ProblemDetails::validation("loop_id must not be empty");
        let value = serde_json::to_value(&problem).expect("problem json");
        assert_eq!(
            value,
            json!({
                "type": "about:blank",
                "title": "Bad Request",
                "status": 400,
                "detail": "loop_id must not be empty",
                "code": "validation"
            })
        );
    }
}
