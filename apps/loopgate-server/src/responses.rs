use axum::extract::rejection::JsonRejection;
use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use loopgate_kernel::ClaimError;
use loopgate_protocol::{ProblemCode, ProblemDetails};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn json_ok<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

pub fn problem(p: ProblemDetails) -> Response {
    let status = StatusCode::from_u16(p.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(p)).into_response()
}

pub fn validation(detail: impl std::fmt::Display) -> Response {
    problem(ProblemDetails::validation(detail.to_string()))
}

pub fn not_found(detail: impl Into<String>) -> Response {
    problem(ProblemDetails::not_found(detail))
}

/// 500 for a store or worker failure. Logged here so handlers stay terse.
pub fn store_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "store failure");
    problem(ProblemDetails::store(err.to_string()))
}

pub fn claim_error(err: ClaimError) -> Response {
    match err {
        ClaimError::NotFound(id) => not_found(format!("task {id} not found")),
        ClaimError::CompensationFailed { .. } => {
            tracing::error!(error = %err, "claim left store inconsistent");
            problem(
                ProblemDetails::new(500, "Error")
                    .with_detail(err.to_string())
                    .with_code(ProblemCode::CompensationFailed),
            )
        }
        other => store_error(other),
    }
}

/// Unwrap a JSON body, turning extractor rejections into 400 problems.
pub fn body<T>(res: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    res.map(|Json(v)| v).map_err(|rej| validation(rej.body_text()))
}

/// Parse an optional JSON body; an empty body yields `T::default()`.
pub fn optional_body<T: DeserializeOwned + Default>(raw: &[u8]) -> Result<T, Response> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(raw).map_err(|e| validation(format!("invalid JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Default, Debug, PartialEq)]
    struct Body {
        #[serde(default)]
        n: u32,
    }

    #[test]
    fn empty_body_defaults() {
        assert_eq!(optional_body::<Body>(b"").ok(), Some(Body::default()));
        assert_eq!(optional_body::<Body>(b"  \n").ok(), Some(Body::default()));
        assert_eq!(optional_body::<Body>(br#"{"n":3}"#).ok(), Some(Body { n: 3 }));
        let err = optional_body::<Body>(b"{oops").err().expect("rejected");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn claim_errors_map_to_status() {
        assert_eq!(
            claim_error(ClaimError::NotFound("t-1".into())).status(),
            StatusCode::NOT_FOUND
        );
        let err = ClaimError::CompensationFailed {
            step: loopgate_kernel::ClaimStep::Assign,
            message: "disk".into(),
            compensation: "disk".into(),
        };
        assert_eq!(claim_error(err).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
