use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use super::{api_error, parse_doc_id};
use crate::auth::Principal;
use crate::models::{DocumentContentResponse, ErrorResponse, ValidationError};
use crate::AppState;

#[derive(Deserialize)]
pub struct OutputFormatQuery {
    format: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Binary,
    Both,
}

impl OutputFormat {
    fn from_query(format: Option<&str>) -> Result<Self, ValidationError> {
        match format.map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(OutputFormat::Json),
            Some(value) => match value.to_lowercase().as_str() {
                "json" => Ok(OutputFormat::Json),
                "binary" => Ok(OutputFormat::Binary),
                "both" => Ok(OutputFormat::Both),
                other => Err(ValidationError::new(
                    "format",
                    format!("Invalid output format '{}'. Use 'json', 'binary', or 'both'.", other),
                )),
            },
        }
    }

    fn include_json(self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Both)
    }

    fn include_binary(self) -> bool {
        matches!(self, OutputFormat::Binary | OutputFormat::Both)
    }
}

/// Current content of a document
pub async fn doc_content(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
    Query(query): Query<OutputFormatQuery>,
) -> Result<(StatusCode, Json<DocumentContentResponse>), (StatusCode, Json<ErrorResponse>)> {
    let output_format = OutputFormat::from_query(query.format.as_deref()).map_err(|e| api_error(e.into()))?;
    let doc_id = parse_doc_id(&doc_id)?;

    let content = state.documents.content(&principal, doc_id).await.map_err(api_error)?;

    Ok((
        StatusCode::OK,
        Json(DocumentContentResponse {
            json: output_format.include_json().then_some(content.json),
            binary: output_format
                .include_binary()
                .then(|| general_purpose::STANDARD.encode(&content.snapshot)),
            kind: content.kind,
            live: content.live,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(OutputFormat::from_query(None).unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_query(Some(" Both ")).unwrap(), OutputFormat::Both);
        assert!(OutputFormat::Binary.include_binary() && !OutputFormat::Binary.include_json());
        assert_eq!(OutputFormat::from_query(Some("xml")).unwrap_err().field, "format");
    }
}
