use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::JobStatus;
use crate::models::search::{JobStatusResponse, ListQuery, SearchRequest, SearchResponse};
use crate::services::submission::SubmitError;

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn submit_status(error: &SubmitError) -> StatusCode {
    match error {
        SubmitError::Invalid(_) | SubmitError::EmptyUpload => StatusCode::BAD_REQUEST,
        SubmitError::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        SubmitError::Undecodable(_) | SubmitError::NoFace => StatusCode::UNPROCESSABLE_ENTITY,
        SubmitError::Detector(_) => StatusCode::BAD_GATEWAY,
        SubmitError::Storage(_) | SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /api/v1/searches: Upload a query face and start a search.
pub async fn submit_search(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SearchResponse>), ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut request = SearchRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;
                image = Some(data.to_vec());
            }
            Some("identity") => {
                let identity = field
                    .text()
                    .await
                    .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;
                let identity = identity.trim();
                request.identity = (!identity.is_empty()).then(|| identity.to_string());
            }
            _ => {}
        }
    }

    let image = image.unwrap_or_default();
    let job = state
        .submissions
        .submit(&image, request)
        .await
        .map_err(|e| {
            let status = submit_status(&e);
            if status.is_server_error() {
                tracing::error!(error = %e, "Search submission failed");
            }
            api_error(status, e.to_string())
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SearchResponse {
            job_id: job.id,
            status: job.status.to_string(),
            message: "Face submitted for search".to_string(),
        }),
    ))
}

/// GET /api/v1/searches/{job_id}: Check search job status and results.
pub async fn get_search(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.store.get(job_id).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load job")
    })?;

    job.map(|job| Json(job.into()))
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Job {job_id} not found")))
}

/// GET /api/v1/searches?status=pending&limit=20: List jobs by status, oldest first.
pub async fn list_searches(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobStatusResponse>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => JobStatus::from_str(raw)
            .map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("Unknown status '{raw}'")))?,
        None => JobStatus::Pending,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let jobs = state.store.list_by_status(status, limit).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to list jobs");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list jobs")
    })?;

    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::detector::DetectError;

    #[test]
    fn rejections_are_client_errors() {
        assert_eq!(submit_status(&SubmitError::EmptyUpload), StatusCode::BAD_REQUEST);
        assert_eq!(
            submit_status(&SubmitError::UnsupportedFormat),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(submit_status(&SubmitError::NoFace), StatusCode::UNPROCESSABLE_ENTITY);
        let undecodable = SubmitError::Undecodable(DetectError::Decode(
            image::load_from_memory(b"nope").unwrap_err(),
        ));
        assert!(submit_status(&undecodable).is_client_error());
    }

    #[tokio::test]
    async fn detector_outage_is_a_server_error() {
        let unreachable = reqwest::Client::new()
            .get("http://127.0.0.1:1/locate")
            .send()
            .await
            .unwrap_err();
        let outage = SubmitError::Detector(DetectError::Locator(unreachable));

        assert_eq!(submit_status(&outage), StatusCode::BAD_GATEWAY);
        assert!(submit_status(&outage).is_server_error());
        assert!(outage.to_string().starts_with("Face detection is unavailable"));
    }
}
