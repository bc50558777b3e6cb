//! Request guards for the agent endpoints.

use rocket::Request;
use rocket::State;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket_okapi::request::OpenApiFromRequest;

use crate::config::AppConfig;
use crate::error::ApiError;

/// Header carrying the shared poller secret.
pub const CRON_SECRET_HEADER: &str = "X-CRON-SECRET";

/// Guard for cron-triggered endpoints: the `X-CRON-SECRET` header must equal
/// the configured secret, and the poller must be enabled.
#[derive(Debug, OpenApiFromRequest)]
pub struct CronAuth;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CronAuth {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = match request.guard::<&State<AppConfig>>().await {
            Outcome::Success(config) => config,
            _ => {
                return Outcome::Error((
                    Status::InternalServerError,
                    ApiError::InternalError("configuration missing from state".into()),
                ));
            }
        };

        if !config.cron_enabled {
            return Outcome::Error((
                Status::Forbidden,
                ApiError::Forbidden("poller is disabled".into()),
            ));
        }

        let provided = request.headers().get_one(CRON_SECRET_HEADER).unwrap_or("");
        if config.cron_secret.is_empty() || provided != config.cron_secret {
            return Outcome::Error((
                Status::Unauthorized,
                ApiError::Unauthorized("missing or invalid cron secret".into()),
            ));
        }

        Outcome::Success(CronAuth)
    }
}

/// Forward-only guard that matches requests asking for an SSE response.
#[derive(Debug, OpenApiFromRequest)]
pub struct WantsEventStream;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WantsEventStream {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let accepts_sse = request
            .headers()
            .get_one("Accept")
            .map(|accept| accept.contains("text/event-stream"))
            .unwrap_or(false);
        if accepts_sse {
            Outcome::Success(WantsEventStream)
        } else {
            Outcome::Forward(Status::NotFound)
        }
    }
}
