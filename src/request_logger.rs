//! Per-request telemetry with severity routed by outcome.
//!
//! The agent endpoints wrap mail, database, and LLM round-trips, so a slow
//! response there is a signal worth surfacing, not just a timing line.

use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::{Duration, Instant};

/// Agent pipeline calls slower than this are logged at warn level.
const SLOW_AGENT_CALL: Duration = Duration::from_secs(2);

pub struct RequestLog;

#[rocket::async_trait]
impl Fairing for RequestLog {
    fn info(&self) -> Info {
        Info {
            name: "Request Log",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(|| Instant::now());
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let started = request.local_cache(|| Instant::now());
        let elapsed = started.elapsed();
        let status = response.status().code;
        let path = request.uri().path();
        let is_agent_call = path.starts_with("/agent");

        let level = if status >= 500 {
            log::Level::Error
        } else if status >= 400 || (is_agent_call && elapsed > SLOW_AGENT_CALL) {
            log::Level::Warn
        } else {
            log::Level::Info
        };

        let slow_tag = if is_agent_call && elapsed > SLOW_AGENT_CALL {
            " [slow agent call]"
        } else {
            ""
        };

        log::log!(
            level,
            "{} {} -> {} ({:.2}ms){}",
            request.method(),
            request.uri(),
            status,
            elapsed.as_secs_f64() * 1000.0,
            slow_tag
        );
    }
}
