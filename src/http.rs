//! pprof-compatible HTTP handler bodies.
//!
//! The profiler does not run a server; embedders mount these handlers
//! on whatever HTTP stack they use. The functions here produce
//! `http::Response` values with the header conventions pprof tooling
//! relies on: profiles are served as an octet-stream attachment named
//! "profile", errors as plain text with the `X-Go-Pprof` marker and no
//! content disposition.

use std::time::Duration;

use crossbeam_channel::{after, never, select, Receiver};
use http::{header, Request, Response, StatusCode};
use log::warn;

use crate::export::{encode_profile, proto};
use crate::profiling::{CpuProfiler, MemoryProfiler};
use crate::symbolization::Symbolizer;
use std::sync::Arc;

const DEFAULT_PROFILE_DURATION: Duration = Duration::from_secs(30);

/// Serialize a profile into a download response.
pub fn serve_profile(profile: &proto::Profile) -> Response<Vec<u8>> {
    match encode_profile(profile) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("X-Content-Type-Options", "nosniff")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_DISPOSITION, r#"attachment; filename="profile""#)
            .body(body)
            .expect("static response"),
        Err(err) => serve_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

/// Plain-text error response, following the net/http/pprof header
/// conventions.
pub fn serve_error(status: StatusCode, message: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("X-Content-Type-Options", "nosniff")
        .header("X-Go-Pprof", "1")
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(format!("{message}\n").into_bytes())
        .expect("static response")
}

/// Value of the `seconds` query parameter, when present and positive.
pub fn seconds_param<B>(req: &Request<B>) -> Option<u64> {
    let query = req.uri().query()?;
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else { continue };
        if key == "seconds" {
            return value.parse::<u64>().ok().filter(|&n| n > 0);
        }
    }
    None
}

/// Runs a CPU profile for the requested duration and serves the result.
///
/// The handler blocks its thread for the duration of the profile, the
/// same contract as net/http/pprof's `/debug/pprof/profile`. A cancel
/// channel cuts the run short and serves whatever was captured.
pub struct CpuProfileHandler {
    profiler: CpuProfiler,
    sample_rate: f64,
    symbols: Arc<dyn Symbolizer>,
    /// The serving stack's write deadline, when it has one. Requests
    /// for a longer profile fail fast with a 400.
    write_timeout: Option<Duration>,
    cancel: Receiver<()>,
}

impl CpuProfileHandler {
    pub fn new(profiler: CpuProfiler, sample_rate: f64, symbols: Arc<dyn Symbolizer>) -> Self {
        CpuProfileHandler {
            profiler,
            sample_rate,
            symbols,
            write_timeout: None,
            cancel: never(),
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Install a channel whose messages (or disconnection) stop an
    /// in-flight profile early.
    pub fn with_cancel(mut self, cancel: Receiver<()>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn handle<B>(&self, req: &Request<B>) -> Response<Vec<u8>> {
        let duration = seconds_param(req)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PROFILE_DURATION);

        if let Some(timeout) = self.write_timeout {
            if duration > timeout {
                return serve_error(
                    StatusCode::BAD_REQUEST,
                    "profile duration exceeds server's WriteTimeout",
                );
            }
        }

        if self.profiler.start().is_err() {
            return serve_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not enable CPU profiling: profiler already running",
            );
        }

        select! {
            recv(after(duration)) -> _ => {},
            recv(self.cancel) -> _ => {
                warn!("pprof: CPU profile interrupted before its deadline");
            },
        }

        match self.profiler.stop(self.sample_rate, self.symbols.as_ref()) {
            Some(profile) => serve_profile(&profile),
            None => serve_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "CPU profiler produced no profile",
            ),
        }
    }
}

/// Serves a snapshot of the memory profile, for both the `allocs` and
/// `heap` endpoints.
pub struct HeapProfileHandler {
    profiler: MemoryProfiler,
    sample_rate: f64,
    symbols: Arc<dyn Symbolizer>,
}

impl HeapProfileHandler {
    pub fn new(profiler: MemoryProfiler, sample_rate: f64, symbols: Arc<dyn Symbolizer>) -> Self {
        HeapProfileHandler { profiler, sample_rate, symbols }
    }

    pub fn handle<B>(&self, _req: &Request<B>) -> Response<Vec<u8>> {
        let profile = self.profiler.snapshot(self.sample_rate, self.symbols.as_ref());
        serve_profile(&profile)
    }
}

/// One row of the pprof index page.
pub struct ProfileEntry<'a> {
    pub name: &'a str,
    pub description: &'a str,
}

/// The `/debug/pprof/` index: an HTML listing of available profiles.
pub fn index_response(entries: &[ProfileEntry<'_>]) -> Response<Vec<u8>> {
    let mut body = String::from(
        "<html>\n<head><title>/debug/pprof</title></head>\n<body>\n/debug/pprof<br>\n\
         <p>Profiles of the wasm guest:</p>\n<table>\n",
    );
    for entry in entries {
        body.push_str(&format!(
            "<tr><td><a href='{0}'>{0}</a></td><td>{1}</td></tr>\n",
            html_escape(entry.name),
            html_escape(entry.description),
        ));
    }
    body.push_str("</table>\n</body>\n</html>\n");

    Response::builder()
        .status(StatusCode::OK)
        .header("X-Content-Type-Options", "nosniff")
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(body.into_bytes())
        .expect("static response")
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolization::NullSymbolizer;
    use crate::unwind::StackSource;

    fn request(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn seconds_parameter_parsing() {
        assert_eq!(seconds_param(&request("/debug/pprof/profile?seconds=5")), Some(5));
        assert_eq!(seconds_param(&request("/debug/pprof/profile?x=1&seconds=30")), Some(30));
        assert_eq!(seconds_param(&request("/debug/pprof/profile")), None);
        assert_eq!(seconds_param(&request("/debug/pprof/profile?seconds=0")), None);
        assert_eq!(seconds_param(&request("/debug/pprof/profile?seconds=abc")), None);
    }

    #[test]
    fn profile_longer_than_write_timeout_fails_fast() {
        let cpu = CpuProfiler::new(Arc::new(StackSource::Wasm), "test.wasm");
        let handler = CpuProfileHandler::new(cpu, 1.0, Arc::new(NullSymbolizer))
            .with_write_timeout(Duration::from_secs(1));

        let resp = handler.handle(&request("/debug/pprof/profile?seconds=10"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get("X-Go-Pprof").unwrap(), "1");
        assert!(resp.headers().get(header::CONTENT_DISPOSITION).is_none());
    }

    #[test]
    fn cancelled_profile_still_serves_a_result() {
        let cpu = CpuProfiler::new(Arc::new(StackSource::Wasm), "test.wasm");
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handler = CpuProfileHandler::new(cpu, 1.0, Arc::new(NullSymbolizer)).with_cancel(rx);
        tx.send(()).unwrap();

        let resp = handler.handle(&request("/debug/pprof/profile?seconds=60"));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            r#"attachment; filename="profile""#
        );
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
    }

    #[test]
    fn heap_snapshot_serves_immediately() {
        let mem = MemoryProfiler::new(Arc::new(StackSource::Wasm), "test.wasm");
        let handler = HeapProfileHandler::new(mem, 1.0, Arc::new(NullSymbolizer));
        let resp = handler.handle(&request("/debug/pprof/allocs"));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("X-Content-Type-Options").unwrap(),
            "nosniff"
        );
    }

    #[test]
    fn index_lists_profiles() {
        let resp = index_response(&[
            ProfileEntry { name: "profile", description: "CPU time" },
            ProfileEntry { name: "allocs", description: "allocations" },
        ]);
        let body = String::from_utf8(resp.body().clone()).unwrap();
        assert!(body.contains("href='profile'"));
        assert!(body.contains("allocs"));
    }
}
