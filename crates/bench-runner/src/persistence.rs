//! Time-series persistence of benchmark timings in InfluxDB (1.x HTTP API).
//!
//! Contract: if the database cannot be reached or created, `store` returns
//! `PersistenceUnreachable` and nothing is written. Once it is reachable, each
//! point is written on its own; a rejected point is logged and counted in the
//! returned `StoreReport` but never aborts the remaining points.

use crate::error::RunnerError;
use bench_core::config::InfluxConfig;
use bench_core::{RunResult, NO_CONTENT_ID};
use chrono::Utc;
use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreReport {
    pub written: usize,
    pub failed: usize,
}

pub trait ResultSink: Send + Sync {
    fn store(&self, results: &[RunResult]) -> Result<StoreReport, RunnerError>;
}

pub struct InfluxStore {
    client: Client,
    base_url: String,
    database: String,
}

impl InfluxStore {
    pub fn new(config: &InfluxConfig) -> Result<Self, RunnerError> {
        Self::with_base_url(config.base_url(), &config.database)
    }

    pub fn with_base_url(base_url: impl Into<String>, database: &str) -> Result<Self, RunnerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RunnerError::Persistence(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            database: database.to_string(),
        })
    }

    fn database_names(&self) -> Result<Vec<String>, RunnerError> {
        let response = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[("q", "SHOW DATABASES")])
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| RunnerError::PersistenceUnreachable(e.to_string()))?;
        let body: Value = response
            .json()
            .map_err(|e| RunnerError::PersistenceUnreachable(e.to_string()))?;
        Ok(parse_database_names(&body))
    }

    /// Creates the target database if it does not exist yet.
    pub fn ensure_database(&self) -> Result<(), RunnerError> {
        let names = self.database_names()?;
        if names.iter().any(|n| n == &self.database) {
            return Ok(());
        }
        info!(database = %self.database, "creating influx database");
        self.client
            .post(format!("{}/query", self.base_url))
            .query(&[("q", format!("CREATE DATABASE \"{}\"", self.database))])
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| RunnerError::PersistenceUnreachable(e.to_string()))?;
        Ok(())
    }

    fn write_line(&self, line: &str) -> Result<(), RunnerError> {
        self.client
            .post(format!("{}/write", self.base_url))
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .body(line.to_string())
            .send()
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(|e| RunnerError::Persistence(e.to_string()))
    }
}

impl ResultSink for InfluxStore {
    fn store(&self, results: &[RunResult]) -> Result<StoreReport, RunnerError> {
        self.ensure_database()?;
        let now_ms = Utc::now().timestamp_millis();
        let mut report = StoreReport::default();
        for result in results {
            let line = line_protocol(result, now_ms);
            debug!(point = %line, "writing point");
            match self.write_line(&line) {
                Ok(()) => report.written += 1,
                Err(e) => {
                    error!(benchmark = %result.name, error = %e, "point write failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

fn parse_database_names(body: &Value) -> Vec<String> {
    body.pointer("/results/0/series/0/values")
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get(0).and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_field_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Renders one result as an InfluxDB line-protocol point with millisecond precision.
pub fn line_protocol(result: &RunResult, now_ms: i64) -> String {
    let mut line = escape_measurement(&result.name);
    let tags = [
        ("subTest", result.subtest.as_deref()),
        ("commit", result.meta.commit.as_deref()),
        ("project", result.meta.project.as_deref()),
        ("testClass", result.test_class.as_deref()),
        ("fileSet", result.file_set.as_deref()),
    ];
    for (key, value) in tags {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            line.push(',');
            line.push_str(key);
            line.push('=');
            line.push_str(&escape_tag(value));
        }
    }
    let content_id = result.meta.content_id.as_deref().unwrap_or(NO_CONTENT_ID);
    line.push_str(&format!(
        " duration={},contentId=\"{}\"",
        result.duration_millis(),
        escape_field_string(content_id)
    ));
    let timestamp = result.date.map(|d| d.timestamp_millis()).unwrap_or(now_ms);
    line.push_str(&format!(" {}", timestamp));
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::{BenchDuration, ResultMeta};
    use serde_json::json;
    use std::io::Read;
    use std::sync::mpsc;
    use std::thread;

    fn result(name: &str, millis: f64) -> RunResult {
        RunResult {
            name: name.to_string(),
            subtest: Some("empty repo".to_string()),
            file_set: Some("One4MBFile".to_string()),
            duration: BenchDuration::from_millis(millis),
            meta: ResultMeta {
                commit: Some("abc123".to_string()),
                project: Some("js-ipfs".to_string()),
                version: None,
                content_id: Some("QmRun".to_string()),
            },
            test_class: Some("smallfile".to_string()),
            date: None,
            warmup: None,
            description: None,
        }
    }

    type Seen = (String, String, String);

    fn fake_influx(responses: Vec<(u16, String)>) -> (String, mpsc::Receiver<Seen>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip addr");
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for (status, body) in responses {
                let Ok(mut request) = server.recv() else {
                    return;
                };
                let mut content = String::new();
                let _ = request.as_reader().read_to_string(&mut content);
                let _ = tx.send((
                    request.method().as_str().to_string(),
                    request.url().to_string(),
                    content,
                ));
                let _ = request
                    .respond(tiny_http::Response::from_string(body).with_status_code(status));
            }
        });
        (format!("http://{}", addr), rx)
    }

    #[test]
    fn line_protocol_escapes_tags_and_stamps_content_id() {
        let line = line_protocol(&result("unixFS extract", 1250.5), 1_700_000_000_000);
        assert_eq!(
            line,
            "unixFS\\ extract,subTest=empty\\ repo,commit=abc123,project=js-ipfs,testClass=smallfile,fileSet=One4MBFile duration=1250.5,contentId=\"QmRun\" 1700000000000"
        );
    }

    #[test]
    fn line_protocol_uses_sentinel_when_content_id_missing() {
        let mut r = result("plain", 10.0);
        r.meta.content_id = None;
        r.subtest = None;
        let line = line_protocol(&r, 5);
        assert!(line.contains("contentId=\"none\""), "{}", line);
        assert!(!line.contains("subTest"), "{}", line);
    }

    #[test]
    fn database_names_are_read_from_show_output() {
        let body = json!({"results": [{"statement_id": 0, "series": [{
            "name": "databases", "columns": ["name"],
            "values": [["_internal"], ["benchmarks"]]
        }]}]});
        assert_eq!(parse_database_names(&body), vec!["_internal", "benchmarks"]);
        assert!(parse_database_names(&json!({"results": [{}]})).is_empty());
    }

    #[test]
    fn store_creates_database_and_counts_rejected_points() {
        let show = json!({"results": [{"series": [{"values": [["_internal"]]}]}]}).to_string();
        let (url, seen) = fake_influx(vec![
            (200, show),
            (200, "{}".to_string()),
            (204, String::new()),
            (500, "boom".to_string()),
            (204, String::new()),
        ]);
        let store = InfluxStore::with_base_url(url, "benchmarks").expect("client");
        let report = store
            .store(&[result("a", 1.0), result("b", 2.0), result("c", 3.0)])
            .expect("reachable");
        assert_eq!(report, StoreReport { written: 2, failed: 1 });

        let requests: Vec<Seen> = seen.try_iter().collect();
        assert_eq!(requests.len(), 5);
        assert!(requests[0].1.contains("SHOW"), "{:?}", requests[0]);
        assert_eq!(requests[1].0, "POST");
        assert!(requests[1].1.contains("CREATE"), "{:?}", requests[1]);
        assert!(requests[2].1.starts_with("/write?db=benchmarks"), "{:?}", requests[2]);
        assert!(requests[2].2.starts_with("a,"), "{:?}", requests[2]);
        assert!(requests[4].2.starts_with("c,"), "{:?}", requests[4]);
    }

    #[test]
    fn existing_database_is_not_recreated() {
        let show =
            json!({"results": [{"series": [{"values": [["benchmarks"]]}]}]}).to_string();
        let (url, seen) = fake_influx(vec![(200, show), (204, String::new())]);
        let store = InfluxStore::with_base_url(url, "benchmarks").expect("client");
        let report = store.store(&[result("a", 1.0)]).expect("reachable");
        assert_eq!(report.written, 1);
        let requests: Vec<Seen> = seen.try_iter().collect();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].1.starts_with("/write"));
    }

    #[test]
    fn unreachable_endpoint_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let store =
            InfluxStore::with_base_url(format!("http://{}", addr), "benchmarks").expect("client");
        let err = store.store(&[result("a", 1.0)]).expect_err("nothing listening");
        assert!(matches!(err, RunnerError::PersistenceUnreachable(_)), "{}", err);
    }
}
