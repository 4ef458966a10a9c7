//! Client for the remote emissions database.
//!
//! Two endpoints: a health check and parameterized data retrieval. Every
//! call is a bounded HTTP GET — a non-success status or a timeout comes
//! back as an error value the caller can filter, never as a parsed table.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::table::DataTable;

/// Base URL of the hosted emissions database.
pub const DEFAULT_BASE_URL: &str = "https://data.emissionsdb.org/api/v1";

/// Network calls fail rather than hang past this bound.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Service status reported by the health endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Health {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Query parameters for the data endpoint.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// State (2-digit) or county (5-digit) FIPS code.
    geoid: String,
    /// Pollutant code, e.g. `98` for CO2-equivalent.
    pollutant: String,
    /// Aggregation level of the returned rows.
    level: String,
    sourcetype: Option<String>,
    regclass: Option<String>,
    fueltype: Option<String>,
    roadtype: Option<String>,
    /// Activity variables to request alongside emissions.
    vars: Vec<String>,
}

impl QueryOptions {
    /// New query for a geography and pollutant at the `overall` aggregation
    /// level, requesting the standard activity variables.
    pub fn new(geoid: &str, pollutant: &str) -> Self {
        Self {
            geoid: geoid.to_owned(),
            pollutant: pollutant.to_owned(),
            level: "overall".to_owned(),
            sourcetype: None,
            regclass: None,
            fueltype: None,
            roadtype: None,
            vars: ["vmt", "vehicles", "starts", "sourcehours"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_owned();
        self
    }

    #[must_use]
    pub fn with_sourcetype(mut self, sourcetype: &str) -> Self {
        self.sourcetype = Some(sourcetype.to_owned());
        self
    }

    #[must_use]
    pub fn with_regclass(mut self, regclass: &str) -> Self {
        self.regclass = Some(regclass.to_owned());
        self
    }

    #[must_use]
    pub fn with_fueltype(mut self, fueltype: &str) -> Self {
        self.fueltype = Some(fueltype.to_owned());
        self
    }

    #[must_use]
    pub fn with_roadtype(mut self, roadtype: &str) -> Self {
        self.roadtype = Some(roadtype.to_owned());
        self
    }

    #[must_use]
    pub fn with_vars(mut self, vars: Vec<String>) -> Self {
        self.vars = vars;
        self
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    /// Query-string pairs in a stable order.
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("geoid", self.geoid.clone()),
            ("pollutant", self.pollutant.clone()),
            ("level", self.level.clone()),
        ];
        for (key, value) in [
            ("sourcetype", &self.sourcetype),
            ("regclass", &self.regclass),
            ("fueltype", &self.fueltype),
            ("roadtype", &self.roadtype),
        ] {
            if let Some(value) = value {
                pairs.push((key, value.clone()));
            }
        }
        pairs.push(("vars", self.vars.join(",")));
        pairs
    }
}

/// HTTP client bound to one base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base: Url,
}

impl ApiClient {
    /// Client against [`DEFAULT_BASE_URL`].
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Client against a caller-provided base URL.
    pub fn with_base_url(base: &str) -> Result<Self> {
        let base = Url::parse(base).map_err(|e| {
            Error::configuration("query", format!("invalid base URL `{base}`: {e}"))
        })?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration("query", format!("building HTTP client: {e}")))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        // keep the base path when joining, `/api/v1` + `emissions`
        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| Error::configuration("query", format!("invalid endpoint `{joined}`: {e}")))
    }

    /// Check service status.
    pub async fn health(&self) -> Result<Health> {
        let url = self.endpoint("health")?;
        debug!(%url, "health check");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Network {
                url: url.to_string(),
                source: e,
            })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        response.json::<Health>().await.map_err(|e| Error::Network {
            url: url.to_string(),
            source: e,
        })
    }

    /// Retrieve emissions rows for `opts`, one row per stratum and year.
    pub async fn query(&self, opts: &QueryOptions) -> Result<DataTable> {
        let mut url = self.endpoint("emissions")?;
        for (key, value) in opts.query_pairs() {
            url.query_pairs_mut().append_pair(key, &value);
        }
        info!(%url, "querying emissions data");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Network {
                url: url.to_string(),
                source: e,
            })?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(|e| Error::Network {
            url: url.to_string(),
            source: e,
        })?;

        if !status.is_success() {
            return Err(Error::Api {
                url: url.to_string(),
                status: status.as_u16(),
                message: server_message(&content_type, &body),
            });
        }

        let table = parse_payload(&content_type, &body)?;
        // a requested variable the server did not return cannot be modeled
        for var in opts.vars() {
            if !table.contains(var) {
                return Err(Error::data(
                    "query",
                    format!("requested variable `{var}` missing from returned columns"),
                ));
            }
        }
        debug!(rows = table.n_rows(), cols = table.n_cols(), "query parsed");
        Ok(table)
    }
}

/// Parse a payload by content type: JSON row arrays, otherwise delimited
/// text.
fn parse_payload(content_type: &str, body: &str) -> Result<DataTable> {
    if content_type.contains("json") {
        let rows: Vec<Value> = serde_json::from_str(body)
            .map_err(|e| Error::data("parse", format!("decoding JSON payload: {e}")))?;
        DataTable::from_json_rows(&rows)
    } else {
        DataTable::from_csv_str(body)
    }
}

/// Pull a server-provided message out of an error body when there is one.
fn server_message(content_type: &str, body: &str) -> String {
    if content_type.contains("json") {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            for key in ["message", "error", "detail"] {
                if let Some(text) = value.get(key).and_then(Value::as_str) {
                    return text.to_string();
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "(no body)".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_are_stable_and_complete() {
        let opts = QueryOptions::new("26161", "98")
            .with_level("sourcetype")
            .with_fueltype("2")
            .with_vars(vec!["vmt".into(), "starts".into()]);
        let pairs = opts.query_pairs();
        assert_eq!(
            pairs,
            vec![
                ("geoid", "26161".to_string()),
                ("pollutant", "98".to_string()),
                ("level", "sourcetype".to_string()),
                ("fueltype", "2".to_string()),
                ("vars", "vmt,starts".to_string()),
            ]
        );
    }

    #[test]
    fn endpoints_extend_the_base_path() {
        let client = ApiClient::with_base_url("https://example.org/api/v1").unwrap();
        assert_eq!(
            client.endpoint("emissions").unwrap().as_str(),
            "https://example.org/api/v1/emissions"
        );
        assert_eq!(
            client.endpoint("health").unwrap().as_str(),
            "https://example.org/api/v1/health"
        );
    }

    #[test]
    fn payloads_parse_by_content_type() {
        let csv = parse_payload("text/csv", "year,vmt\n2015,100\n").unwrap();
        assert_eq!(csv.numeric("vmt").unwrap(), &[100.0]);

        let json = parse_payload(
            "application/json; charset=utf-8",
            r#"[{"year": 2015, "vmt": 100.0}]"#,
        )
        .unwrap();
        assert_eq!(json.numeric("vmt").unwrap(), &[100.0]);

        assert!(parse_payload("application/json", "not json").is_err());
    }

    #[test]
    fn server_messages_prefer_json_fields() {
        assert_eq!(
            server_message("application/json", r#"{"message": "no such county"}"#),
            "no such county"
        );
        assert_eq!(server_message("text/plain", "  gateway timeout  "), "gateway timeout");
        assert_eq!(server_message("text/plain", ""), "(no body)");
    }

    /// Manual check against the live service; needs network access.
    #[test]
    #[ignore]
    fn manual_health_check() {
        let client = ApiClient::new().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let health = runtime.block_on(client.health()).unwrap();
        println!("service status: {:?}", health);
        assert_eq!(health.status, "ok");
    }
}
