//! File-backed stub mappings.
//!
//! A stub location holds `mappings/` (YAML or JSON files, each with a
//! `stubs:` list) and `__files/` (bodies referenced by `type: file`).
//! Mappings are translated into `wiremock` mocks; matching is left to
//! `wiremock`.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use wiremock::matchers::{
    any, body_json, body_partial_json, body_string, body_string_contains, header, header_exists,
    header_regex, method, path, path_regex, query_param, query_param_is_missing,
};
use wiremock::{Mock, ResponseTemplate};

/// Directory holding mapping files, relative to the stub root.
pub const MAPPINGS_DIR: &str = "mappings";

/// Directory holding body files, relative to the stub root.
pub const FILES_DIR: &str = "__files";

/// One mapping file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StubFile {
    /// Stubs defined in the file
    #[serde(default)]
    pub stubs: Vec<StubMapping>,
}

/// A single stub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubMapping {
    /// Unique identifier for this stub
    pub id: String,

    /// Request pattern
    #[serde(default)]
    pub request: RequestPattern,

    /// Response to return
    pub response: ResponseDefinition,

    /// Priority (1 = matched first)
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Whether this stub is mounted
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of times this stub can be matched (0 = unlimited)
    #[serde(default)]
    pub max_matches: u64,

    /// Response delay in milliseconds, overriding the server-wide delay
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u8 {
    5
}

/// Request matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RequestPattern {
    /// HTTP method (absent = any)
    #[serde(default)]
    pub method: Option<String>,

    /// Path matching
    #[serde(default)]
    pub path: Option<PathPattern>,

    /// Query parameter matching
    #[serde(default)]
    pub query: BTreeMap<String, QueryPattern>,

    /// Header matching
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderPattern>,

    /// Body matching
    #[serde(default)]
    pub body: Option<BodyPattern>,
}

/// Path matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathPattern {
    /// Exact path match
    Exact { value: String },
    /// Path prefix match
    Prefix { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Path with parameters (e.g., /users/{id})
    Template { template: String },
}

impl PathPattern {
    /// Regex equivalent of the pattern, `None` for exact paths.
    pub fn to_regex(&self) -> Option<String> {
        match self {
            PathPattern::Exact { .. } => None,
            PathPattern::Prefix { value } => Some(format!("^{}", regex::escape(value))),
            PathPattern::Regex { pattern } => Some(pattern.clone()),
            PathPattern::Template { template } => Some(template_regex(template)),
        }
    }
}

/// `/users/{id}/orders` → `^/users/[^/]+/orders$`
fn template_regex(template: &str) -> String {
    let mut out = String::from("^");
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        out.push_str(&regex::escape(&rest[..open]));
        out.push_str("[^/]+");
        rest = &rest[open + close + 1..];
    }
    out.push_str(&regex::escape(rest));
    out.push('$');
    out
}

/// Query parameter matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryPattern {
    /// Exact value match
    Exact { value: String },
    /// Parameter must be absent
    Absent,
}

/// Header matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderPattern {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
}

/// Body matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyPattern {
    /// Exact body match
    Exact { value: String },
    /// Body must contain substring
    Contains { value: String },
    /// Body must equal this JSON document
    Json { content: serde_json::Value },
    /// Body must contain this JSON fragment
    PartialJson { content: serde_json::Value },
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,
}

fn default_status() -> u16 {
    200
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// File under `__files/`
    File { path: String },
}

impl ResponseBody {
    /// Body content as bytes. File bodies are read relative to `files_root`.
    pub fn to_bytes(&self, files_root: Option<&Path>) -> Result<Vec<u8>, String> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => serde_json::to_vec(content).map_err(|e| e.to_string()),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| format!("invalid base64: {}", e))
            }
            ResponseBody::File { path } => {
                let root = files_root
                    .ok_or_else(|| format!("body file {} needs a stub location", path))?;
                let full = root.join(path);
                std::fs::read(&full).map_err(|e| format!("failed to read {}: {}", full.display(), e))
            }
        }
    }

    /// Content type implied by the body kind.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } => "application/octet-stream",
            ResponseBody::File { path } if path.ends_with(".json") => "application/json",
            ResponseBody::File { .. } => "application/octet-stream",
        }
    }
}

impl StubMapping {
    /// Validate the stub.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("stub id cannot be empty".to_string());
        }
        if self.priority == 0 {
            return Err(format!("stub {}: priority must be between 1 and 255", self.id));
        }
        if !(100..=599).contains(&self.response.status) {
            return Err(format!("stub {}: invalid status code {}", self.id, self.response.status));
        }
        if let Some(pattern) = self.request.path.as_ref().and_then(PathPattern::to_regex) {
            regex::Regex::new(&pattern)
                .map_err(|e| format!("stub {}: invalid path regex: {}", self.id, e))?;
        }
        if let Some(m) = &self.request.method {
            http::Method::from_bytes(m.to_uppercase().as_bytes())
                .map_err(|_| format!("stub {}: invalid method {:?}", self.id, m))?;
        }
        for (name, pattern) in &self.request.headers {
            self.check_header_name(name)?;
            match pattern {
                HeaderPattern::Exact { value } => self.check_header_value(name, value)?,
                HeaderPattern::Regex { pattern } => {
                    regex::Regex::new(pattern).map_err(|e| {
                        format!("stub {}: invalid regex for header {}: {}", self.id, name, e)
                    })?;
                }
                HeaderPattern::Present => {}
            }
        }
        for (name, value) in &self.response.headers {
            self.check_header_name(name)?;
            self.check_header_value(name, value)?;
        }
        Ok(())
    }

    fn check_header_name(&self, name: &str) -> Result<(), String> {
        http::HeaderName::from_bytes(name.as_bytes())
            .map(|_| ())
            .map_err(|_| format!("stub {}: invalid header name {:?}", self.id, name))
    }

    fn check_header_value(&self, name: &str, value: &str) -> Result<(), String> {
        http::HeaderValue::from_str(value)
            .map(|_| ())
            .map_err(|_| format!("stub {}: invalid value for header {}", self.id, name))
    }

    /// Translate into a `wiremock` mock.
    ///
    /// `default_delay` applies when the stub has no delay of its own.
    pub fn to_mock(
        &self,
        files_root: Option<&Path>,
        default_delay: Option<Duration>,
    ) -> Result<Mock, String> {
        let request = &self.request;
        let mut builder = Mock::given(any());

        if let Some(m) = &request.method {
            builder = builder.and(method(m.to_uppercase()));
        }
        match &request.path {
            Some(PathPattern::Exact { value }) => builder = builder.and(path(value.as_str())),
            Some(pattern) => {
                if let Some(regex) = pattern.to_regex() {
                    builder = builder.and(path_regex(regex));
                }
            }
            None => {}
        }
        for (name, pattern) in &request.query {
            builder = match pattern {
                QueryPattern::Exact { value } => builder.and(query_param(name.as_str(), value.as_str())),
                QueryPattern::Absent => builder.and(query_param_is_missing(name.as_str())),
            };
        }
        for (name, pattern) in &request.headers {
            builder = match pattern {
                HeaderPattern::Exact { value } => builder.and(header(name.as_str(), value.as_str())),
                HeaderPattern::Regex { pattern } => builder.and(header_regex(name.as_str(), pattern)),
                HeaderPattern::Present => builder.and(header_exists(name.as_str())),
            };
        }
        if let Some(body) = &request.body {
            builder = match body {
                BodyPattern::Exact { value } => builder.and(body_string(value.as_str())),
                BodyPattern::Contains { value } => builder.and(body_string_contains(value.as_str())),
                BodyPattern::Json { content } => builder.and(body_json(content)),
                BodyPattern::PartialJson { content } => builder.and(body_partial_json(content)),
            };
        }

        let mut mock = builder
            .respond_with(self.response_template(files_root, default_delay)?)
            .with_priority(self.priority)
            .named(self.id.as_str());
        if self.max_matches > 0 {
            mock = mock.up_to_n_times(self.max_matches);
        }
        Ok(mock)
    }

    fn response_template(
        &self,
        files_root: Option<&Path>,
        default_delay: Option<Duration>,
    ) -> Result<ResponseTemplate, String> {
        let response = &self.response;
        let mut template = ResponseTemplate::new(response.status);

        let explicit_type = response
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str());

        if let Some(body) = &response.body {
            let bytes = body
                .to_bytes(files_root)
                .map_err(|e| format!("stub {}: {}", self.id, e))?;
            template = template.set_body_raw(bytes, explicit_type.unwrap_or(body.content_type()));
        }
        for (name, value) in &response.headers {
            if !name.eq_ignore_ascii_case("content-type") {
                template = template.insert_header(name.as_str(), value.as_str());
            }
        }

        let delay = self.delay_ms.map(Duration::from_millis).or(default_delay);
        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            template = template.set_delay(delay);
        }
        Ok(template)
    }
}

/// Read every mapping file under `<root>/mappings`, in file-name order.
///
/// A missing mappings directory yields no stubs.
pub fn load_mappings(root: &Path) -> Result<Vec<(PathBuf, StubMapping)>, ConfigurationError> {
    let dir = root.join(MAPPINGS_DIR);
    if !dir.is_dir() {
        debug!(path = %dir.display(), "No stub mappings directory");
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(&dir).map_err(|source| ConfigurationError::Io {
        path: dir.clone(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigurationError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        let is_mapping = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "yaml" | "yml" | "json"));
        if is_mapping && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut mappings = Vec::new();
    for file in files {
        let content = std::fs::read_to_string(&file).map_err(|source| ConfigurationError::Io {
            path: file.clone(),
            source,
        })?;
        let parsed: StubFile =
            serde_yaml::from_str(&content).map_err(|source| ConfigurationError::Parse {
                path: file.clone(),
                source,
            })?;
        for stub in parsed.stubs {
            stub.validate().map_err(|reason| ConfigurationError::InvalidStub {
                path: file.clone(),
                reason,
            })?;
            mappings.push((file.clone(), stub));
        }
    }
    Ok(mappings)
}

/// Load and translate every enabled stub under `root`.
///
/// Returns `(stub id, mock)` pairs in file-name order.
pub fn load_mocks(
    root: &Path,
    default_delay: Option<Duration>,
) -> Result<Vec<(String, Mock)>, ConfigurationError> {
    let files_root = root.join(FILES_DIR);
    let mut mocks = Vec::new();
    for (file, stub) in load_mappings(root)? {
        if !stub.enabled {
            debug!(stub_id = %stub.id, "Skipping disabled stub");
            continue;
        }
        let mock = stub
            .to_mock(Some(&files_root), default_delay)
            .map_err(|reason| ConfigurationError::InvalidStub { path: file, reason })?;
        mocks.push((stub.id, mock));
    }
    Ok(mocks)
}
