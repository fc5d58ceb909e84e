//! Scripted fakes for the provider and decoder boundaries.
//!
//! [`ScriptedProvider`] answers each call with the next queued [`Step`] and
//! serves the requested variable id as the file content. [`ScriptedDecoder`]
//! reads that content back and hands out the field registered for it, so a
//! test can drive acquisition, decoding and encoding without network access
//! or real GRIB2 files.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use ingestion::{
    DecodeError, DecodedField, FieldDecoder, Provider, ProviderPayload, ProviderRequest,
    UpstreamError,
};

/// What a [`ScriptedProvider`] does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return every requested field.
    Serve,
    /// Fail with this HTTP status (404 and 416 read as not ready).
    Status(u16),
    /// Fail with a timeout.
    Timeout,
    /// Fail with an invalid configuration, which is never retried.
    Fatal,
    /// Sleep before serving; used to trip the per-provider timeout.
    Hang(Duration),
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    pub run: String,
    pub forecast_hour: u32,
    pub var_ids: Vec<String>,
}

pub struct ScriptedProvider {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    otherwise: Step,
    missing: HashSet<String>,
    full_file: bool,
    calls: Mutex<Vec<ProviderCall>>,
}

impl ScriptedProvider {
    /// Serves every call.
    pub fn serving(name: &str) -> Self {
        Self::new(name, Vec::new(), Step::Serve)
    }

    /// Runs `steps` in order, then repeats `otherwise`.
    pub fn new(name: &str, steps: Vec<Step>, otherwise: Step) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            otherwise,
            missing: HashSet::new(),
            full_file: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Leave `var_id` out of every served payload.
    pub fn without_field(mut self, var_id: &str) -> Self {
        self.missing.insert(var_id.to_string());
        self
    }

    /// Report payloads as whole files rather than byte ranges.
    pub fn full_file(mut self) -> Self {
        self.full_file = true;
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone())
    }

    fn url(&self, request: &ProviderRequest) -> String {
        format!(
            "scripted://{}/{}/{}/f{:03}",
            self.name, request.model, request.run, request.forecast_hour
        )
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, request: &ProviderRequest) -> Result<ProviderPayload, UpstreamError> {
        self.calls.lock().unwrap().push(ProviderCall {
            run: request.run.to_string(),
            forecast_hour: request.forecast_hour,
            var_ids: request.terms.iter().map(|t| t.var_id.clone()).collect(),
        });

        match self.next_step() {
            Step::Serve => {}
            Step::Hang(delay) => tokio::time::sleep(delay).await,
            Step::Status(status) => {
                return Err(UpstreamError::HttpStatus {
                    status,
                    url: self.url(request),
                })
            }
            Step::Timeout => return Err(UpstreamError::Timeout { url: self.url(request) }),
            Step::Fatal => {
                return Err(UpstreamError::Config(format!(
                    "{} rejected the request",
                    self.name
                )))
            }
        }

        let fields = request
            .terms
            .iter()
            .filter(|t| !self.missing.contains(&t.var_id))
            .map(|t| (t.var_id.clone(), Bytes::from(t.var_id.clone())))
            .collect();
        Ok(ProviderPayload {
            fields,
            is_full_file: self.full_file,
        })
    }
}

/// Decodes files written by [`ScriptedProvider`]: the file content is the
/// variable id, looked up in the registered fields.
#[derive(Default)]
pub struct ScriptedDecoder {
    fields: HashMap<String, DecodedField>,
    strict: HashMap<String, Vec<String>>,
    calls: Mutex<Vec<BTreeMap<String, String>>>,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field returned for files whose content is `var_id`.
    pub fn with_field(mut self, var_id: &str, field: DecodedField) -> Self {
        self.fields.insert(var_id.to_string(), field);
        self
    }

    /// Report no matching message for `var_id` while any of `keys` is still
    /// among the filters.
    pub fn rejecting_keys(mut self, var_id: &str, keys: &[&str]) -> Self {
        self.strict
            .insert(var_id.to_string(), keys.iter().map(|k| k.to_string()).collect());
        self
    }

    /// Filter sets of every call, in order.
    pub fn calls(&self) -> Vec<BTreeMap<String, String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl FieldDecoder for ScriptedDecoder {
    fn decode(
        &self,
        path: &Path,
        filter_keys: &BTreeMap<String, String>,
        _search: &[String],
    ) -> Result<DecodedField, DecodeError> {
        self.calls.lock().unwrap().push(filter_keys.clone());

        let content = std::fs::read(path).map_err(|source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let var_id = String::from_utf8_lossy(&content).into_owned();
        let no_match = || DecodeError::NoMatchingMessage {
            path: path.to_path_buf(),
            filters: format!("{:?}", filter_keys),
        };

        if let Some(keys) = self.strict.get(&var_id) {
            if keys.iter().any(|k| filter_keys.contains_key(k)) {
                return Err(no_match());
            }
        }
        self.fields.get(&var_id).cloned().ok_or_else(no_match)
    }
}
