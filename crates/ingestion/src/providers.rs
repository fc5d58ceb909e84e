//! Upstream data providers.
//!
//! A provider turns a [`ProviderRequest`] into raw GRIB2 bytes for each
//! requested field. Attempts are independent and stateless; the acquisition
//! engine decides what to do with failures.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument};

use wx_common::RunId;

use crate::models::Model;

/// Failures reported by a provider.
///
/// The variants carry the facts [`crate::NotReadyClassifier`] looks for, so
/// classification never depends on provider-specific message wording.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("premature end of body from {url}: expected {expected} bytes, got {received}")]
    PrematureEof {
        url: String,
        expected: u64,
        received: u64,
    },

    /// A named fault raised by a provider backend.
    #[error("{name}: {detail}")]
    Named { name: String, detail: String },

    #[error("inventory not found for '{pattern}' in {url}")]
    InventoryNotFound { url: String, pattern: String },

    #[error("malformed inventory {url}: {detail}")]
    MalformedInventory { url: String, detail: String },

    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid provider configuration: {0}")]
    Config(String),
}

impl UpstreamError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout {
                url: url.to_string(),
            }
        } else if let Some(status) = err.status() {
            UpstreamError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else {
            UpstreamError::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// One field to fetch and the inventory patterns that identify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTerm {
    /// Variable id the payload is stored under.
    pub var_id: String,
    pub patterns: Vec<String>,
}

/// A request for one or more fields of one forecast file.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: Model,
    pub run: RunId,
    pub forecast_hour: u32,
    pub terms: Vec<SearchTerm>,
}

impl ProviderRequest {
    /// All patterns joined into one alternation, so a provider that supports
    /// it can return every field of a composite in a single round trip.
    pub fn search_expression(&self) -> String {
        self.terms
            .iter()
            .flat_map(|t| t.patterns.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Expand a URL template.
    ///
    /// Placeholders: `{model}`, `{date}` (YYYYMMDD), `{hour}` (HH), `{fhr}`
    /// (3-digit) and `{fhr2}` (2-digit).
    pub fn expand_url(&self, template: &str) -> String {
        template
            .replace("{model}", self.model.id())
            .replace("{date}", self.run.date())
            .replace("{hour}", &format!("{:02}", self.run.hour()))
            .replace("{fhr}", &format!("{:03}", self.forecast_hour))
            .replace("{fhr2}", &format!("{:02}", self.forecast_hour))
    }
}

/// Raw bytes returned by a provider, keyed by [`SearchTerm::var_id`].
#[derive(Debug, Clone, Default)]
pub struct ProviderPayload {
    pub fields: BTreeMap<String, Bytes>,
    /// The provider returned whole files rather than byte ranges.
    pub is_full_file: bool,
}

/// An upstream source of model data.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, request: &ProviderRequest) -> Result<ProviderPayload, UpstreamError>;
}

/// One line of a GRIB2 `.idx` inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub message: u32,
    pub offset: u64,
    /// Byte offset of the next message, `None` for the last one.
    pub end: Option<u64>,
    pub line: String,
}

/// Parse a wgrib2-style inventory: `num:offset:d=YYYYMMDDHH:VAR:level:fcst:`.
pub fn parse_inventory(url: &str, text: &str) -> Result<Vec<InventoryEntry>, UpstreamError> {
    let mut entries: Vec<InventoryEntry> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.splitn(3, ':');
        let message = parts.next().and_then(|p| p.split('.').next()?.parse().ok());
        let offset = parts.next().and_then(|p| p.parse().ok());
        match (message, offset) {
            (Some(message), Some(offset)) => entries.push(InventoryEntry {
                message,
                offset,
                end: None,
                line: format!(":{}", parts.next().unwrap_or_default()),
            }),
            _ => {
                return Err(UpstreamError::MalformedInventory {
                    url: url.to_string(),
                    detail: format!("bad line '{}'", line),
                })
            }
        }
    }

    // Sub-messages (`3.1`, `3.2`) share an offset; the range ends at the next
    // distinct offset.
    for i in 0..entries.len() {
        let offset = entries[i].offset;
        entries[i].end = entries[i + 1..]
            .iter()
            .map(|e| e.offset)
            .find(|&o| o > offset);
    }
    Ok(entries)
}

/// Byte ranges `[start, end)` for every inventory line matching any pattern,
/// with adjacent ranges coalesced. `None` ends mean "to end of file".
pub fn matching_ranges(entries: &[InventoryEntry], patterns: &[String]) -> Vec<(u64, Option<u64>)> {
    let mut ranges: Vec<(u64, Option<u64>)> = Vec::new();
    for entry in entries {
        if !patterns.iter().any(|p| entry.line.contains(p.as_str())) {
            continue;
        }
        match ranges.last_mut() {
            Some((_, Some(end))) if *end == entry.offset => *end = entry.end.unwrap_or(u64::MAX),
            Some((start, _)) if *start == entry.offset => {}
            _ => ranges.push((entry.offset, Some(entry.end.unwrap_or(u64::MAX)))),
        }
    }
    ranges
        .into_iter()
        .map(|(s, e)| (s, e.filter(|&e| e != u64::MAX)))
        .collect()
}

/// Provider that reads the `.idx` inventory next to a GRIB2 file and fetches
/// only the matching messages with HTTP `Range` requests.
pub struct HttpProvider {
    name: String,
    url_template: String,
    client: Client,
}

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| UpstreamError::Config(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            url_template: url_template.into(),
            client,
        })
    }

    async fn get_inventory(&self, url: &str) -> Result<Vec<InventoryEntry>, UpstreamError> {
        let idx_url = format!("{}.idx", url);
        let response = self
            .client
            .get(&idx_url)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&idx_url, e))?;
        if !response.status().is_success() {
            return Err(UpstreamError::HttpStatus {
                status: response.status().as_u16(),
                url: idx_url,
            });
        }
        let text = response
            .text()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&idx_url, e))?;
        parse_inventory(&idx_url, &text)
    }

    async fn get_range(&self, url: &str, start: u64, end: Option<u64>) -> Result<Bytes, UpstreamError> {
        let range = match end {
            Some(end) => format!("bytes={}-{}", start, end - 1),
            None => format!("bytes={}-", start),
        };
        let response = self
            .client
            .get(url)
            .header(header::RANGE, &range)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(url, e))?;

        let whole_file = match response.status() {
            StatusCode::PARTIAL_CONTENT => false,
            // Server ignored the range; slice locally.
            StatusCode::OK => true,
            status => {
                return Err(UpstreamError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
        };
        let expected = response.content_length();

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpstreamError::from_reqwest(url, e))?;
            body.extend_from_slice(&chunk);
        }
        if let Some(expected) = expected {
            if (body.len() as u64) < expected {
                return Err(UpstreamError::PrematureEof {
                    url: url.to_string(),
                    expected,
                    received: body.len() as u64,
                });
            }
        }

        let body = body.freeze();
        if whole_file {
            let len = body.len() as u64;
            let stop = end.unwrap_or(len).min(len);
            if start >= stop {
                return Err(UpstreamError::HttpStatus {
                    status: StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
                    url: url.to_string(),
                });
            }
            return Ok(body.slice(start as usize..stop as usize));
        }
        Ok(body)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, request), fields(provider = %self.name, model = %request.model, run = %request.run, fhr = request.forecast_hour))]
    async fn fetch(&self, request: &ProviderRequest) -> Result<ProviderPayload, UpstreamError> {
        let url = request.expand_url(&self.url_template);
        debug!(url = %url, search = %request.search_expression(), "Fetching inventory");
        let inventory = self.get_inventory(&url).await?;

        let mut payload = ProviderPayload::default();
        for term in &request.terms {
            let ranges = matching_ranges(&inventory, &term.patterns);
            if ranges.is_empty() {
                return Err(UpstreamError::InventoryNotFound {
                    url: format!("{}.idx", url),
                    pattern: term.patterns.join("|"),
                });
            }
            let mut data = BytesMut::new();
            for (start, end) in ranges {
                data.extend_from_slice(&self.get_range(&url, start, end).await?);
            }
            debug!(var = %term.var_id, bytes = data.len(), "Fetched field");
            payload.fields.insert(term.var_id.clone(), data.freeze());
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDX: &str = "\
1:0:d=2026020706:PRMSL:mean sea level:anl:
2:1000:d=2026020706:TMP:2 m above ground:6 hour fcst:
3:2500:d=2026020706:UGRD:10 m above ground:6 hour fcst:
4:3100:d=2026020706:VGRD:10 m above ground:6 hour fcst:
5:3700:d=2026020706:REFC:entire atmosphere:6 hour fcst:
";

    fn request(patterns: &[(&str, &str)]) -> ProviderRequest {
        ProviderRequest {
            model: Model::Gfs,
            run: RunId::parse("20260207_06z").unwrap(),
            forecast_hour: 6,
            terms: patterns
                .iter()
                .map(|(var, p)| SearchTerm {
                    var_id: var.to_string(),
                    patterns: vec![p.to_string()],
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_inventory_ends() {
        let entries = parse_inventory("u", IDX).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[1].offset, 1000);
        assert_eq!(entries[1].end, Some(2500));
        assert_eq!(entries[4].end, None);
        assert!(entries[1].line.contains(":TMP:2 m above ground:"));
    }

    #[test]
    fn test_submessages_share_offset() {
        let idx = "1:0:d=x:A:l:\n2.1:100:d=x:B:l:\n2.2:100:d=x:C:l:\n3:300:d=x:D:l:\n";
        let entries = parse_inventory("u", idx).unwrap();
        assert_eq!(entries[1].end, Some(300));
        assert_eq!(entries[2].end, Some(300));
        let ranges = matching_ranges(&entries, &[":B:".into(), ":C:".into()]);
        assert_eq!(ranges, vec![(100, Some(300))]);
    }

    #[test]
    fn test_malformed_inventory() {
        let err = parse_inventory("u", "garbage line\n").unwrap_err();
        assert!(matches!(err, UpstreamError::MalformedInventory { .. }));
    }

    #[test]
    fn test_ranges_are_coalesced() {
        let entries = parse_inventory("u", IDX).unwrap();
        let ranges = matching_ranges(
            &entries,
            &[":UGRD:10 m above ground:".into(), ":VGRD:10 m above ground:".into()],
        );
        assert_eq!(ranges, vec![(2500, Some(3700))]);

        let last = matching_ranges(&entries, &[":REFC:".into()]);
        assert_eq!(last, vec![(3700, None)]);

        assert!(matching_ranges(&entries, &[":CSNOW:".into()]).is_empty());
    }

    #[test]
    fn test_search_expression_joins_terms() {
        let req = request(&[("ugrd10m", ":UGRD:10 m"), ("vgrd10m", ":VGRD:10 m")]);
        assert_eq!(req.search_expression(), ":UGRD:10 m|:VGRD:10 m");
    }

    #[test]
    fn test_expand_url() {
        let req = request(&[]);
        let url = req.expand_url(
            "https://mirror/{model}.{date}/{hour}/atmos/{model}.t{hour}z.pgrb2.0p25.f{fhr}",
        );
        assert_eq!(
            url,
            "https://mirror/gfs.20260207/06/atmos/gfs.t06z.pgrb2.0p25.f006"
        );
    }

    #[test]
    fn test_inventory_not_found_message_classifies() {
        let err = UpstreamError::InventoryNotFound {
            url: "u.idx".into(),
            pattern: ":CSNOW:".into(),
        };
        let c = crate::NotReadyClassifier::default();
        assert!(c.classify_error(&err).is_not_ready());
    }
}
