//! Classification of upstream failures into "not ready yet" versus fatal.
//!
//! NOAA mirrors publish a cycle file by file, so most failures while a cycle
//! is still being written are transient: missing objects (404), ranges past
//! the current end of an object (416), timeouts, truncated bodies and
//! inventories that do not list the field yet. Anything else is a real error
//! and must reach the caller unchanged.
//!
//! Classification walks the whole `source()` chain, because wrappers such as
//! [`crate::IngestionError`] or the decoder's error nest the true cause. The
//! same rule table is applied to bare strings (e.g. error text captured from
//! a subprocess log), which only ever match the phrase rules.

use std::error::Error as StdError;
use std::io;

use crate::decoder::DecodeError;
use crate::providers::UpstreamError;

/// Outcome of classifying a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Transient; try the next provider or come back later.
    NotReady(String),
    /// Propagate to the caller.
    Fatal,
}

impl Readiness {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Readiness::NotReady(_))
    }
}

/// What the classifier knows about one error in a cause chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultLink {
    pub status: Option<u16>,
    pub timeout: bool,
    pub end_of_stream: bool,
    pub name: Option<String>,
    pub message: String,
}

impl FaultLink {
    /// Extract the classification-relevant facts from one error.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut link = FaultLink {
            message: err.to_string(),
            ..Default::default()
        };

        if let Some(e) = err.downcast_ref::<UpstreamError>() {
            match e {
                UpstreamError::HttpStatus { status, .. } => link.status = Some(*status),
                UpstreamError::Timeout { .. } => link.timeout = true,
                UpstreamError::PrematureEof { .. } => link.end_of_stream = true,
                UpstreamError::Named { name, .. } => link.name = Some(name.clone()),
                _ => {}
            }
        } else if let Some(e) = err.downcast_ref::<reqwest::Error>() {
            link.status = e.status().map(|s| s.as_u16());
            link.timeout = e.is_timeout();
        } else if let Some(e) = err.downcast_ref::<io::Error>() {
            match e.kind() {
                io::ErrorKind::TimedOut => link.timeout = true,
                io::ErrorKind::UnexpectedEof => link.end_of_stream = true,
                _ => {}
            }
        } else if err.is::<tokio::time::error::Elapsed>() {
            link.timeout = true;
        } else if let Some(DecodeError::Truncated { .. }) = err.downcast_ref::<DecodeError>() {
            link.end_of_stream = true;
        }

        link
    }

    fn from_message(message: &str) -> Self {
        FaultLink {
            message: message.to_string(),
            ..Default::default()
        }
    }
}

/// Flatten an error and all of its sources, outermost first.
pub fn flatten_chain(err: &(dyn StdError + 'static)) -> Vec<FaultLink> {
    let mut links = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        links.push(FaultLink::from_error(e));
        current = e.source();
    }
    links
}

/// Predicate half of a classification rule.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Any link carries one of these HTTP-like statuses.
    Status(Vec<u16>),
    /// Any link is a timeout.
    Timeout,
    /// Any link is a premature end of stream.
    EndOfStream,
    /// Any link's name matches one of these (case-insensitive).
    Named(Vec<String>),
    /// The stringified chain contains one of these phrases (case-insensitive).
    Phrase(Vec<String>),
}

/// A labelled rule; a match means not-ready.
#[derive(Debug, Clone)]
pub struct Rule {
    pub label: &'static str,
    pub matcher: Matcher,
}

impl Rule {
    fn matches(&self, links: &[FaultLink], text: &str) -> bool {
        match &self.matcher {
            Matcher::Status(codes) => links
                .iter()
                .any(|l| l.status.is_some_and(|s| codes.contains(&s))),
            Matcher::Timeout => links.iter().any(|l| l.timeout),
            Matcher::EndOfStream => links.iter().any(|l| l.end_of_stream),
            Matcher::Named(names) => links.iter().any(|l| {
                l.name
                    .as_deref()
                    .is_some_and(|n| names.iter().any(|want| n.eq_ignore_ascii_case(want)))
            }),
            Matcher::Phrase(phrases) => phrases.iter().any(|p| text.contains(p.as_str())),
        }
    }
}

/// Fault names treated as not-ready.
pub const NOT_READY_NAMES: &[&str] = &["premature end of file", "incomplete read", "chunk truncated"];

/// Fallback phrases treated as not-ready (matched against lowercased text).
pub const NOT_READY_PHRASES: &[&str] = &[
    "index not ready",
    "index file not found",
    "no index file",
    "inventory not found",
    "no valid message found",
    "http 404",
    "http 416",
    "404 not found",
    "416 range not satisfiable",
    "read timed out",
    "premature end of file",
    "unexpected eof",
];

/// Ordered, table-driven classifier.
///
/// New upstream failure signatures are added with [`NotReadyClassifier::with_rule`]
/// instead of editing the evaluation logic.
#[derive(Debug, Clone)]
pub struct NotReadyClassifier {
    rules: Vec<Rule>,
}

impl Default for NotReadyClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                Rule {
                    label: "http status",
                    matcher: Matcher::Status(vec![404, 416]),
                },
                Rule {
                    label: "timeout",
                    matcher: Matcher::Timeout,
                },
                Rule {
                    label: "end of stream",
                    matcher: Matcher::EndOfStream,
                },
                Rule {
                    label: "named fault",
                    matcher: Matcher::Named(NOT_READY_NAMES.iter().map(|s| s.to_string()).collect()),
                },
                Rule {
                    label: "phrase",
                    matcher: Matcher::Phrase(
                        NOT_READY_PHRASES.iter().map(|s| s.to_string()).collect(),
                    ),
                },
            ],
        }
    }
}

impl NotReadyClassifier {
    /// Append a rule; it is evaluated after the built-in ones.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        if let Matcher::Phrase(phrases) = &rule.matcher {
            let lowered = phrases.iter().map(|p| p.to_lowercase()).collect();
            self.rules.push(Rule {
                label: rule.label,
                matcher: Matcher::Phrase(lowered),
            });
        } else {
            self.rules.push(rule);
        }
        self
    }

    /// Classify a live error, including everything in its source chain.
    pub fn classify_error(&self, err: &(dyn StdError + 'static)) -> Readiness {
        let links = flatten_chain(err);
        self.classify_links(&links)
    }

    /// Classify a bare message, e.g. logged error text.
    pub fn classify_message(&self, message: &str) -> Readiness {
        self.classify_links(&[FaultLink::from_message(message)])
    }

    fn classify_links(&self, links: &[FaultLink]) -> Readiness {
        let text = links
            .iter()
            .map(|l| l.message.as_str())
            .collect::<Vec<_>>()
            .join(": ");
        let lowered = text.to_lowercase();

        for rule in &self.rules {
            if rule.matches(links, &lowered) {
                return Readiness::NotReady(format!("{}: {}", rule.label, text));
            }
        }
        Readiness::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    /// A wrapper standing in for a framework error that nests the real cause.
    #[derive(Debug)]
    struct Wrapped {
        context: &'static str,
        inner: Box<dyn StdError + Send + Sync + 'static>,
    }

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.context)
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(self.inner.as_ref())
        }
    }

    fn wrap(context: &'static str, inner: impl StdError + Send + Sync + 'static) -> Wrapped {
        Wrapped {
            context,
            inner: Box::new(inner),
        }
    }

    fn http(status: u16) -> UpstreamError {
        UpstreamError::HttpStatus {
            status,
            url: "https://example.com/gfs.t00z.pgrb2.0p25.f006".to_string(),
        }
    }

    #[test]
    fn test_status_404_and_416_are_not_ready() {
        let c = NotReadyClassifier::default();
        assert!(c.classify_error(&http(404)).is_not_ready());
        assert!(c.classify_error(&http(416)).is_not_ready());
        assert_eq!(c.classify_error(&http(403)), Readiness::Fatal);
        assert_eq!(c.classify_error(&http(500)), Readiness::Fatal);
    }

    #[test]
    fn test_nested_status_is_found() {
        let c = NotReadyClassifier::default();
        let err = wrap("fetch failed", wrap("provider aws", http(404)));
        assert!(c.classify_error(&err).is_not_ready());
    }

    #[test]
    fn test_timeouts_are_not_ready() {
        let c = NotReadyClassifier::default();
        let io_timeout = io::Error::new(io::ErrorKind::TimedOut, "socket");
        assert!(c.classify_error(&wrap("download", io_timeout)).is_not_ready());
        let upstream = UpstreamError::Timeout {
            url: "https://example.com".into(),
        };
        assert!(c.classify_error(&upstream).is_not_ready());
    }

    #[test]
    fn test_end_of_stream_is_not_ready() {
        let c = NotReadyClassifier::default();
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short body");
        assert!(c.classify_error(&eof).is_not_ready());
    }

    #[test]
    fn test_named_fault_is_not_ready() {
        let c = NotReadyClassifier::default();
        let named = UpstreamError::Named {
            name: "Premature End Of File".into(),
            detail: "body ended early".into(),
        };
        assert!(c.classify_error(&named).is_not_ready());
        let other = UpstreamError::Named {
            name: "access denied".into(),
            detail: "bad credentials".into(),
        };
        assert_eq!(c.classify_error(&other), Readiness::Fatal);
    }

    #[test]
    fn test_phrase_fallback_is_case_insensitive() {
        let c = NotReadyClassifier::default();
        assert!(c.classify_message("Index Not Ready for gfs 06z").is_not_ready());
        assert!(c.classify_message("ECCODES ERROR: No valid message found").is_not_ready());
        assert!(c.classify_message("Inventory not found for f012").is_not_ready());
        assert!(c.classify_message("upstream said HTTP 404").is_not_ready());
        assert!(c.classify_message("Read timed out. (read timeout=30)").is_not_ready());
        assert_eq!(c.classify_message("permission denied"), Readiness::Fatal);
        assert_eq!(c.classify_message(""), Readiness::Fatal);
    }

    #[test]
    fn test_phrase_in_nested_message() {
        let c = NotReadyClassifier::default();
        let inner = io::Error::new(io::ErrorKind::Other, "inventory not found");
        assert!(c.classify_error(&wrap("decode", inner)).is_not_ready());
    }

    #[test]
    fn test_plain_errors_are_fatal() {
        let c = NotReadyClassifier::default();
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "cache dir not writable");
        assert_eq!(c.classify_error(&err), Readiness::Fatal);
    }

    #[test]
    fn test_string_and_error_agree() {
        let c = NotReadyClassifier::default();
        let err = io::Error::new(io::ErrorKind::Other, "no index file for hrrr f03");
        let from_error = c.classify_error(&err).is_not_ready();
        let from_text = c.classify_message(&err.to_string()).is_not_ready();
        assert_eq!(from_error, from_text);
    }

    #[test]
    fn test_additional_rules_are_additive() {
        let c = NotReadyClassifier::default().with_rule(Rule {
            label: "throttled",
            matcher: Matcher::Phrase(vec!["SlowDown".into()]),
        });
        assert!(c.classify_message("S3 replied slowdown, retry later").is_not_ready());
        assert!(c.classify_error(&http(503)) == Readiness::Fatal);
    }

    #[test]
    fn test_reason_names_the_rule() {
        let c = NotReadyClassifier::default();
        match c.classify_error(&http(404)) {
            Readiness::NotReady(reason) => assert!(reason.starts_with("http status")),
            Readiness::Fatal => panic!("expected not-ready"),
        }
    }
}
