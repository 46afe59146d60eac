//! Bus subjects carry the routing coordinates of a call as dot-delimited tokens:
//!
//! ```text
//! Qualified:    environment . queue . module[.sub...] . method
//! Unqualified:                queue . module[.sub...] . method
//! ```
//!
//! The method is always the final token and the module is everything between the fixed
//! prefix and the method, so module names may themselves be namespaced with dots. Which
//! layout applies is a deployment decision, fixed once per server through [`SubjectCodec`].

use std::fmt;

use thiserror::Error;

/// Wildcard token matching exactly one subject segment.
pub const SINGLE_TOKEN_WILDCARD: &str = "*";

/// Segment layout of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectLayout {
    /// `environment.queue.module.method`
    #[default]
    Qualified,
    /// `queue.module.method`
    Unqualified,
}

impl SubjectLayout {
    /// Number of prefix segments that precede the module.
    pub fn prefix_segments(&self) -> usize {
        match self {
            Self::Qualified => 2,
            Self::Unqualified => 1,
        }
    }

    /// Fewest segments a subject must have: prefix, one module token and the method.
    pub fn min_segments(&self) -> usize {
        self.prefix_segments() + 2
    }
}

/// Routing coordinates decoded from a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub environment: Option<String>,
    pub queue: String,
    pub module: String,
    pub method: String,
}

impl Subject {
    /// Decomposes `subject` according to `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`SubjectError::TooFewSegments`] when the subject is shorter than
    /// [`SubjectLayout::min_segments`], and [`SubjectError::EmptySegment`] when any token
    /// between dots is empty.
    pub fn parse(subject: &str, layout: SubjectLayout) -> Result<Self, SubjectError> {
        let tokens: Vec<&str> = subject.split('.').collect();
        if tokens.len() < layout.min_segments() {
            return Err(SubjectError::TooFewSegments {
                subject: subject.to_string(),
                expected: layout.min_segments(),
                found: tokens.len(),
            });
        }
        if tokens.iter().any(|token| token.is_empty()) {
            return Err(SubjectError::EmptySegment {
                subject: subject.to_string(),
            });
        }

        let prefix = layout.prefix_segments();
        let last = tokens.len() - 1;
        let (environment, queue) = match layout {
            SubjectLayout::Qualified => (Some(tokens[0].to_string()), tokens[1].to_string()),
            SubjectLayout::Unqualified => (None, tokens[0].to_string()),
        };

        Ok(Self {
            environment,
            queue,
            module: tokens[prefix..last].join("."),
            method: tokens[last].to_string(),
        })
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(environment) = &self.environment {
            write!(f, "{}.", environment)?;
        }
        write!(f, "{}.{}.{}", self.queue, self.module, self.method)
    }
}

/// Formats and parses subjects for one deployment (fixed layout, environment and queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectCodec {
    environment: Option<String>,
    queue: String,
}

impl SubjectCodec {
    /// Codec for `environment.queue.module.method` subjects.
    pub fn qualified(environment: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            environment: Some(environment.into()),
            queue: queue.into(),
        }
    }

    /// Codec for `queue.module.method` subjects.
    pub fn unqualified(queue: impl Into<String>) -> Self {
        Self {
            environment: None,
            queue: queue.into(),
        }
    }

    pub fn layout(&self) -> SubjectLayout {
        if self.environment.is_some() {
            SubjectLayout::Qualified
        } else {
            SubjectLayout::Unqualified
        }
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Parses an inbound subject with this deployment's layout.
    pub fn parse(&self, subject: &str) -> Result<Subject, SubjectError> {
        Subject::parse(subject, self.layout())
    }

    /// Wildcard pattern a module subscribes to: `{prefix}.{module}.*`.
    pub fn subscription_subject(&self, module: &str) -> String {
        format!("{}.{}.{}", self.prefix('.'), module, SINGLE_TOKEN_WILDCARD)
    }

    /// Queue group shared by every instance serving `module`: `{prefix}:{module}`.
    pub fn queue_group(&self, module: &str) -> String {
        format!("{}:{}", self.prefix(':'), module)
    }

    /// Concrete subject a caller publishes to for `module`/`method`.
    pub fn method_subject(&self, module: &str, method: &str) -> String {
        format!("{}.{}.{}", self.prefix('.'), module, method)
    }

    fn prefix(&self, separator: char) -> String {
        match &self.environment {
            Some(environment) => format!("{}{}{}", environment, separator, self.queue),
            None => self.queue.clone(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubjectError {
    #[error("invalid subject: {subject} (expected at least {expected} segments, found {found})")]
    TooFewSegments {
        subject: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid subject: {subject} (empty segment)")]
    EmptySegment { subject: String },
}

impl SubjectError {
    /// The offending subject string.
    pub fn subject(&self) -> &str {
        match self {
            Self::TooFewSegments { subject, .. } | Self::EmptySegment { subject } => subject,
        }
    }
}
