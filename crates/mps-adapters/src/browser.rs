//! Browser capability driven by the navigator.
//!
//! Every operation takes a [`Scope`] (the top-level page or a named embedded
//! frame) and usually a [`Locator`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Page,
    /// An embedded frame, by its `name` attribute.
    Frame(String),
}

impl Scope {
    pub fn frame(name: impl Into<String>) -> Self {
        Self::Frame(name.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Button,
    Link,
}

/// How an accessible name is matched: `Exact` is a case-insensitive substring
/// match, `Pattern` a regular expression.
#[derive(Debug, Clone)]
pub enum TextMatch {
    Exact(String),
    Pattern(Regex),
}

impl fmt::Display for TextMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(text) => write!(f, "{text:?}"),
            Self::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Locator {
    Css(String),
    Role { role: Role, name: TextMatch },
    /// Innermost elements whose text contains the given string.
    Text(String),
    /// `inner` resolved inside every element matching `container`.
    Within { container: String, inner: Box<Locator> },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn button(name: impl Into<String>) -> Self {
        Self::Role {
            role: Role::Button,
            name: TextMatch::Exact(name.into()),
        }
    }

    pub fn button_matching(pattern: Regex) -> Self {
        Self::Role {
            role: Role::Button,
            name: TextMatch::Pattern(pattern),
        }
    }

    pub fn link(name: impl Into<String>) -> Self {
        Self::Role {
            role: Role::Link,
            name: TextMatch::Exact(name.into()),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn within(container: impl Into<String>, inner: Locator) -> Self {
        Self::Within {
            container: container.into(),
            inner: Box::new(inner),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(selector) => f.write_str(selector),
            Self::Role { role, name } => write!(f, "{role:?}[name={name}]"),
            Self::Text(text) => write!(f, "text={text:?}"),
            Self::Within { container, inner } => write!(f, "{container} >> {inner}"),
        }
    }
}

/// What starts a download.
#[derive(Debug, Clone)]
pub enum DownloadTrigger {
    Script(String),
    Click(Locator),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub suggested_filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser session is gone: {0}")]
    Disconnected(String),
    #[error("no element matches {0}")]
    NotFound(String),
    #[error("frame {0:?} is not attached")]
    FrameMissing(String),
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
    #[error("script failed: {0}")]
    Script(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One browser tab (or popup) the navigator can drive.
#[async_trait]
pub trait BrowserPage: Send {
    async fn goto(&mut self, scope: &Scope, url: &str) -> Result<(), BrowserError>;

    async fn url(&mut self, scope: &Scope) -> Result<String, BrowserError>;

    /// Waits for the scope's document to finish loading.
    async fn wait_for_load(&mut self, scope: &Scope, timeout: Duration) -> Result<(), BrowserError>;

    async fn count(&mut self, scope: &Scope, locator: &Locator) -> Result<usize, BrowserError>;

    /// `Ok(false)` when nothing matched before the timeout.
    async fn wait_for(&mut self, scope: &Scope, locator: &Locator, timeout: Duration) -> Result<bool, BrowserError>;

    /// Clicks the first match.
    async fn click(&mut self, scope: &Scope, locator: &Locator) -> Result<(), BrowserError>;

    /// Types into the first match one keystroke at a time.
    async fn type_text(
        &mut self,
        scope: &Scope,
        locator: &Locator,
        text: &str,
        delay: Duration,
    ) -> Result<(), BrowserError>;

    /// Replaces the value of the first match.
    async fn fill(&mut self, scope: &Scope, locator: &Locator, value: &str) -> Result<(), BrowserError>;

    async fn select_option(&mut self, scope: &Scope, locator: &Locator, value: &str) -> Result<(), BrowserError>;

    /// Presses a named key (`"Tab"`) on whatever has focus.
    async fn press(&mut self, key: &str) -> Result<(), BrowserError>;

    /// The attribute of every match, in document order.
    async fn attributes(
        &mut self,
        scope: &Scope,
        locator: &Locator,
        name: &str,
    ) -> Result<Vec<Option<String>>, BrowserError>;

    async fn content(&mut self, scope: &Scope) -> Result<String, BrowserError>;

    async fn evaluate(&mut self, scope: &Scope, script: &str) -> Result<serde_json::Value, BrowserError>;

    /// `Ok(None)` when no download completed before the timeout.
    async fn download(
        &mut self,
        scope: &Scope,
        trigger: &DownloadTrigger,
        timeout: Duration,
    ) -> Result<Option<Download>, BrowserError>;

    /// Clicks the first match and returns the window it opens, if any.
    async fn popup(
        &mut self,
        scope: &Scope,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Option<Box<dyn BrowserPage>>, BrowserError>;

    /// POSTs a JSON body from inside the authenticated session.
    async fn post_json(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<HttpReply, BrowserError>;

    /// Full-page PNG.
    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError>;

    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}
