//! Portal adapters: the browser capability, the Chromium backend, the session
//! navigator and the artifact parser.

pub mod browser;
pub mod chromium;
pub mod navigator;
pub mod parser;

pub use browser::{BrowserError, BrowserPage, Download, DownloadTrigger, HttpReply, Locator, Scope};
pub use chromium::{find_chromium, ChromiumOptions, ChromiumPage};
pub use navigator::{
    BackoffPolicy, Credentials, ListingSource, MerPubNavigator, NavigatorConfig, NavigatorError, SearchParams,
    Section, SessionState,
};
pub use parser::{parse_listing, parse_search_results, parse_time_limit, ParseError, SearchResult};

pub const CRATE_NAME: &str = "mps-adapters";
