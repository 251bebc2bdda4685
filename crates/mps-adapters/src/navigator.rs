//! Session navigator for the Mercado Público buyer portal.
//!
//! ```text
//! LoggedOut ─▶ LoggingIn ─▶ AwaitingOrganismPicker ─▶ LoggedIn ─▶ InSection(Agile)
//!                  ▲                  │ picker not shown
//!                  └──────────────────┘ (bounded by max_login_attempts)
//! ```

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mps_core::{BidStatus, RawArtifactBundle, Rut, VirtualFile};
use mps_storage::DumpSink;
use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::browser::{BrowserError, BrowserPage, DownloadTrigger, Locator, Scope};

pub const HOME_URL: &str = "https://www.mercadopublico.cl/Home";
pub const PORTAL_URL: &str = "https://www.mercadopublico.cl/Portal/Modules/Menu/Menu.aspx";
pub const AGILE_URL_PREFIX: &str = "https://www.mercadopublico.cl/CompraAgil/Modules/Cotizacion/";
pub const AGILE_SEARCH_URL: &str =
    "https://www.mercadopublico.cl/CompraAgil/Modules/Cotizacion/BuscarCotizacion.aspx";
pub const MODAL_DATA_URL: &str = "https://www.mercadopublico.cl/CompraAgil/Modules/Cotizacion/SeleccionProveedor.aspx/ObtenerDatosCotizacion";
const IDENTITY_PROVIDER_PREFIX: &str = "https://accounts.claveunica.gob.cl/";
pub const MAIN_FRAME: &str = "fraDetalle";

const EXPORT_POSTBACK: &str = "__doPostBack('lnkDownloadExcel','');";
const MODAL_DISMISSER: &str = "setInterval(function () { \
     if (window.$) { window.$('#modalStepper').modal('hide'); } \
 }, 500);";
const MODAL_HEADERS: &[(&str, &str)] = &[
    ("accept", "application/json, text/javascript, */*; q=0.01"),
    ("content-type", "application/json; charset=UTF-8"),
    ("x-requested-with", "XMLHttpRequest"),
];

static DETAIL_BUTTON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("Ver detalle|Participa").expect("static regex"));
static DETAIL_ONCLICK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^window\.location='(?P<url>(?:[^'\\]|\\.)*)';.*$").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Agile,
}

impl Section {
    fn landing_url(self) -> &'static str {
        match self {
            Self::Agile => AGILE_SEARCH_URL,
        }
    }

    fn menu_entry(self) -> &'static str {
        match self {
            Self::Agile => "COMPRA ÁGIL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    LoggingIn { attempt: usize },
    AwaitingOrganismPicker { attempt: usize },
    LoggedIn,
    InSection(Section),
}

#[derive(Clone)]
pub struct Credentials {
    pub username: Rut,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Exponential backoff, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    pub page_load_timeout: Duration,
    pub organism_picker_timeout: Duration,
    pub element_timeout: Duration,
    pub download_timeout: Duration,
    pub popup_timeout: Duration,
    pub keystroke_delay: Duration,
    pub max_login_attempts: usize,
    pub login_backoff: BackoffPolicy,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            page_load_timeout: Duration::from_secs(30),
            organism_picker_timeout: Duration::from_millis(2500),
            element_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(30),
            popup_timeout: Duration::from_secs(15),
            keystroke_delay: Duration::from_millis(50),
            max_login_attempts: 5,
            login_backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NavigatorError {
    #[error("the account appears as blocked")]
    AccountBlocked,
    #[error("organism picker not shown after {attempts} login attempts")]
    LoginAttemptsExhausted { attempts: usize },
    #[error("listing {idn} not found in search")]
    ListingNotFound { idn: String },
    #[error("unexpected page: {0}")]
    UnexpectedPage(String),
    #[error("{what} did not finish downloading")]
    DownloadTimedOut { what: &'static str },
    #[error("{what} window did not open")]
    PopupTimedOut { what: &'static str },
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl NavigatorError {
    /// Fatal errors end the run; anything else only loses the current listing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AccountBlocked
                | Self::LoginAttemptsExhausted { .. }
                | Self::Browser(BrowserError::Disconnected(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    pub from: NaiveDate,
    pub until: NaiveDate,
    /// `None` searches every status.
    pub status: Option<BidStatus>,
}

impl SearchParams {
    fn status_filter_value(&self) -> &'static str {
        self.status.map_or("0", BidStatus::search_filter_value)
    }
}

/// What the acquisition loop needs from a session.
#[async_trait]
pub trait ListingSource: Send {
    /// The search export, or `None` when the search has no results.
    async fn search(&mut self, params: &SearchParams) -> Result<Option<VirtualFile<String>>, NavigatorError>;

    async fn fetch_listing(&mut self, idn: &str) -> Result<RawArtifactBundle, NavigatorError>;
}

pub struct MerPubNavigator {
    page: Box<dyn BrowserPage>,
    credentials: Credentials,
    config: NavigatorConfig,
    dumps: Arc<dyn DumpSink>,
    state: SessionState,
}

impl MerPubNavigator {
    pub fn new(
        page: Box<dyn BrowserPage>,
        credentials: Credentials,
        config: NavigatorConfig,
        dumps: Arc<dyn DumpSink>,
    ) -> Self {
        Self {
            page,
            credentials,
            config,
            dumps,
            state: SessionState::LoggedOut,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn frame() -> Scope {
        Scope::frame(MAIN_FRAME)
    }

    /// Saves a screenshot + HTML pair. Failures here are only logged.
    pub async fn capture_diagnostics(&mut self, label: &str) {
        let screenshot = match self.page.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, label, "could not take diagnostic screenshot");
                Vec::new()
            }
        };
        let html = self.page.content(&Scope::Page).await.unwrap_or_default();
        if let Err(err) = self.dumps.dump(label, &screenshot, &html).await {
            warn!(%err, label, "could not save diagnostic dump");
        }
    }

    /// One pass through the identity provider. Returns once the post-login page loaded.
    async fn submit_login(&mut self) -> Result<(), NavigatorError> {
        let load = self.config.page_load_timeout;
        self.page.goto(&Scope::Page, HOME_URL).await?;
        self.page.wait_for_load(&Scope::Page, load).await?;
        self.page.click(&Scope::Page, &Locator::button("Iniciar Sesión")).await?;
        self.page.click(&Scope::Page, &Locator::link("ClaveÚnica")).await?;
        self.page.wait_for_load(&Scope::Page, load).await?;

        if self.page.url(&Scope::Page).await?.starts_with(IDENTITY_PROVIDER_PREFIX) {
            debug!("submitting identity provider credentials");
            let delay = self.config.keystroke_delay;
            let username = self.credentials.username.compact();
            let password = self.credentials.password.clone();
            self.page
                .type_text(&Scope::Page, &Locator::css("#uname"), &username, delay)
                .await?;
            self.page
                .type_text(&Scope::Page, &Locator::css("#pword"), &password, delay)
                .await?;
            self.page.click(&Scope::Page, &Locator::button("Continuar")).await?;
        } else {
            debug!("identity provider session still valid; skipping credentials");
        }
        self.page.wait_for_load(&Scope::Page, load).await?;
        Ok(())
    }

    pub async fn login(&mut self) -> Result<(), NavigatorError> {
        info!(user = %self.credentials.username, "logging in");
        let max_attempts = self.config.max_login_attempts.max(1);
        for attempt in 1..=max_attempts {
            self.state = SessionState::LoggingIn { attempt };
            self.submit_login().await?;

            if self.page.count(&Scope::Page, &Locator::css(".swal2-container")).await? > 0 {
                self.capture_diagnostics("account-blocked").await;
                self.state = SessionState::LoggedOut;
                return Err(NavigatorError::AccountBlocked);
            }

            self.state = SessionState::AwaitingOrganismPicker { attempt };
            let picker = Locator::css(".rdbOrganismo");
            if self
                .page
                .wait_for(&Scope::Page, &picker, self.config.organism_picker_timeout)
                .await?
            {
                self.page.click(&Scope::Page, &picker).await?;
                self.page.click(&Scope::Page, &Locator::link("Ingresar")).await?;
                self.page
                    .wait_for_load(&Scope::Page, self.config.page_load_timeout)
                    .await?;
                self.state = SessionState::LoggedIn;
                info!(attempt, "logged in");
                return Ok(());
            }

            warn!(attempt, max_attempts, "organism picker not shown after login; retrying");
            if attempt < max_attempts {
                tokio::time::sleep(self.config.login_backoff.delay_for_attempt(attempt - 1)).await;
            }
        }

        self.capture_diagnostics("login-exhausted").await;
        self.state = SessionState::LoggedOut;
        Err(NavigatorError::LoginAttemptsExhausted {
            attempts: max_attempts,
        })
    }

    async fn inject_modal_dismisser(&mut self) -> Result<(), NavigatorError> {
        debug!("injecting instructions modal dismisser");
        let load = self.config.page_load_timeout;
        self.page.wait_for_load(&Scope::Page, load).await?;
        self.page.wait_for_load(&Self::frame(), load).await?;
        self.page.evaluate(&Self::frame(), MODAL_DISMISSER).await?;
        Ok(())
    }

    /// Brings the session into `section`, logging in first when needed.
    pub async fn enter_section(&mut self, section: Section) -> Result<(), NavigatorError> {
        let load = self.config.page_load_timeout;
        if self.page.url(&Scope::Page).await? != PORTAL_URL {
            self.page.goto(&Scope::Page, PORTAL_URL).await?;
            self.page.wait_for_load(&Scope::Page, load).await?;
            if self.page.url(&Scope::Page).await? != PORTAL_URL {
                self.login().await?;
                if self.page.url(&Scope::Page).await? != PORTAL_URL {
                    self.page.goto(&Scope::Page, PORTAL_URL).await?;
                    self.page.wait_for_load(&Scope::Page, load).await?;
                }
            }
            self.state = SessionState::LoggedIn;
            self.inject_modal_dismisser().await?;
        }

        if self.page.url(&Self::frame()).await? != section.landing_url() {
            debug!(?section, "opening section from menu");
            self.page
                .click(&Self::frame(), &Locator::link(section.menu_entry()))
                .await?;
            self.page.wait_for_load(&Self::frame(), load).await?;
        }
        self.state = SessionState::InSection(section);
        Ok(())
    }

    async fn download_export(&mut self, what: &'static str) -> Result<Option<VirtualFile<String>>, NavigatorError> {
        if self.page.count(&Self::frame(), &Locator::css("#lnkDownloadExcel")).await? == 0 {
            return Ok(None);
        }
        let download = self
            .page
            .download(
                &Self::frame(),
                &DownloadTrigger::Script(EXPORT_POSTBACK.to_string()),
                self.config.download_timeout,
            )
            .await?
            .ok_or(NavigatorError::DownloadTimedOut { what })?;
        Ok(Some(VirtualFile::new(
            download.suggested_filename,
            String::from_utf8_lossy(&download.bytes).into_owned(),
        )))
    }

    async fn run_search(&mut self, params: &SearchParams) -> Result<Option<VirtualFile<String>>, NavigatorError> {
        self.enter_section(Section::Agile).await?;
        debug!(from = %params.from, until = %params.until, status = ?params.status, "configuring search");

        let frame = Self::frame();
        let delay = self.config.keystroke_delay;
        self.page
            .click(&frame, &Locator::text("Solamente cotizaciones de mis rubros"))
            .await?;
        self.page
            .select_option(&frame, &Locator::css("#ddlState"), params.status_filter_value())
            .await?;
        self.page.press("Tab").await?;
        self.page
            .type_text(&frame, &Locator::css("#fdesde"), &params.from.format("%d%m%Y").to_string(), delay)
            .await?;
        self.page.press("Tab").await?;
        self.page
            .type_text(&frame, &Locator::css("#fhasta"), &params.until.format("%d%m%Y").to_string(), delay)
            .await?;
        self.page.press("Tab").await?;
        self.page.click(&frame, &Locator::css("#btnSearchParameter")).await?;
        self.page.wait_for_load(&frame, self.config.page_load_timeout).await?;

        let export = self.download_export("search results").await?;
        if export.is_none() {
            warn!("search returned no results");
        }
        Ok(export)
    }

    async fn post_modal(&mut self, idn: &str, request_id: i64, quote_id: i64) -> Result<Option<String>, NavigatorError> {
        let span = info_span!("modal_fetch", idn, request_id, quote_id);
        async {
            let body = json!({ "idSolicitud": request_id, "idCotizacion": quote_id });
            let reply = self.page.post_json(MODAL_DATA_URL, MODAL_HEADERS, &body).await?;
            if reply.is_success() {
                Ok(Some(reply.body))
            } else {
                warn!(status = reply.status, "provider detail request failed; skipping");
                Ok(None)
            }
        }
        .instrument(span)
        .await
    }

    async fn quote_ids(&mut self, container: &str) -> Result<Vec<i64>, NavigatorError> {
        let locator = Locator::within(container, Locator::button("Ver detalle"));
        let values = self.page.attributes(&Self::frame(), &locator, "data-qs2").await?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|v| match v.trim().parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    debug!(value = %v, "ignoring non-numeric quote id");
                    None
                }
            })
            .collect())
    }

    async fn fetch_buying_order(
        &mut self,
    ) -> Result<(Option<String>, Option<VirtualFile<Vec<u8>>>), NavigatorError> {
        let link = Locator::css("#lnkOrdenCompra:not(.disabled)");
        if self.page.count(&Self::frame(), &link).await? == 0 {
            debug!("no buying order issued");
            return Ok((None, None));
        }
        debug!("buying order present; opening it");
        let mut popup = self
            .page
            .popup(&Self::frame(), &link, self.config.popup_timeout)
            .await?
            .ok_or(NavigatorError::PopupTimedOut { what: "buying order" })?;

        let result = async {
            let html = popup.content(&Scope::Page).await?;
            let pdf_button = Locator::css("#imgPDF");
            let pdf = if popup.count(&Scope::Page, &pdf_button).await? > 0 {
                let download = popup
                    .download(&Scope::Page, &DownloadTrigger::Click(pdf_button), self.config.download_timeout)
                    .await?
                    .ok_or(NavigatorError::DownloadTimedOut { what: "buying order PDF" })?;
                Some(VirtualFile::new(download.suggested_filename, download.bytes))
            } else {
                None
            };
            Ok::<_, NavigatorError>((Some(html), pdf))
        }
        .await;

        if let Err(err) = popup.close().await {
            debug!(%err, "closing buying order window");
        }
        result
    }

    async fn collect_listing(&mut self, idn: &str) -> Result<RawArtifactBundle, NavigatorError> {
        self.enter_section(Section::Agile).await?;
        let frame = Self::frame();
        let load = self.config.page_load_timeout;

        self.page.fill(&frame, &Locator::css("#txtIDQuote"), idn).await?;
        self.page.click(&frame, &Locator::button("Buscar ID")).await?;
        self.page.wait_for_load(&frame, load).await?;

        let detail_button = Locator::button_matching(DETAIL_BUTTON_RE.clone());
        if !self
            .page
            .wait_for(&frame, &detail_button, self.config.element_timeout)
            .await?
        {
            return Err(NavigatorError::ListingNotFound { idn: idn.to_string() });
        }
        let onclick = self
            .page
            .attributes(&frame, &detail_button, "onclick")
            .await?
            .into_iter()
            .flatten()
            .next()
            .unwrap_or_default();
        let target = DETAIL_ONCLICK_RE
            .captures(&onclick)
            .map(|caps| caps["url"].to_string())
            .ok_or_else(|| NavigatorError::UnexpectedPage(format!("detail button target {onclick:?}")))?;
        self.page.goto(&frame, &format!("{AGILE_URL_PREFIX}{target}")).await?;
        self.page.wait_for_load(&frame, load).await?;
        let detail_url = self.page.url(&frame).await?;
        debug!(url = %detail_url, "on listing detail");

        let mut bundle = RawArtifactBundle::new(idn, self.page.content(&frame).await?);

        bundle.provider_listing = self.download_export("provider listing").await?;
        if bundle.provider_listing.is_none() {
            debug!("no provider listing");
        }

        let (bo_html, bo_pdf) = self.fetch_buying_order().await?;
        bundle.buying_order_html = bo_html;
        bundle.buying_order_pdf = bo_pdf;

        let request_id = self
            .page
            .attributes(&frame, &Locator::css("#hdnIdSolicitud"), "value")
            .await?
            .into_iter()
            .flatten()
            .find_map(|v| v.trim().parse::<i64>().ok());
        if let Some(request_id) = request_id {
            if self.page.count(&frame, &Locator::css("#GvProvider")).await? > 0 {
                for quote_id in self.quote_ids("#GvProvider").await? {
                    if let Some(modal) = self.post_modal(idn, request_id, quote_id).await? {
                        bundle.modals.push(modal);
                    }
                }
            }
            if self.page.count(&frame, &Locator::css("#gvSeleccionado")).await? > 0 {
                debug!("provider already selected; fetching its detail");
                if let Some(quote_id) = self.quote_ids("#gvSeleccionado").await?.into_iter().next() {
                    bundle.selected_modal = self.post_modal(idn, request_id, quote_id).await?;
                }
            }
        }

        info!(
            idn,
            modals = bundle.modals.len(),
            selected = bundle.selected_modal.is_some(),
            buying_order = bundle.buying_order_html.is_some(),
            "listing retrieved"
        );
        Ok(bundle)
    }

    /// Releases the browser.
    pub async fn close(self) -> Result<(), NavigatorError> {
        self.page.close().await?;
        Ok(())
    }
}

#[async_trait]
impl ListingSource for MerPubNavigator {
    async fn search(&mut self, params: &SearchParams) -> Result<Option<VirtualFile<String>>, NavigatorError> {
        match self.run_search(params).await {
            Ok(export) => Ok(export),
            Err(err) => {
                self.capture_diagnostics("search").await;
                Err(err)
            }
        }
    }

    async fn fetch_listing(&mut self, idn: &str) -> Result<RawArtifactBundle, NavigatorError> {
        match self.collect_listing(idn).await {
            Ok(bundle) => Ok(bundle),
            Err(err) => {
                self.capture_diagnostics(idn).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use mps_storage::DumpPaths;

    use crate::browser::{Download, HttpReply};

    #[derive(Default)]
    struct RecordingDumps(Mutex<Vec<String>>);

    impl RecordingDumps {
        fn labels(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DumpSink for RecordingDumps {
        async fn dump(&self, label: &str, _screenshot: &[u8], _html: &str) -> anyhow::Result<Option<DumpPaths>> {
            self.0.lock().unwrap().push(label.to_string());
            Ok(None)
        }
    }

    /// Scripted portal: element presence is keyed by the locator's display form.
    #[derive(Default)]
    struct FakePortal {
        page_url: String,
        frame_url: String,
        logged_in: bool,
        blocked: bool,
        picker_on_submission: usize,
        submissions: usize,
        counts: HashMap<String, usize>,
        attributes: HashMap<(String, String), Vec<Option<String>>>,
        downloads: VecDeque<Download>,
        replies: VecDeque<HttpReply>,
        popup_page: Option<Box<FakePortal>>,
        html: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakePortal {
        fn logged_in() -> Self {
            Self {
                page_url: PORTAL_URL.into(),
                frame_url: AGILE_SEARCH_URL.into(),
                logged_in: true,
                ..Self::default()
            }
        }

        fn with_count(mut self, locator: &Locator, count: usize) -> Self {
            self.counts.insert(locator.to_string(), count);
            self
        }

        fn with_attribute(mut self, locator: &Locator, name: &str, values: &[&str]) -> Self {
            self.attributes.insert(
                (locator.to_string(), name.to_string()),
                values.iter().map(|v| Some(v.to_string())).collect(),
            );
            self
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl BrowserPage for FakePortal {
        async fn goto(&mut self, scope: &Scope, url: &str) -> Result<(), BrowserError> {
            self.record(format!("goto {url}"));
            match scope {
                Scope::Page if url == PORTAL_URL && !self.logged_in => self.page_url = HOME_URL.into(),
                Scope::Page => self.page_url = url.into(),
                Scope::Frame(_) => self.frame_url = url.into(),
            }
            Ok(())
        }

        async fn url(&mut self, scope: &Scope) -> Result<String, BrowserError> {
            Ok(match scope {
                Scope::Page => self.page_url.clone(),
                Scope::Frame(_) => self.frame_url.clone(),
            })
        }

        async fn wait_for_load(&mut self, _scope: &Scope, _timeout: Duration) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn count(&mut self, scope: &Scope, locator: &Locator) -> Result<usize, BrowserError> {
            let key = locator.to_string();
            if *scope == Scope::Page && key == ".swal2-container" {
                return Ok(usize::from(self.blocked));
            }
            Ok(self.counts.get(&key).copied().unwrap_or(0))
        }

        async fn wait_for(&mut self, scope: &Scope, locator: &Locator, _timeout: Duration) -> Result<bool, BrowserError> {
            if locator.to_string() == ".rdbOrganismo" {
                return Ok(self.picker_on_submission > 0 && self.submissions >= self.picker_on_submission);
            }
            Ok(self.count(scope, locator).await? > 0)
        }

        async fn click(&mut self, _scope: &Scope, locator: &Locator) -> Result<(), BrowserError> {
            let key = locator.to_string();
            self.record(format!("click {key}"));
            if key == Locator::link("ClaveÚnica").to_string() {
                self.page_url = format!("{IDENTITY_PROVIDER_PREFIX}openid/authorize");
            } else if key == Locator::button("Continuar").to_string() {
                self.submissions += 1;
                self.page_url = HOME_URL.into();
            } else if key == Locator::link("Ingresar").to_string() {
                self.logged_in = true;
                self.page_url = PORTAL_URL.into();
            } else if key == Locator::link("COMPRA ÁGIL").to_string() {
                self.frame_url = AGILE_SEARCH_URL.into();
            }
            Ok(())
        }

        async fn type_text(
            &mut self,
            _scope: &Scope,
            locator: &Locator,
            text: &str,
            _delay: Duration,
        ) -> Result<(), BrowserError> {
            self.record(format!("type {locator} {text}"));
            Ok(())
        }

        async fn fill(&mut self, _scope: &Scope, locator: &Locator, value: &str) -> Result<(), BrowserError> {
            self.record(format!("fill {locator} {value}"));
            Ok(())
        }

        async fn select_option(&mut self, _scope: &Scope, locator: &Locator, value: &str) -> Result<(), BrowserError> {
            self.record(format!("select {locator} {value}"));
            Ok(())
        }

        async fn press(&mut self, key: &str) -> Result<(), BrowserError> {
            self.record(format!("press {key}"));
            Ok(())
        }

        async fn attributes(
            &mut self,
            _scope: &Scope,
            locator: &Locator,
            name: &str,
        ) -> Result<Vec<Option<String>>, BrowserError> {
            Ok(self
                .attributes
                .get(&(locator.to_string(), name.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        async fn content(&mut self, _scope: &Scope) -> Result<String, BrowserError> {
            Ok(self.html.clone())
        }

        async fn evaluate(&mut self, _scope: &Scope, script: &str) -> Result<serde_json::Value, BrowserError> {
            self.record(format!("evaluate {script}"));
            Ok(serde_json::Value::Null)
        }

        async fn download(
            &mut self,
            _scope: &Scope,
            _trigger: &DownloadTrigger,
            _timeout: Duration,
        ) -> Result<Option<Download>, BrowserError> {
            Ok(self.downloads.pop_front())
        }

        async fn popup(
            &mut self,
            _scope: &Scope,
            _locator: &Locator,
            _timeout: Duration,
        ) -> Result<Option<Box<dyn BrowserPage>>, BrowserError> {
            Ok(self.popup_page.take().map(|p| p as Box<dyn BrowserPage>))
        }

        async fn post_json(
            &mut self,
            url: &str,
            _headers: &[(&str, &str)],
            body: &serde_json::Value,
        ) -> Result<HttpReply, BrowserError> {
            self.record(format!("post {url} {body}"));
            self.replies
                .pop_front()
                .ok_or_else(|| BrowserError::Script("no scripted reply".into()))
        }

        async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }

        async fn close(self: Box<Self>) -> Result<(), BrowserError> {
            self.record("close".into());
            Ok(())
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "12.345.678-5".parse().unwrap(),
            password: "hunter2".into(),
        }
    }

    fn fast_config(max_login_attempts: usize) -> NavigatorConfig {
        NavigatorConfig {
            max_login_attempts,
            login_backoff: BackoffPolicy {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            ..NavigatorConfig::default()
        }
    }

    fn navigator(page: FakePortal, max_login_attempts: usize) -> (MerPubNavigator, Arc<RecordingDumps>) {
        let dumps = Arc::new(RecordingDumps::default());
        let nav = MerPubNavigator::new(
            Box::new(page),
            credentials(),
            fast_config(max_login_attempts),
            dumps.clone(),
        );
        (nav, dumps)
    }

    fn log_of(page: &FakePortal) -> Arc<Mutex<Vec<String>>> {
        page.log.clone()
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let rendered = format!("{:?}", credentials());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }

    #[tokio::test]
    async fn blocked_account_is_fatal_and_dumped() {
        let page = FakePortal {
            blocked: true,
            picker_on_submission: 1,
            ..FakePortal::default()
        };
        let (mut nav, dumps) = navigator(page, 3);

        let err = nav.login().await.unwrap_err();
        assert!(matches!(err, NavigatorError::AccountBlocked));
        assert!(err.is_fatal());
        assert_eq!(nav.state(), SessionState::LoggedOut);
        assert_eq!(dumps.labels(), vec!["account-blocked".to_string()]);
    }

    #[tokio::test]
    async fn login_gives_up_after_bounded_attempts() {
        let page = FakePortal::default();
        let log = log_of(&page);
        let (mut nav, dumps) = navigator(page, 3);

        let err = nav.login().await.unwrap_err();
        assert!(matches!(err, NavigatorError::LoginAttemptsExhausted { attempts: 3 }));
        assert!(err.is_fatal());
        let submits = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.contains("Continuar"))
            .count();
        assert_eq!(submits, 3);
        assert_eq!(dumps.labels(), vec!["login-exhausted".to_string()]);
    }

    #[tokio::test]
    async fn login_retries_until_organism_picker_shows() {
        let page = FakePortal {
            picker_on_submission: 2,
            ..FakePortal::default()
        };
        let log = log_of(&page);
        let (mut nav, dumps) = navigator(page, 5);

        nav.login().await.unwrap();
        assert_eq!(nav.state(), SessionState::LoggedIn);
        assert!(dumps.labels().is_empty());
        let log = log.lock().unwrap();
        assert!(log.iter().any(|e| e == "type #uname 123456785"));
        assert_eq!(log.iter().filter(|e| e.contains("Continuar")).count(), 2);
    }

    #[tokio::test]
    async fn entering_section_logs_in_once() {
        let page = FakePortal {
            picker_on_submission: 1,
            ..FakePortal::default()
        };
        let log = log_of(&page);
        let (mut nav, _dumps) = navigator(page, 5);

        nav.enter_section(Section::Agile).await.unwrap();
        assert_eq!(nav.state(), SessionState::InSection(Section::Agile));
        nav.enter_section(Section::Agile).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|e| e.contains("Continuar")).count(), 1);
        assert_eq!(log.iter().filter(|e| e.contains("modalStepper")).count(), 1);
        assert_eq!(log.iter().filter(|e| e.contains("COMPRA ÁGIL")).count(), 1);
    }

    #[tokio::test]
    async fn search_types_dates_and_downloads_export() {
        let mut page = FakePortal::logged_in().with_count(&Locator::css("#lnkDownloadExcel"), 1);
        page.downloads.push_back(Download {
            suggested_filename: "BuscarCotizacion.xls".into(),
            bytes: b"<table></table>".to_vec(),
        });
        let log = log_of(&page);
        let (mut nav, _dumps) = navigator(page, 1);

        let params = SearchParams {
            from: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            until: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            status: Some(BidStatus::Closed),
        };
        let export = nav.search(&params).await.unwrap().unwrap();
        assert_eq!(export.filename, "BuscarCotizacion.xls");
        assert_eq!(export.content, "<table></table>");

        let log = log.lock().unwrap();
        assert!(log.iter().any(|e| e == "type #fdesde 01032024"));
        assert!(log.iter().any(|e| e == "type #fhasta 15032024"));
        let status_value = BidStatus::Closed.search_filter_value();
        assert!(log.iter().any(|e| *e == format!("select #ddlState {status_value}")));
    }

    #[tokio::test]
    async fn search_without_results_is_none() {
        let (mut nav, _dumps) = navigator(FakePortal::logged_in(), 1);
        let params = SearchParams {
            from: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            until: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            status: None,
        };
        assert!(nav.search(&params).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetches_full_listing_bundle() {
        let detail_button = Locator::button_matching(DETAIL_BUTTON_RE.clone());
        let provider_buttons = Locator::within("#GvProvider", Locator::button("Ver detalle"));
        let selected_buttons = Locator::within("#gvSeleccionado", Locator::button("Ver detalle"));

        let mut page = FakePortal::logged_in()
            .with_count(&detail_button, 1)
            .with_count(&Locator::css("#lnkDownloadExcel"), 1)
            .with_count(&Locator::css("#lnkOrdenCompra:not(.disabled)"), 1)
            .with_count(&Locator::css("#GvProvider"), 1)
            .with_count(&Locator::css("#gvSeleccionado"), 1)
            .with_attribute(
                &detail_button,
                "onclick",
                &["window.location='SeleccionProveedor.aspx?qs=a1b2';return false;"],
            )
            .with_attribute(&Locator::css("#hdnIdSolicitud"), "value", &["987"])
            .with_attribute(&provider_buttons, "data-qs2", &["11", "x", "12"])
            .with_attribute(&selected_buttons, "data-qs2", &["11"]);
        page.html = "<html>detalle</html>".into();

        let mut popup = FakePortal::default().with_count(&Locator::css("#imgPDF"), 1);
        popup.html = "<html>orden de compra</html>".into();
        popup.log = page.log.clone();
        popup.downloads.push_back(Download {
            suggested_filename: "OC_1234.pdf".into(),
            bytes: b"%PDF-1.4".to_vec(),
        });
        page.popup_page = Some(Box::new(popup));
        page.downloads.push_back(Download {
            suggested_filename: "ProveedoresCotizacionCAgil_2241-15-COT24.xls".into(),
            bytes: b"<table></table>".to_vec(),
        });
        page.replies.extend([
            HttpReply { status: 200, body: r#"{"d":"first"}"#.into() },
            HttpReply { status: 500, body: String::new() },
            HttpReply { status: 200, body: r#"{"d":"selected"}"#.into() },
        ]);
        let log = log_of(&page);
        let (mut nav, dumps) = navigator(page, 1);

        let bundle = nav.fetch_listing("2241-15-COT24").await.unwrap();
        assert_eq!(bundle.idn, "2241-15-COT24");
        assert_eq!(bundle.main_html, "<html>detalle</html>");
        assert_eq!(bundle.modals, vec![r#"{"d":"first"}"#.to_string()]);
        assert_eq!(bundle.selected_modal.as_deref(), Some(r#"{"d":"selected"}"#));
        assert_eq!(bundle.buying_order_html.as_deref(), Some("<html>orden de compra</html>"));
        assert_eq!(bundle.buying_order_pdf.unwrap().filename, "OC_1234.pdf");
        assert!(bundle.provider_listing.is_some());
        assert!(dumps.labels().is_empty());

        let log = log.lock().unwrap();
        assert!(log
            .iter()
            .any(|e| *e == format!("goto {AGILE_URL_PREFIX}SeleccionProveedor.aspx?qs=a1b2")));
        let posts: Vec<_> = log.iter().filter(|e| e.starts_with("post ")).collect();
        assert_eq!(posts.len(), 3);
        assert!(posts[0].contains(r#""idSolicitud":987"#));
        assert!(posts[0].contains(r#""idCotizacion":11"#));
        assert!(log.iter().any(|e| e == "close"));
    }

    #[tokio::test]
    async fn missing_listing_is_dumped_but_not_fatal() {
        let (mut nav, dumps) = navigator(FakePortal::logged_in(), 1);
        let err = nav.fetch_listing("1-1-COT24").await.unwrap_err();
        assert!(matches!(err, NavigatorError::ListingNotFound { ref idn } if idn == "1-1-COT24"));
        assert!(!err.is_fatal());
        assert_eq!(dumps.labels(), vec!["1-1-COT24".to_string()]);
    }
}
