//! [`BrowserPage`] backed by a Chromium instance driven over CDP.
//!
//! Element lookups run as injected JavaScript so that the same locator code
//! works on the top-level document and inside named frames.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::browser::{
    BrowserError, BrowserPage, Download, DownloadTrigger, HttpReply, Locator, Role, Scope, TextMatch,
};

const POLL_INTERVAL: Duration = Duration::from_millis(150);
const PARTIAL_DOWNLOAD_SUFFIX: &str = ".crdownload";

/// Resolves a locator spec to elements. `spec` is produced by [`locator_spec`].
const FIND_JS: &str = r#"(root, spec) => {
  const norm = s => (s || '').replace(/\s+/g, ' ').trim();
  const nameOf = el => norm(el.getAttribute('aria-label') || el.innerText || el.textContent || el.value || el.getAttribute('title'));
  const matches = (text, m) => m.pattern !== undefined
    ? new RegExp(m.pattern).test(text)
    : text.toLowerCase().includes(m.exact.toLowerCase());
  const find = (root, spec) => {
    switch (spec.kind) {
      case 'css':
        return Array.from(root.querySelectorAll(spec.selector));
      case 'role': {
        const sel = spec.role === 'button'
          ? 'button, input[type=button], input[type=submit], input[type=reset], [role=button]'
          : 'a, [role=link]';
        return Array.from(root.querySelectorAll(sel)).filter(el => matches(nameOf(el), spec.name));
      }
      case 'text': {
        const all = Array.from(root.querySelectorAll('*'))
          .filter(el => !['SCRIPT', 'STYLE', 'HTML', 'HEAD'].includes(el.tagName))
          .filter(el => norm(el.textContent).includes(spec.text));
        return all.filter(el => !all.some(other => other !== el && el.contains(other)));
      }
      case 'within':
        return Array.from(root.querySelectorAll(spec.container)).flatMap(c => find(c, spec.inner));
    }
    return [];
  };
  return find(root, spec);
}"#;

fn cdp(err: CdpError) -> BrowserError {
    BrowserError::Protocol(err.to_string())
}

fn target_key(page: &Page) -> String {
    let id: &str = page.target_id().as_ref();
    id.to_string()
}

fn js_str(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

fn locator_spec(locator: &Locator) -> Value {
    match locator {
        Locator::Css(selector) => json!({ "kind": "css", "selector": selector }),
        Locator::Role { role, name } => {
            let role = match role {
                Role::Button => "button",
                Role::Link => "link",
            };
            let name = match name {
                TextMatch::Exact(text) => json!({ "exact": text }),
                TextMatch::Pattern(re) => json!({ "pattern": re.as_str() }),
            };
            json!({ "kind": "role", "role": role, "name": name })
        }
        Locator::Text(text) => json!({ "kind": "text", "text": text }),
        Locator::Within { container, inner } => {
            json!({ "kind": "within", "container": container, "inner": locator_spec(inner) })
        }
    }
}

/// Wraps `body` in an async function with `win`, `doc` and `find` bound to the scope.
fn scoped(scope: &Scope, body: &str) -> String {
    let win = match scope {
        Scope::Page => "window".to_string(),
        Scope::Frame(name) => format!("window.frames[{}]", js_str(name)),
    };
    format!(
        "(async () => {{ const win = {win}; if (!win) throw new Error('frame not attached'); \
         const doc = win.document; const find = {FIND_JS}; {body} }})()"
    )
}

/// Finds a Chromium binary: the explicit path first, then the usual names on `PATH`.
pub fn find_chromium(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "configured Chromium binary does not exist");
    }
    ["google-chrome", "chromium", "chromium-browser"]
        .into_iter()
        .find_map(|name| which::which(name).ok())
}

#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    pub executable: Option<PathBuf>,
    pub headless: bool,
    /// Where the browser drops downloaded files.
    pub download_dir: PathBuf,
}

pub struct ChromiumPage {
    page: Page,
    browser: Arc<Mutex<Browser>>,
    download_dir: PathBuf,
    /// Set on the page that launched the browser; closing it shuts the browser down.
    handler: Option<JoinHandle<()>>,
}

impl ChromiumPage {
    pub async fn launch(options: ChromiumOptions) -> Result<Self, BrowserError> {
        let executable = find_chromium(options.executable.as_deref())
            .ok_or_else(|| BrowserError::Disconnected("no Chromium binary found".into()))?;
        tokio::fs::create_dir_all(&options.download_dir).await?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(executable)
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-gpu");
        if !options.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Disconnected)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Disconnected(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(%err, "browser handler event error");
                }
            }
        });

        let behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(options.download_dir.to_string_lossy().into_owned())
            .build()
            .map_err(BrowserError::Protocol)?;
        browser.execute(behavior).await.map_err(cdp)?;

        let page = browser.new_page("about:blank").await.map_err(cdp)?;
        Ok(Self {
            page,
            browser: Arc::new(Mutex::new(browser)),
            download_dir: options.download_dir,
            handler: Some(handler),
        })
    }

    async fn eval(&self, script: String) -> Result<Value, BrowserError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BrowserError::Script)?;
        let result = self.page.evaluate_expression(params).await.map_err(cdp)?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn eval_scoped(&self, scope: &Scope, body: &str) -> Result<Value, BrowserError> {
        self.eval(scoped(scope, body)).await
    }

    /// Runs `action` on the first match; errors with `NotFound` if there is none.
    async fn on_first(&self, scope: &Scope, locator: &Locator, action: &str) -> Result<(), BrowserError> {
        let body = format!(
            "const el = find(doc, {spec})[0]; if (!el) return false; {action}; return true;",
            spec = locator_spec(locator)
        );
        match self.eval_scoped(scope, &body).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(BrowserError::NotFound(locator.to_string())),
        }
    }

    async fn key(&self, kind: DispatchKeyEventType, key: &str, text: Option<&str>, code: Option<i64>) -> Result<(), BrowserError> {
        let mut builder = DispatchKeyEventParams::builder().r#type(kind).key(key);
        if let Some(text) = text {
            builder = builder.text(text);
        }
        if let Some(code) = code {
            builder = builder.code(key).windows_virtual_key_code(code);
        }
        let params = builder.build().map_err(BrowserError::Protocol)?;
        self.page.execute(params).await.map_err(cdp)?;
        Ok(())
    }

    async fn download_names(&self) -> Result<HashSet<String>, BrowserError> {
        let mut names = HashSet::new();
        let mut entries = tokio::fs::read_dir(&self.download_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn target_ids(&self) -> Result<HashSet<String>, BrowserError> {
        let browser = self.browser.lock().await;
        let pages = browser.pages().await.map_err(cdp)?;
        Ok(pages.iter().map(target_key).collect())
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn goto(&mut self, scope: &Scope, url: &str) -> Result<(), BrowserError> {
        match scope {
            Scope::Page => {
                self.page.goto(url).await.map_err(cdp)?;
            }
            Scope::Frame(_) => {
                self.eval_scoped(scope, &format!("win.location.href = {}; return true;", js_str(url)))
                    .await?;
                sleep(POLL_INTERVAL).await;
            }
        }
        Ok(())
    }

    async fn url(&mut self, scope: &Scope) -> Result<String, BrowserError> {
        match scope {
            Scope::Page => Ok(self.page.url().await.map_err(cdp)?.unwrap_or_default()),
            Scope::Frame(_) => {
                let value = self.eval_scoped(scope, "return win.location.href;").await?;
                Ok(value.as_str().unwrap_or_default().to_string())
            }
        }
    }

    async fn wait_for_load(&mut self, scope: &Scope, limit: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + limit;
        sleep(POLL_INTERVAL).await;
        loop {
            // Navigation in flight detaches the context; keep polling.
            if let Ok(Value::String(state)) = self.eval_scoped(scope, "return doc.readyState;").await {
                if state == "complete" {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    what: format!("{scope:?} to load"),
                    after: limit,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn count(&mut self, scope: &Scope, locator: &Locator) -> Result<usize, BrowserError> {
        let body = format!("return find(doc, {}).length;", locator_spec(locator));
        let value = self.eval_scoped(scope, &body).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn wait_for(&mut self, scope: &Scope, locator: &Locator, limit: Duration) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + limit;
        loop {
            if self.count(scope, locator).await.unwrap_or(0) > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn click(&mut self, scope: &Scope, locator: &Locator) -> Result<(), BrowserError> {
        self.on_first(
            scope,
            locator,
            "if (el.scrollIntoView) el.scrollIntoView({ block: 'center' }); el.click()",
        )
        .await
    }

    async fn type_text(
        &mut self,
        scope: &Scope,
        locator: &Locator,
        text: &str,
        delay: Duration,
    ) -> Result<(), BrowserError> {
        self.on_first(scope, locator, "el.focus()").await?;
        for ch in text.chars() {
            let ch = ch.to_string();
            self.key(DispatchKeyEventType::KeyDown, &ch, Some(&ch), None).await?;
            self.key(DispatchKeyEventType::KeyUp, &ch, None, None).await?;
            sleep(delay).await;
        }
        Ok(())
    }

    async fn fill(&mut self, scope: &Scope, locator: &Locator, value: &str) -> Result<(), BrowserError> {
        let action = format!(
            "el.focus(); el.value = {}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }}))",
            js_str(value)
        );
        self.on_first(scope, locator, &action).await
    }

    async fn select_option(&mut self, scope: &Scope, locator: &Locator, value: &str) -> Result<(), BrowserError> {
        let action = format!(
            "el.value = {}; el.dispatchEvent(new Event('change', {{ bubbles: true }})); el.focus()",
            js_str(value)
        );
        self.on_first(scope, locator, &action).await
    }

    async fn press(&mut self, key: &str) -> Result<(), BrowserError> {
        let code = match key {
            "Tab" => 9,
            "Enter" => 13,
            "Escape" => 27,
            _ => 0,
        };
        self.key(DispatchKeyEventType::RawKeyDown, key, None, Some(code)).await?;
        self.key(DispatchKeyEventType::KeyUp, key, None, Some(code)).await
    }

    async fn attributes(
        &mut self,
        scope: &Scope,
        locator: &Locator,
        name: &str,
    ) -> Result<Vec<Option<String>>, BrowserError> {
        let body = format!(
            "return find(doc, {}).map(el => el.getAttribute({}));",
            locator_spec(locator),
            js_str(name)
        );
        let value = self.eval_scoped(scope, &body).await?;
        Ok(value
            .as_array()
            .map(|items| items.iter().map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    async fn content(&mut self, scope: &Scope) -> Result<String, BrowserError> {
        match scope {
            Scope::Page => self.page.content().await.map_err(cdp),
            Scope::Frame(_) => {
                let value = self.eval_scoped(scope, "return doc.documentElement.outerHTML;").await?;
                Ok(value.as_str().unwrap_or_default().to_string())
            }
        }
    }

    async fn evaluate(&mut self, scope: &Scope, script: &str) -> Result<Value, BrowserError> {
        self.eval_scoped(scope, &format!("return win.eval({});", js_str(script))).await
    }

    async fn download(
        &mut self,
        scope: &Scope,
        trigger: &DownloadTrigger,
        limit: Duration,
    ) -> Result<Option<Download>, BrowserError> {
        let before = self.download_names().await?;
        match trigger {
            DownloadTrigger::Script(script) => {
                self.evaluate(scope, script).await?;
            }
            DownloadTrigger::Click(locator) => self.click(scope, locator).await?,
        }

        let deadline = Instant::now() + limit;
        loop {
            let done = self
                .download_names()
                .await?
                .into_iter()
                .find(|name| !before.contains(name) && !name.ends_with(PARTIAL_DOWNLOAD_SUFFIX));
            if let Some(name) = done {
                let path = self.download_dir.join(&name);
                let bytes = tokio::fs::read(&path).await?;
                let _ = tokio::fs::remove_file(&path).await;
                debug!(file = %name, size = bytes.len(), "download finished");
                return Ok(Some(Download {
                    suggested_filename: name,
                    bytes,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn popup(
        &mut self,
        scope: &Scope,
        locator: &Locator,
        limit: Duration,
    ) -> Result<Option<Box<dyn BrowserPage>>, BrowserError> {
        let before = self.target_ids().await?;
        self.click(scope, locator).await?;

        let deadline = Instant::now() + limit;
        loop {
            let opened = {
                let browser = self.browser.lock().await;
                browser
                    .pages()
                    .await
                    .map_err(cdp)?
                    .into_iter()
                    .find(|p| !before.contains(&target_key(p)))
            };
            if let Some(page) = opened {
                let mut popup = ChromiumPage {
                    page,
                    browser: Arc::clone(&self.browser),
                    download_dir: self.download_dir.clone(),
                    handler: None,
                };
                popup.wait_for_load(&Scope::Page, deadline.saturating_duration_since(Instant::now()).max(POLL_INTERVAL)).await?;
                return Ok(Some(Box::new(popup)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn post_json(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &Value,
    ) -> Result<HttpReply, BrowserError> {
        let headers: serde_json::Map<String, Value> = headers
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        let script = format!(
            "const r = await fetch({url}, {{ method: 'POST', credentials: 'include', headers: {headers}, body: {body} }}); \
             return {{ status: r.status, body: await r.text() }};",
            url = js_str(url),
            headers = Value::Object(headers),
            body = js_str(&body.to_string()),
        );
        let value = self.eval_scoped(&Scope::Page, &script).await?;
        Ok(HttpReply {
            status: value.get("status").and_then(Value::as_u64).unwrap_or(0) as u16,
            body: value
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(cdp)
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        let ChromiumPage {
            page,
            browser,
            handler,
            ..
        } = *self;
        if let Err(err) = page.close().await {
            debug!(%err, "page already closed");
        }
        if let Some(handler) = handler {
            let mut browser = browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(%err, "closing browser");
            }
            let _ = timeout(Duration::from_secs(5), browser.wait()).await;
            handler.abort();
        }
        Ok(())
    }
}
