/*
 * Copyright 2024 Oxide Computer Company
 */

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use jenkrun_common::sleep_ms;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, o, trace, Logger};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::locator::js_str;
use crate::{BrowserError, Locator, Result};

const POLL_INTERVAL_MS: u64 = 250;

/*
 * Set on the window object before an action that should load a new document,
 * so that we can tell when the old document is gone.
 */
pub(crate) const NAV_MARKER: &str = "__jenkrun_stale";

#[derive(Debug, Serialize)]
struct CdpRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CdpErrorBody {
    code: i64,
    message: String,
}

/*
 * Both command responses (with an "id") and unsolicited events (with a
 * "method") arrive on the same socket.
 */
#[derive(Debug, Deserialize)]
struct CdpIncoming {
    id: Option<u64>,
    method: Option<String>,
    result: Option<Value>,
    error: Option<CdpErrorBody>,
}

/**
 * Pull a useful message out of the "exceptionDetails" object that
 * Runtime.evaluate returns when the script throws.
 */
fn exception_message(details: &Value) -> String {
    details
        .pointer("/exception/description")
        .and_then(Value::as_str)
        .or_else(|| details.get("text").and_then(Value::as_str))
        .unwrap_or("unknown exception")
        .to_string()
}

/**
 * A single browser tab, driven over its devtools websocket.  Commands are
 * issued one at a time; events that arrive while we wait for a response are
 * discarded.
 */
pub struct Page {
    log: Logger,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl Page {
    pub(crate) async fn connect(log: &Logger, url: &str) -> Result<Page> {
        let log = log.new(o!("page" => url.to_string()));
        let (ws, _) = connect_async(url).await?;
        debug!(log, "connected to page target");

        Ok(Page { log, ws, next_id: 1 })
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let req = serde_json::to_string(&CdpRequest { id, method, params })?;
        trace!(self.log, "devtools send"; "id" => id, "method" => method);
        self.ws.send(Message::Text(req)).await?;

        loop {
            let msg = match self.ws.next().await {
                Some(msg) => msg?,
                None => return Err(BrowserError::Closed),
            };

            let txt = match msg {
                Message::Text(txt) => txt,
                Message::Close(_) => return Err(BrowserError::Closed),
                _ => continue,
            };

            let inc: CdpIncoming = serde_json::from_str(&txt)?;
            if inc.id != Some(id) {
                if let Some(m) = inc.method.as_deref() {
                    trace!(self.log, "devtools event"; "method" => m);
                }
                continue;
            }

            if let Some(e) = inc.error {
                return Err(BrowserError::Protocol {
                    method: method.to_string(),
                    code: e.code,
                    message: e.message,
                });
            }

            return Ok(inc.result.unwrap_or(Value::Null));
        }
    }

    /**
     * Evaluate an expression in the page and return its value.  Promises are
     * awaited.
     */
    pub async fn evaluate(&mut self, expr: &str) -> Result<Value> {
        let res = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expr,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = res.get("exceptionDetails") {
            return Err(BrowserError::Script(exception_message(details)));
        }

        Ok(res.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    /**
     * Poll an expression until it evaluates to true.  Evaluation failures
     * are expected while a navigation is underway and do not end the wait.
     * With no timeout, this waits forever.
     */
    pub async fn wait_for(
        &mut self,
        what: &str,
        expr: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let start = Instant::now();
        debug!(self.log, "waiting for {what}";
            "timeout" => ?timeout);

        loop {
            match self.evaluate(expr).await {
                Ok(Value::Bool(true)) => return Ok(()),
                Ok(_) => (),
                Err(e) if e.is_transient() => {
                    trace!(self.log, "waiting for {what}: {e}");
                }
                Err(e) => return Err(e),
            }

            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(BrowserError::Timeout {
                        what: what.to_string(),
                        after: timeout,
                    });
                }
            }

            sleep_ms(POLL_INTERVAL_MS).await;
        }
    }

    async fn mark_document(&mut self) -> Result<()> {
        self.evaluate(&format!("window.{NAV_MARKER} = true")).await?;
        Ok(())
    }

    async fn wait_for_new_document(
        &mut self,
        what: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let expr = format!(
            "window.{NAV_MARKER} === undefined && \
            document.readyState === 'complete'"
        );
        self.wait_for(what, &expr, timeout).await
    }

    /**
     * Load a URL and wait for the new document to finish loading.
     */
    pub async fn navigate(
        &mut self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        debug!(self.log, "navigate"; "url" => url);

        self.mark_document().await?;
        let res = self.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(reason) = res.get("errorText").and_then(Value::as_str) {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: reason.to_string(),
            });
        }

        self.wait_for_new_document(&format!("load of {url}"), timeout).await
    }

    /**
     * Run a function body against the located element, failing if there is
     * no such element.
     */
    async fn with_element(
        &mut self,
        locator: &Locator,
        body: &str,
    ) -> Result<Value> {
        match self.evaluate(&locator.with_js(body)).await? {
            Value::Null => Err(BrowserError::NoElement(locator.to_string())),
            v => Ok(v),
        }
    }

    /**
     * Wait until the element exists, is rendered and is enabled.
     */
    pub async fn wait_ready(
        &mut self,
        locator: &Locator,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.wait_for(&locator.to_string(), &locator.ready_js(), timeout).await
    }

    pub async fn click(&mut self, locator: &Locator) -> Result<()> {
        debug!(self.log, "click"; "element" => %locator);
        self.with_element(
            locator,
            "e.scrollIntoView({ block: 'center' }); e.click(); return true;",
        )
        .await?;
        Ok(())
    }

    /**
     * Click an element that submits a form or follows a link, and wait for
     * the resulting page to load.
     */
    pub async fn click_and_wait(
        &mut self,
        locator: &Locator,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.mark_document().await?;
        self.click(locator).await?;
        self.wait_for_new_document(&format!("page after {locator}"), timeout)
            .await
    }

    /**
     * Replace the value of a text input or textarea, firing the events a
     * user typing would produce.
     */
    pub async fn fill(&mut self, locator: &Locator, value: &str) -> Result<()> {
        debug!(self.log, "fill"; "element" => %locator, "len" => value.len());
        let body = format!(
            "e.focus();\
            const proto = e instanceof HTMLTextAreaElement ? \
                HTMLTextAreaElement.prototype : HTMLInputElement.prototype;\
            Object.getOwnPropertyDescriptor(proto, 'value')\
                .set.call(e, {});\
            e.dispatchEvent(new Event('input', {{ bubbles: true }}));\
            e.dispatchEvent(new Event('change', {{ bubbles: true }}));\
            return true;",
            js_str(value)
        );
        self.with_element(locator, &body).await?;
        Ok(())
    }

    /**
     * Choose an option of a select element by its value or, failing that,
     * by its label.
     */
    pub async fn select_option(
        &mut self,
        locator: &Locator,
        option: &str,
    ) -> Result<()> {
        debug!(self.log, "select"; "element" => %locator, "option" => option);
        let body = format!(
            "const want = {};\
            const o = Array.from(e.options).find((o) => o.value === want) || \
                Array.from(e.options).find((o) => o.label.trim() === want);\
            if (!o) return false;\
            e.value = o.value;\
            e.dispatchEvent(new Event('input', {{ bubbles: true }}));\
            e.dispatchEvent(new Event('change', {{ bubbles: true }}));\
            return true;",
            js_str(option)
        );

        match self.with_element(locator, &body).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(BrowserError::NoOption {
                locator: locator.to_string(),
                option: option.to_string(),
            }),
        }
    }

    /**
     * The text content of the element, including text that is not rendered.
     */
    pub async fn text_content(&mut self, locator: &Locator) -> Result<String> {
        let v = self
            .with_element(locator, "return e.textContent || '';")
            .await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    /**
     * The resolved (absolute) target of a link, if the link exists.
     */
    pub async fn link_target(
        &mut self,
        locator: &Locator,
    ) -> Result<Option<String>> {
        let v = self.evaluate(&locator.with_js("return e.href || null;")).await?;
        Ok(v.as_str().map(str::to_string))
    }

    pub async fn scroll_to_bottom(&mut self) -> Result<()> {
        self.evaluate("window.scrollBy(0, document.body.scrollHeight)").await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{thrown, value, FakeTarget};

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn response_and_event_parse() {
        let resp: CdpIncoming = serde_json::from_str(
            r#"{"id":7,"result":{"result":{"type":"boolean","value":true}}}"#,
        )
        .unwrap();
        assert_eq!(resp.id, Some(7));
        assert!(resp.error.is_none());
        assert_eq!(
            resp.result.unwrap().pointer("/result/value"),
            Some(&Value::Bool(true))
        );

        let ev: CdpIncoming = serde_json::from_str(
            r#"{"method":"Page.frameNavigated","params":{"frame":{}}}"#,
        )
        .unwrap();
        assert_eq!(ev.id, None);
        assert_eq!(ev.method.as_deref(), Some("Page.frameNavigated"));

        let err: CdpIncoming = serde_json::from_str(
            r#"{"id":3,"error":{"code":-32000,"message":"Cannot navigate"}}"#,
        )
        .unwrap();
        let e = err.error.unwrap();
        assert_eq!(e.code, -32000);
        assert_eq!(e.message, "Cannot navigate");
    }

    #[test]
    fn request_shape() {
        let req = CdpRequest {
            id: 1,
            method: "Page.navigate",
            params: json!({ "url": "about:blank" }),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "id": 1,
                "method": "Page.navigate",
                "params": { "url": "about:blank" },
            })
        );
    }

    #[test]
    fn exception_messages() {
        let data = &[
            (
                json!({
                    "text": "Uncaught",
                    "exception": { "description": "TypeError: x is null" },
                }),
                "TypeError: x is null",
            ),
            (json!({ "text": "Uncaught" }), "Uncaught"),
            (json!({}), "unknown exception"),
        ];

        for (details, want) in data {
            assert_eq!(exception_message(details), *want);
        }
    }

    #[tokio::test]
    async fn evaluate_skips_events() {
        let fake = FakeTarget::start(|_| value(json!(42))).await;
        let mut page = fake.page(&log()).await.unwrap();

        assert_eq!(page.evaluate("6 * 7").await.unwrap(), json!(42));
        assert_eq!(page.evaluate("40 + 2").await.unwrap(), json!(42));
        assert_eq!(fake.evaluated(), vec!["6 * 7", "40 + 2"]);
    }

    #[tokio::test]
    async fn protocol_and_script_errors() {
        let fake =
            FakeTarget::start(|_| thrown("TypeError: e is undefined")).await;
        let mut page = fake.page(&log()).await.unwrap();

        match page.call("Bogus.method", json!({})).await {
            Err(BrowserError::Protocol { method, code, .. }) => {
                assert_eq!(method, "Bogus.method");
                assert_eq!(code, -32601);
            }
            other => panic!("unexpected result {other:?}"),
        }

        match page.evaluate("e.value").await {
            Err(BrowserError::Script(msg)) => {
                assert_eq!(msg, "TypeError: e is undefined");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_deadline() {
        let fake = FakeTarget::start(|_| value(json!(false))).await;
        let mut page = fake.page(&log()).await.unwrap();

        let e = page
            .wait_for("never", "false", Some(Duration::from_millis(600)))
            .await
            .unwrap_err();
        assert!(e.is_timeout(), "{e}");
        assert!(fake.evaluated().len() >= 2);
    }

    #[tokio::test]
    async fn wait_for_polls_through_exceptions() {
        let mut n = 0;
        let fake = FakeTarget::start(move |_| {
            n += 1;
            match n {
                1 | 2 => thrown("Execution context was destroyed."),
                3 => value(json!(false)),
                _ => value(json!(true)),
            }
        })
        .await;
        let mut page = fake.page(&log()).await.unwrap();

        page.wait_for("ready", "ready()", None).await.unwrap();
        assert_eq!(fake.evaluated().len(), 4);
    }

    #[tokio::test]
    async fn fill_and_select() {
        let fake = FakeTarget::start(|expr| {
            if expr.contains("const want = \"ghost-service\"") {
                value(json!(false))
            } else if expr.contains("#missing") {
                value(Value::Null)
            } else {
                value(json!(true))
            }
        })
        .await;
        let mut page = fake.page(&log()).await.unwrap();

        let ta = Locator::css("textarea[name=\"value\"]");
        page.fill(&ta, "puts 'hi'\nCompany.where(x: \"y\")").await.unwrap();
        let filled = fake.evaluated().pop().unwrap();
        assert!(
            filled.contains(r#""puts 'hi'\nCompany.where(x: \"y\")""#),
            "{filled}"
        );

        let sel = Locator::css("select");
        page.select_option(&sel, "sakani-partners-service").await.unwrap();
        match page.select_option(&sel, "ghost-service").await {
            Err(BrowserError::NoOption { option, .. }) => {
                assert_eq!(option, "ghost-service");
            }
            other => panic!("unexpected result {other:?}"),
        }

        match page.click(&Locator::css("#missing")).await {
            Err(BrowserError::NoElement(what)) => {
                assert_eq!(what, "css \"#missing\"");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn navigation_waits_for_new_document() {
        let fake = FakeTarget::start(|_| value(json!(true))).await;
        let mut page = fake.page(&log()).await.unwrap();

        page.navigate("https://j/login", None).await.unwrap();
        page.click_and_wait(&Locator::button("Sign in"), None).await.unwrap();

        let methods = fake
            .calls()
            .iter()
            .map(|c| match c.expression() {
                Some(e) if e.ends_with(&format!("{NAV_MARKER} = true")) => {
                    "mark"
                }
                Some(e) if e.contains(NAV_MARKER) => "check",
                Some(e) if e.contains("e.click()") => "click",
                _ => c.method.as_str(),
            })
            .map(str::to_string)
            .collect::<Vec<_>>();
        assert_eq!(
            methods,
            vec!["mark", "Page.navigate", "check", "mark", "click", "check"]
        );
        assert_eq!(fake.navigations(), vec!["https://j/login"]);
    }

    #[tokio::test]
    async fn navigation_error() {
        let fake = FakeTarget::start(|_| value(json!(true))).await;
        let mut page = fake.page(&log()).await.unwrap();

        match page.navigate("http://unreachable/", None).await {
            Err(BrowserError::Navigation { url, reason }) => {
                assert_eq!(url, "http://unreachable/");
                assert_eq!(reason, "net::ERR_NAME_NOT_RESOLVED");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_document_times_out() {
        let fake = FakeTarget::start(|_| value(json!(true))).await;
        let mut page = fake.page(&log()).await.unwrap();

        page.mark_document().await.unwrap();
        let e = page
            .wait_for_new_document("reload", Some(Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(e.is_timeout(), "{e}");
    }
}
