/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * A stand-in for the DevTools endpoint of a single tab, for use in tests.
 *
 * Runtime.evaluate is answered by a caller-supplied function of the
 * expression.  The navigation marker is tracked the way a real page would
 * track it: a Page.navigate, or a click, replaces the document and so clears
 * the marker.  An event is sent ahead of every response, and every command
 * received is recorded for later inspection.
 */

use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use slog::Logger;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::page::NAV_MARKER;
use crate::{Page, Result};

/**
 * The "result" of a command, or a protocol error code and message.
 */
pub type Reply = std::result::Result<Value, (i64, String)>;

/**
 * An evaluation that produced this value.
 */
pub fn value(v: Value) -> Reply {
    Ok(json!({ "result": { "type": "object", "value": v } }))
}

/**
 * An evaluation that threw.
 */
pub fn thrown(description: &str) -> Reply {
    Ok(json!({
        "result": { "type": "object", "subtype": "error" },
        "exceptionDetails": {
            "text": "Uncaught",
            "exception": { "description": description },
        },
    }))
}

#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub params: Value,
}

impl Call {
    pub fn expression(&self) -> Option<&str> {
        self.params.get("expression").and_then(Value::as_str)
    }

    pub fn url(&self) -> Option<&str> {
        self.params.get("url").and_then(Value::as_str)
    }
}

pub struct FakeTarget {
    url: String,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeTarget {
    /**
     * Listen for a single devtools connection.  Navigating to any URL that
     * contains "unreachable" fails the way Chromium reports DNS failures.
     */
    pub async fn start<F>(mut eval: F) -> FakeTarget
    where
        F: FnMut(&str) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!(
            "ws://{}/devtools/page/FAKE",
            listener.local_addr().unwrap()
        );
        let calls = Arc::new(Mutex::new(Vec::new()));
        let rec = Arc::clone(&calls);

        tokio::spawn(async move {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = accept_async(sock).await else {
                return;
            };

            let mut stale = false;
            while let Some(Ok(msg)) = ws.next().await {
                let txt = match msg {
                    Message::Text(txt) => txt,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(req) = serde_json::from_str::<Value>(&txt) else {
                    break;
                };

                let call = Call {
                    method: req["method"].as_str().unwrap_or("").to_string(),
                    params: req["params"].clone(),
                };
                rec.lock().unwrap().push(call.clone());

                let reply = match call.method.as_str() {
                    "Runtime.evaluate" => {
                        let expr = call.expression().unwrap_or("");
                        if expr.contains(&format!("{NAV_MARKER} = true")) {
                            stale = true;
                            value(json!(true))
                        } else if expr.contains(NAV_MARKER) {
                            value(json!(!stale))
                        } else {
                            let r = eval(expr);
                            if expr.contains("e.click()") {
                                stale = false;
                            }
                            r
                        }
                    }
                    "Page.navigate" => {
                        if call.url().unwrap_or("").contains("unreachable") {
                            Ok(json!({
                                "frameId": "F1",
                                "errorText": "net::ERR_NAME_NOT_RESOLVED",
                            }))
                        } else {
                            stale = false;
                            Ok(json!({ "frameId": "F1", "loaderId": "L1" }))
                        }
                    }
                    m => Err((-32601, format!("'{m}' wasn't found"))),
                };

                let event = json!({
                    "method": "Page.lifecycleEvent",
                    "params": { "frameId": "F1", "name": "load" },
                });
                let res = match reply {
                    Ok(result) => json!({ "id": req["id"], "result": result }),
                    Err((code, message)) => json!({
                        "id": req["id"],
                        "error": { "code": code, "message": message },
                    }),
                };

                if ws.send(Message::Text(event.to_string())).await.is_err()
                    || ws.send(Message::Text(res.to_string())).await.is_err()
                {
                    break;
                }
            }
        });

        FakeTarget { url, calls }
    }

    pub async fn page(&self, log: &Logger) -> Result<Page> {
        Page::connect(log, &self.url).await
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /**
     * Every expression evaluated, other than those that manage the
     * navigation marker.
     */
    pub fn evaluated(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(Call::expression)
            .filter(|e| !e.contains(NAV_MARKER))
            .map(str::to_string)
            .collect()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.method == "Page.navigate")
            .filter_map(Call::url)
            .map(str::to_string)
            .collect()
    }
}
