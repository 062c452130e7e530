/*
 * Copyright 2024 Oxide Computer Company
 */

use std::fmt;

/**
 * Ways of finding an element in the page.  Each is rendered into a
 * JavaScript expression that evaluates to the first matching element, or
 * null.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A CSS selector, as for document.querySelector().
    Css(String),
    /// A form control by the text of its label.
    Label(String),
    /// A button by its visible name.
    Button(String),
    /// A link whose text contains the given string.
    Link(String),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css {s:?}"),
            Locator::Label(s) => write!(f, "label {s:?}"),
            Locator::Button(s) => write!(f, "button {s:?}"),
            Locator::Link(s) => write!(f, "link {s:?}"),
        }
    }
}

/**
 * Render a string as a JavaScript string literal.  JSON string syntax is a
 * subset of JavaScript, so this takes care of all the quoting.
 */
pub(crate) fn js_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

impl Locator {
    pub fn css<S: Into<String>>(s: S) -> Locator {
        Locator::Css(s.into())
    }

    pub fn label<S: Into<String>>(s: S) -> Locator {
        Locator::Label(s.into())
    }

    pub fn button<S: Into<String>>(s: S) -> Locator {
        Locator::Button(s.into())
    }

    pub fn link<S: Into<String>>(s: S) -> Locator {
        Locator::Link(s.into())
    }

    /**
     * Produce an expression that evaluates to the element, or null.
     */
    pub fn find_js(&self) -> String {
        match self {
            Locator::Css(sel) => {
                format!("document.querySelector({})", js_str(sel))
            }
            Locator::Label(name) => format!(
                "(() => {{\
                    const want = {}.trim().toLowerCase();\
                    for (const l of document.querySelectorAll('label')) {{\
                        if (l.textContent.trim().toLowerCase() !== want) \
                            continue;\
                        if (l.control) return l.control;\
                        if (l.htmlFor) {{\
                            const e = document.getElementById(l.htmlFor);\
                            if (e) return e;\
                        }}\
                        const i = l.querySelector('input,textarea,select');\
                        if (i) return i;\
                    }}\
                    for (const e of document.querySelectorAll(\
                        'input,textarea,select')) {{\
                        const a = (e.getAttribute('aria-label') || '');\
                        if (a.trim().toLowerCase() === want) return e;\
                    }}\
                    return null;\
                }})()",
                js_str(name)
            ),
            Locator::Button(name) => format!(
                "(() => {{\
                    const want = {};\
                    const all = Array.from(document.querySelectorAll(\
                        'button,input[type=submit],input[type=button],\
                        [role=button]'));\
                    const label = (e) => (e.textContent || e.value || \
                        e.getAttribute('aria-label') || '').trim();\
                    return all.find((e) => label(e) === want) || \
                        all.find((e) => label(e).includes(want)) || null;\
                }})()",
                js_str(name)
            ),
            Locator::Link(text) => format!(
                "(() => {{\
                    const want = {};\
                    return Array.from(document.querySelectorAll('a'))\
                        .find((a) => a.textContent.includes(want)) || null;\
                }})()",
                js_str(text)
            ),
        }
    }

    /**
     * Produce an expression that evaluates to true if the element exists.
     */
    pub fn exists_js(&self) -> String {
        format!("({}) !== null", self.find_js())
    }

    /**
     * Produce an expression that evaluates to true if the element exists, is
     * rendered, and is not disabled.
     */
    pub fn ready_js(&self) -> String {
        format!(
            "((e) => e !== null && !e.disabled && \
                e.getClientRects().length > 0 && \
                getComputedStyle(e).visibility !== 'hidden')({})",
            self.find_js()
        )
    }

    /**
     * Wrap a function body that expects the element in "e" such that it is
     * only called when the element was found.  The whole expression
     * evaluates to null if there was no element.
     */
    pub fn with_js(&self, body: &str) -> String {
        format!(
            "((e) => {{ if (e === null) return null; {body} }})({})",
            self.find_js()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn css_selector_is_quoted() {
        let l = Locator::css(r#"input[name="value"]"#);
        assert_eq!(
            l.find_js(),
            r#"document.querySelector("input[name=\"value\"]")"#
        );
    }

    #[test]
    fn names_cannot_escape_their_literal() {
        let l = Locator::link("APPROVE ???\"); alert(1); (\"");
        let js = l.find_js();
        assert!(js.contains(r#"const want = "APPROVE ???\"); alert(1); (\"";"#));
    }

    #[test]
    fn display() {
        assert_eq!(Locator::button("Sign in").to_string(), "button \"Sign in\"");
        assert_eq!(
            Locator::label("Username").to_string(),
            "label \"Username\""
        );
    }

    #[test]
    fn wrappers_embed_the_finder() {
        let l = Locator::css("pre.console-output");
        let find = l.find_js();
        assert!(l.exists_js().contains(&find));
        assert!(l.ready_js().contains(&find));
        assert!(l.with_js("return e.textContent;").ends_with(&format!("({find})")));
    }
}
