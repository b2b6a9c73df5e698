//! Script extraction from the bootstrap document.
//!
//! Only `<script>` elements are recognized; everything else in the markup is
//! inert inside the isolate.

use std::sync::LazyLock;

use regex::Regex;

use crate::document::GUEST_RUNTIME_SRC;

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script\s*>").unwrap());
static SRC_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\s)src\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});
static TYPE_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\s)type\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});
static STATIC_IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*import\s*(?:[\w*{]|["'])"#).unwrap());

/// Script MIME types executed as classic scripts.
const CLASSIC_TYPES: [&str; 5] = [
    "text/javascript",
    "application/javascript",
    "text/ecmascript",
    "application/ecmascript",
    "application/x-javascript",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Inline(String),
    /// `src` attribute value, unresolved.
    External(String),
    /// The injected bootstrap reference.
    GuestRuntime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub source: ScriptSource,
    /// `type="module"`.
    pub module: bool,
}

/// What the isolate does with a module script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleHandling {
    /// No static imports: evaluate as an async function body.
    Wrap(String),
    /// Static imports cannot be resolved.
    Unsupported,
}

/// Executable scripts in document order. Data blocks (`type="x-shader/..."`,
/// `application/json`, import maps) are skipped.
pub fn extract_scripts(html: &str) -> Vec<Script> {
    SCRIPT_RE
        .captures_iter(html)
        .filter_map(|caps| {
            let attrs = caps.get(1).map_or("", |m| m.as_str());
            let body = caps.get(2).map_or("", |m| m.as_str());
            let kind = attr(&TYPE_ATTR_RE, attrs).map(|t| t.trim().to_ascii_lowercase());
            let module = match kind.as_deref() {
                None | Some("") => false,
                Some("module") => true,
                Some(t) if CLASSIC_TYPES.contains(&t) => false,
                Some(_) => return None,
            };
            let source = match attr(&SRC_ATTR_RE, attrs) {
                Some(src) if src.trim() == GUEST_RUNTIME_SRC => ScriptSource::GuestRuntime,
                Some(src) => ScriptSource::External(src.trim().to_string()),
                None if body.trim().is_empty() => return None,
                None => ScriptSource::Inline(body.to_string()),
            };
            Some(Script { source, module })
        })
        .collect()
}

fn attr(re: &Regex, attrs: &str) -> Option<String> {
    let caps = re.captures(attrs)?;
    (1..=3)
        .find_map(|i| caps.get(i))
        .map(|m| m.as_str().to_string())
}

/// Module scripts run as classic code inside an async wrapper so top-level
/// `await` works; failures surface through `reportError`.
pub fn prepare_module(source: &str) -> ModuleHandling {
    if STATIC_IMPORT_RE.is_match(source) {
        return ModuleHandling::Unsupported;
    }
    ModuleHandling::Wrap(format!(
        "(async () => {{\n{source}\n}})().catch((e) => reportError(e));"
    ))
}
