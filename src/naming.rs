//! Derives stable backend names from node declarations.
//!
//! Every place that matches a node to a live backend connection goes through
//! [`derive_node_name`], so status reporting and hot reconfiguration agree on identity.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{NodeEndpoint, NodeSpec};

/// Separator used between namespace, backend name and tool name.
pub const NAMESPACE_SEPARATOR: &str = ".";

/// Namespace used when none (or an invalid one) is configured.
pub const DEFAULT_NAMESPACE: &str = NAMESPACE_SEPARATOR;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Compile a pattern once. A pattern that fails to compile is logged and the
/// caller falls back to the equivalent character scan.
fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(error) => {
            tracing::error!(pattern, %error, "naming pattern failed to compile");
            None
        }
    })
    .as_ref()
}

fn unsafe_chars() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"[^A-Za-z0-9_.-]")
}

fn namespace_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"^[A-Za-z0-9_.-]+$")
}

fn trailing_extension() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"\.[A-Za-z0-9]+$")
}

fn sanitize_chars(raw: &str) -> String {
    raw.chars()
        .map(|c| if is_name_char(c) { c } else { '-' })
        .collect()
}

fn is_namespace_chars(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(is_name_char)
}

fn strip_extension_chars(basename: &str) -> &str {
    match basename.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => stem,
        _ => basename,
    }
}

/// Rewrite every character outside `[A-Za-z0-9_.-]` to `-`.
pub fn sanitize(raw: &str) -> String {
    match unsafe_chars() {
        Some(regex) => regex.replace_all(raw, "-").into_owned(),
        None => sanitize_chars(raw),
    }
}

/// Whether `raw` is a usable namespace: one or more of `[A-Za-z0-9_.-]`.
pub fn is_valid_namespace(raw: &str) -> bool {
    match namespace_pattern() {
        Some(regex) => regex.is_match(raw),
        None => is_namespace_chars(raw),
    }
}

fn strip_extension(basename: &str) -> String {
    match trailing_extension() {
        Some(regex) => regex.replace(basename, "").into_owned(),
        None => strip_extension_chars(basename).to_string(),
    }
}

/// Resolve the name a node is known by.
///
/// Precedence: declared name, first non-flag stdio argument (scope marker and version
/// suffix stripped), executable basename without extension, then `node_<id>`.
pub fn derive_node_name(node: &NodeSpec) -> String {
    if let Some(name) = node.name.as_deref().map(str::trim) {
        if !name.is_empty() {
            return name.to_string();
        }
    }

    if let NodeEndpoint::Stdio { command, args, .. } = &node.endpoint {
        if let Some(name) = name_from_args(args) {
            return name;
        }
        if let Some(name) = name_from_command(command) {
            return name;
        }
    }

    format!("node_{}", node.id)
}

fn name_from_args(args: &[String]) -> Option<String> {
    let package = args
        .iter()
        .map(|arg| arg.trim())
        .find(|arg| !arg.is_empty() && !arg.starts_with('-'))?;
    let unscoped = package.strip_prefix('@').unwrap_or(package);
    let without_version = unscoped.split('@').next().unwrap_or_default();
    non_empty(sanitize(without_version))
}

fn name_from_command(command: &str) -> Option<String> {
    let basename = command.trim().rsplit(['/', '\\']).next().unwrap_or_default();
    non_empty(sanitize(&strip_extension(basename)))
}

fn non_empty(name: String) -> Option<String> {
    (!name.is_empty()).then_some(name)
}

/// Validate a configured namespace, falling back to [`DEFAULT_NAMESPACE`].
pub fn normalize_namespace(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(ns) if is_valid_namespace(ns) => ns.to_string(),
        Some(ns) => {
            tracing::warn!(namespace = ns, "invalid namespace, using default");
            DEFAULT_NAMESPACE.to_string()
        }
        None => DEFAULT_NAMESPACE.to_string(),
    }
}

/// Name a backend capability is exposed under.
pub fn exposed_name(namespace: &str, backend: &str, native: &str) -> String {
    if namespace.is_empty() || namespace == DEFAULT_NAMESPACE {
        native.to_string()
    } else {
        format!("{namespace}{NAMESPACE_SEPARATOR}{backend}{NAMESPACE_SEPARATOR}{native}")
    }
}
