//! Pure checks over manifests, permissions, configuration schemas, and
//! plugin code.
//!
//! Nothing here touches the filesystem. Every check returns a
//! [`ValidationReport`]; `valid` is true iff `errors` is empty, and warnings
//! never block.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use switchyard_config::PermissionPolicy;

use crate::error::{PluginError, PluginResult};
use crate::manifest::{BUILTIN_PREFIX, PluginConfigurationSchema, PluginManifest, PluginPermissions};

/// Entry point suffixes the loader knows how to run.
pub const ALLOWED_MAIN_SUFFIXES: &[&str] = &[".wasm"];

/// Top-level manifest fields that must be present.
const REQUIRED_FIELDS: &[&str] = &["metadata", "capabilities", "main"];

/// System roots no plugin may request. Matched exactly or as a path prefix.
const DENIED_ROOTS: &[&str] = &[
    "/etc",
    "/usr",
    "/bin",
    "/sbin",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
    "/root",
    "/var",
    "/lib",
    "/System",
    "c:/windows",
    "c:/program files",
];

/// Loopback names always accepted as network hosts.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("invalid regex"));
static DOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,63}$")
        .expect("invalid regex")
});

/// Code patterns that block loading.
static CODE_ERRORS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bproc_exit\b", "direct process termination (proc_exit)"),
        (r"\bproc_raise\b", "direct process termination (proc_raise)"),
        (
            r"\bsock_(?:open|connect|accept|listen|bind)\b",
            "raw socket access",
        ),
        (
            r#"\(import\s+"[^"]*"\s+"(?:eval|compile|instantiate)""#,
            "dynamic code evaluation",
        ),
        (
            r#"\(import\s+"(?:process|child_process|os)""#,
            "direct privileged module access",
        ),
    ]
    .into_iter()
    .map(|(pattern, message)| (Regex::new(pattern).expect("invalid regex"), message))
    .collect()
});

/// Code patterns that only warn.
static CODE_WARNINGS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"i64\.const\s+0\s+call\s+\$sy_set_timeout\b|call\s+\$sy_set_timeout\b[^\n]*\(i64\.const\s+0\)",
            "zero-delay deferred call",
        ),
        (
            r"\(loop(?:\s+\$[\w.]+)?\s+(?:\(\s*)?br\s+(?:0|\$[\w.]+)\b",
            "unconditional infinite loop",
        ),
        (
            r"\b(?:fd_read|fd_write|fd_readdir|path_open)\b",
            "synchronous filesystem call",
        ),
    ]
    .into_iter()
    .map(|(pattern, message)| (Regex::new(pattern).expect("invalid regex"), message))
    .collect()
});

/// Outcome of a validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// True iff `errors` is empty.
    pub valid: bool,
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Non-blocking problems.
    pub warnings: Vec<String>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ValidationReport {
    /// An empty, valid report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.valid = false;
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.valid = self.errors.is_empty();
    }

    /// Convert to a result, naming `plugin` in the error.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ValidationFailed`] if the report has errors.
    pub fn into_result(self, plugin: &str) -> PluginResult<Vec<String>> {
        if self.valid {
            Ok(self.warnings)
        } else {
            Err(PluginError::ValidationFailed {
                plugin: plugin.to_owned(),
                errors: self.errors,
                warnings: self.warnings,
            })
        }
    }
}

/// Validate a raw manifest document.
///
/// Checks that the required top-level fields are present before attempting
/// a typed parse, then runs [`validate_manifest`].
#[must_use]
pub fn validate_manifest_value(value: &Value) -> ValidationReport {
    let mut report = ValidationReport::new();

    let Some(object) = value.as_object() else {
        report.error("manifest must be a JSON object");
        return report;
    };

    for field in REQUIRED_FIELDS {
        if object.get(*field).is_none_or(Value::is_null) {
            report.error(format!("missing required field: {field}"));
        }
    }
    if !report.valid {
        return report;
    }

    match serde_json::from_value::<PluginManifest>(value.clone()) {
        Ok(manifest) => report.merge(validate_manifest(&manifest)),
        Err(e) => report.error(format!("malformed manifest: {e}")),
    }
    report
}

/// Validate a parsed manifest.
#[must_use]
pub fn validate_manifest(manifest: &PluginManifest) -> ValidationReport {
    let mut report = ValidationReport::new();

    check_main(&manifest.main, &mut report);

    let meta = &manifest.metadata;
    for (field, value) in [
        ("id", &meta.id),
        ("name", &meta.name),
        ("version", &meta.version),
        ("author", &meta.author),
    ] {
        if value.trim().is_empty() {
            report.error(format!("metadata.{field} is required"));
        }
    }

    if !meta.id.is_empty() && !ID_PATTERN.is_match(&meta.id) {
        report.error(format!(
            "metadata.id must match ^[a-z0-9-]+$, got '{}'",
            meta.id
        ));
    }

    if !meta.version.is_empty() && semver::Version::parse(&meta.version).is_err() {
        report.error(format!(
            "metadata.version must be a semantic version, got '{}'",
            meta.version
        ));
    }

    if meta.description.as_deref().is_none_or(str::is_empty) {
        report.warn("metadata.description is missing");
    }
    if meta.license.as_deref().is_none_or(str::is_empty) {
        report.warn("metadata.license is missing");
    }

    if let Some(permissions) = &manifest.permissions {
        report.merge(validate_permissions(permissions));
    }
    if let Some(schema) = &manifest.configuration {
        report.merge(validate_configuration(schema));
    }

    report
}

fn check_main(main: &str, report: &mut ValidationReport) {
    if main.trim().is_empty() {
        report.error("main must not be empty");
        return;
    }

    if let Some(name) = main.strip_prefix(BUILTIN_PREFIX) {
        if !ID_PATTERN.is_match(name) {
            report.error(format!("main names an invalid builtin: '{main}'"));
        }
        return;
    }

    if !ALLOWED_MAIN_SUFFIXES.iter().any(|s| main.ends_with(s)) {
        report.error(format!(
            "main must end with one of {ALLOWED_MAIN_SUFFIXES:?} or use '{BUILTIN_PREFIX}', got '{main}'"
        ));
    }
    if has_parent_segment(main) {
        report.error(format!(
            "main must not contain parent-directory segments: '{main}'"
        ));
    }
    if is_absolute_like(main) {
        report.error(format!("main must be relative to the plugin directory: '{main}'"));
    }
}

/// Validate requested permissions against the deny-list and host grammar.
#[must_use]
pub fn validate_permissions(permissions: &PluginPermissions) -> ValidationReport {
    let mut report = ValidationReport::new();

    for path in permissions
        .read_paths()
        .iter()
        .chain(permissions.write_paths())
    {
        if is_denied_path(path) {
            report.error(format!("filesystem access to system path '{path}' is denied"));
        } else if has_parent_segment(path) {
            report.error(format!(
                "filesystem path '{path}' must not contain parent-directory segments"
            ));
        }
    }

    for host in permissions.hosts() {
        if !is_valid_host(host) {
            report.error(format!("network host '{host}' is not a valid host pattern"));
        }
    }

    if permissions.wants_exec() {
        report.warn("permissions.system.exec requests process execution");
    }

    report
}

/// Validate a configuration schema.
#[must_use]
pub fn validate_configuration(schema: &PluginConfigurationSchema) -> ValidationReport {
    let mut report = ValidationReport::new();

    for (name, property) in &schema.properties {
        let Some(kind) = property.property_type() else {
            report.error(format!(
                "configuration property '{name}' has unrecognized type '{}'; expected string, number, boolean, array, or object",
                property.kind
            ));
            continue;
        };
        if property.description.as_deref().is_none_or(str::is_empty) {
            report.warn(format!("configuration property '{name}' has no description"));
        }
        if let Some(default) = &property.default
            && !kind.matches(default)
        {
            report.warn(format!(
                "configuration property '{name}' default does not match type '{}'",
                property.kind
            ));
        }
    }

    report
}

/// Check requested permission classes against what the host grants.
#[must_use]
pub fn check_permission_policy(
    permissions: &PluginPermissions,
    policy: &PermissionPolicy,
) -> ValidationReport {
    let mut report = ValidationReport::new();
    if permissions.wants_filesystem() && !policy.allow_filesystem {
        report.error("host policy forbids filesystem permissions");
    }
    if permissions.wants_network() && !policy.allow_network {
        report.error("host policy forbids network permissions");
    }
    if permissions.wants_env() && !policy.allow_env {
        report.error("host policy forbids environment permissions");
    }
    if permissions.wants_exec() && !policy.allow_exec {
        report.error("host policy forbids process execution");
    }
    report
}

/// Scan plugin code for disallowed patterns.
///
/// `source` is WebAssembly text, or the import listing produced by
/// [`crate::loader::describe_imports`] for binary modules. This is a
/// textual heuristic layered on top of the sandbox, not a replacement for
/// it.
#[must_use]
pub fn validate_plugin_code(source: &str) -> ValidationReport {
    let mut report = ValidationReport::new();
    for (pattern, message) in CODE_ERRORS.iter() {
        if pattern.is_match(source) {
            report.error(format!("disallowed pattern: {message}"));
        }
    }
    for (pattern, message) in CODE_WARNINGS.iter() {
        if pattern.is_match(source) {
            report.warn(format!("suspicious pattern: {message}"));
        }
    }
    report
}

/// Whether a host string matches the host grammar.
#[must_use]
pub fn is_valid_host(host: &str) -> bool {
    if host == "*" || LOOPBACK_HOSTS.contains(&host) {
        return true;
    }
    if let Some(domain) = host.strip_prefix("*.") {
        return DOMAIN_PATTERN.is_match(domain);
    }
    host.parse::<Ipv4Addr>().is_ok() || DOMAIN_PATTERN.is_match(host)
}

/// Whether a path is a denied system root or lies beneath one.
#[must_use]
pub fn is_denied_path(path: &str) -> bool {
    let normalized = path.trim().replace('\\', "/");
    let normalized = normalized.trim_end_matches('/');
    let lowered = normalized.to_ascii_lowercase();

    DENIED_ROOTS.iter().any(|root| {
        // Windows roots are case-insensitive, unix roots are not.
        let candidate = if root.contains(':') {
            lowered.as_str()
        } else {
            normalized
        };
        candidate == *root
            || candidate
                .strip_prefix(root)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Whether a path has a `..` component.
pub(crate) fn has_parent_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Whether a path is absolute on unix or windows.
pub(crate) fn is_absolute_like(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}
