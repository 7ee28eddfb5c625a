//! Entry point classification and export discovery.

use std::path::Path;

use wasmparser::{Encoding, ExternalKind, Parser, Payload};

/// WebAssembly magic bytes.
const WASM_MAGIC: &[u8; 4] = b"\0asm";
/// Version field of a core module.
const CORE_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
/// Version and layer fields of a component.
const COMPONENT_VERSION: [u8; 4] = [0x0d, 0x00, 0x01, 0x00];

/// How a plugin's entry point must be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStyle {
    /// A core WebAssembly module.
    CoreModule,
}

/// Classify an entry point by extension and its opening bytes.
///
/// # Errors
///
/// Returns a description of why the entry cannot be loaded.
pub fn detect_style(path: &Path, bytes: &[u8]) -> Result<EntryStyle, String> {
    if path.extension().and_then(|e| e.to_str()) != Some("wasm") {
        return Err(format!(
            "unsupported entry point {}: expected a .wasm file",
            path.display()
        ));
    }
    let Some((magic, rest)) = bytes.split_first_chunk::<4>() else {
        return Err("entry point is too short to be WebAssembly".to_owned());
    };
    if magic != WASM_MAGIC {
        return Err("entry point is missing the WebAssembly magic header".to_owned());
    }
    match rest.first_chunk::<4>() {
        Some(version) if *version == CORE_VERSION => Ok(EntryStyle::CoreModule),
        Some(version) if *version == COMPONENT_VERSION => {
            Err("component-model binaries are not supported; build a core module".to_owned())
        },
        Some(version) => Err(format!("unknown WebAssembly version {version:02x?}")),
        None => Err("entry point is truncated after the magic header".to_owned()),
    }
}

/// Kinds of non-function exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// A table.
    Table,
    /// A linear memory.
    Memory,
    /// A global.
    Global,
    /// An exception tag.
    Tag,
}

/// What a core module exports and imports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleExports {
    /// Exported function names, in declaration order.
    pub functions: Vec<String>,
    /// Every other export.
    pub others: Vec<(String, ExportKind)>,
    /// Imports as `(module, name)`.
    pub imports: Vec<(String, String)>,
}

impl ModuleExports {
    /// Whether a function named `name` is exported.
    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f == name)
    }

    /// Non-function exports whose name is a hook name.
    pub fn uncallable_hooks(&self) -> impl Iterator<Item = &str> {
        self.others
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| crate::plugin::is_hook_name(name))
    }

    /// The constructor export, if any: `default`, then `plugin`, then
    /// `Plugin`.
    #[must_use]
    pub fn constructor(&self) -> Option<&str> {
        ["default", "plugin", "Plugin"]
            .into_iter()
            .find(|name| self.has_function(name))
    }
}

/// Read the export and import sections of a core module.
///
/// # Errors
///
/// Returns the parser's message if the binary is malformed or is not a
/// core module.
pub fn inspect_module(bytes: &[u8]) -> Result<ModuleExports, String> {
    let mut exports = ModuleExports::default();
    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload.map_err(|e| format!("failed to parse WASM: {e}"))?;
        match payload {
            Payload::Version { encoding, .. } => {
                if encoding == Encoding::Component {
                    return Err("component-model binaries are not supported".to_owned());
                }
            },
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(|e| format!("failed to read import: {e}"))?;
                    exports
                        .imports
                        .push((import.module.to_owned(), import.name.to_owned()));
                }
            },
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(|e| format!("failed to read export: {e}"))?;
                    let name = export.name.to_owned();
                    match export.kind {
                        ExternalKind::Func => exports.functions.push(name),
                        ExternalKind::Table => exports.others.push((name, ExportKind::Table)),
                        ExternalKind::Memory => exports.others.push((name, ExportKind::Memory)),
                        ExternalKind::Global => exports.others.push((name, ExportKind::Global)),
                        ExternalKind::Tag => exports.others.push((name, ExportKind::Tag)),
                    }
                }
            },
            _ => {},
        }
    }
    Ok(exports)
}

/// Render a module's imports as WebAssembly text lines for the code scan.
///
/// # Errors
///
/// Returns the parser's message if the binary is malformed.
pub fn describe_imports(bytes: &[u8]) -> Result<String, String> {
    let exports = inspect_module(bytes)?;
    Ok(exports
        .imports
        .iter()
        .map(|(module, name)| format!("(import \"{module}\" \"{name}\")"))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fixtures;

    #[test]
    fn test_detect_core_module() {
        let bytes = fixtures::hooks_module();
        assert_eq!(
            detect_style(Path::new("plugin.wasm"), &bytes),
            Ok(EntryStyle::CoreModule)
        );
    }

    #[test]
    fn test_detect_rejects_component_and_garbage() {
        let wasm = Path::new("plugin.wasm");
        assert!(
            detect_style(wasm, &fixtures::component_header())
                .unwrap_err()
                .contains("component")
        );
        assert!(detect_style(wasm, b"export default {}").is_err());
        assert!(detect_style(wasm, b"\0as").is_err());
        assert!(detect_style(Path::new("index.js"), &fixtures::hooks_module()).is_err());
    }

    #[test]
    fn test_inspect_exports() {
        let bytes = fixtures::module(
            &[
                ("on_enable", fixtures::return_zero()),
                ("default", fixtures::return_zero()),
            ],
            Some("on_install"),
        );
        let exports = inspect_module(&bytes).unwrap();
        assert_eq!(exports.functions, vec!["on_enable", "default"]);
        assert_eq!(
            exports.others,
            vec![("on_install".to_owned(), ExportKind::Memory)]
        );
        assert_eq!(exports.uncallable_hooks().collect::<Vec<_>>(), vec!["on_install"]);
        assert_eq!(exports.constructor(), Some("default"));
    }

    #[test]
    fn test_constructor_precedence() {
        let bytes = fixtures::module(
            &[
                ("Plugin", fixtures::return_zero()),
                ("plugin", fixtures::return_zero()),
            ],
            None,
        );
        assert_eq!(inspect_module(&bytes).unwrap().constructor(), Some("plugin"));

        let bare = inspect_module(&fixtures::hooks_module()).unwrap();
        assert_eq!(bare.constructor(), None);
    }

    #[test]
    fn test_describe_imports_of_import_free_module() {
        assert_eq!(describe_imports(&fixtures::hooks_module()).unwrap(), "");
    }

    #[test]
    fn test_describe_host_imports() {
        let listing = describe_imports(&fixtures::host_calls_module()).unwrap();
        assert!(listing.contains(r#"(import "extism:host/user" "sy_require")"#));
        assert!(listing.contains(r#"(import "extism:host/env" "alloc")"#));
        assert!(crate::validator::validate_plugin_code(&listing).valid);

        let exports = inspect_module(&fixtures::host_calls_module()).unwrap();
        assert_eq!(
            exports.functions,
            vec!["require_path", "require_process", "schedule", "tick"]
        );
    }
}
