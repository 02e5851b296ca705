use std::path::Path;

/// Engine used when nothing in the source asks for more
pub const BASELINE_ENGINE: &str = "pdflatex";

/// Markers that require the heavy typesetting engine
const LUALATEX_MARKERS: [&str; 2] = ["\\directlua", "luacode"];
/// Markers that require native font/unicode handling
const XELATEX_MARKERS: [&str; 3] = ["fontspec", "polyglossia", "unicode-math"];

/// Best-effort engine classification from the entry document's source.
/// Lua markers win over font/unicode markers, which win over the baseline.
pub fn detect_engine(source: &str) -> &'static str {
    if LUALATEX_MARKERS.iter().any(|m| source.contains(m)) {
        "lualatex"
    } else if XELATEX_MARKERS.iter().any(|m| source.contains(m)) {
        "xelatex"
    } else {
        BASELINE_ENGINE
    }
}

/// Resolves a requested engine name, inspecting the entry file for "auto".
/// Unreadable input falls back to the baseline engine, never an error.
pub fn resolve_engine(requested: &str, main_file: &Path) -> String {
    if requested != "auto" {
        return requested.to_string();
    }
    match std::fs::read_to_string(main_file) {
        Ok(source) => detect_engine(&source).to_string(),
        Err(_) => BASELINE_ENGINE.to_string(),
    }
}
