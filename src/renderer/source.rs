//! Source code to reStructuredText.
//!
//! A source file is a sequence of comment blocks (prose) and code blocks.
//! Comments whose delimiter is followed by a space become rST text; runs
//! of code become literal blocks. The resulting rST is handed to the rST
//! converter by the dispatcher.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use super::rest::{rest_to_html, RestOutput};

/// Inline comment delimiters by file extension.
static DELIMITERS: &[(&str, &[&str])] = &[
    ("#", &[
        "py", "sh", "bash", "yaml", "yml", "toml", "cfg", "ini", "pl", "rb", "r", "cmake",
        "ps1", "tcl", "mk",
    ]),
    ("//", &[
        "c", "cc", "cpp", "cxx", "h", "hh", "hpp", "cs", "go", "java", "js", "mjs", "kt",
        "rs", "scala", "swift", "ts", "tsx", "v", "sv", "d", "php",
    ]),
    ("--", &["sql", "lua", "hs", "vhd", "vhdl"]),
    (";", &["lisp", "clj", "scm", "el", "asm", "s"]),
    ("%", &["m", "tex", "sty", "cls"]),
    ("'", &["vb", "vbs", "bas"]),
];

/// Look up the comment delimiter for a file, by extension.
pub fn comment_delimiter(file_path: &Path) -> Option<&'static str> {
    let ext = file_path.extension()?.to_str()?.to_ascii_lowercase();
    DELIMITERS
        .iter()
        .find(|(_, exts)| exts.contains(&ext.as_str()))
        .map(|(delim, _)| *delim)
}

/// Every extension the code converter accepts. The dispatch table is
/// built from this list.
pub fn supported_extensions() -> impl Iterator<Item = &'static str> {
    DELIMITERS.iter().flat_map(|(_, exts)| exts.iter().copied())
}

/// Translate source code to rST: comment lines become prose, code runs
/// become literal blocks. Returns the "not supported" error for files
/// whose language cannot be detected from the extension.
pub fn code_to_rest(text: &str, file_path: &Path) -> Result<String, String> {
    let delimiter = comment_delimiter(file_path).ok_or_else(|| {
        format!(
            "{}:: ERROR: this file is not supported by CodeChat.\n",
            crate::utils::fs::normalize_path(&file_path.to_string_lossy())
        )
    })?;

    static TRAILING_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+$").unwrap());

    let mut rest = String::with_capacity(text.len());
    let mut code_run: Vec<&str> = Vec::new();

    let flush_code = |rest: &mut String, code_run: &mut Vec<&str>| {
        if code_run.is_empty() {
            return;
        }
        rest.push_str("\n::\n\n");
        for line in code_run.drain(..) {
            rest.push(' ');
            rest.push_str(line);
            rest.push('\n');
        }
        rest.push('\n');
    };

    for line in text.lines() {
        let trimmed = line.trim_start();
        // A comment line is a delimiter followed by a space (or nothing);
        // "#!/bin/sh" or "//===" stay code.
        let comment_text = trimmed.strip_prefix(delimiter).and_then(|after| {
            if after.is_empty() {
                Some("")
            } else {
                after.strip_prefix(' ')
            }
        });
        match comment_text {
            Some(prose) => {
                flush_code(&mut rest, &mut code_run);
                rest.push_str(TRAILING_SPACE.replace(prose, "").as_ref());
                rest.push('\n');
            }
            None => code_run.push(line),
        }
    }
    flush_code(&mut rest, &mut code_run);

    Ok(rest)
}

/// Full conversion: code to rST, rST to HTML.
pub fn code_to_html(text: &str, file_path: &Path) -> Result<RestOutput, String> {
    code_to_rest(text, file_path).map(|rest| rest_to_html(&rest))
}
