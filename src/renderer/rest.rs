//! reStructuredText to HTML.
//!
//! Rendering is best-effort: with the halt level disabled, recoverable
//! markup problems do not fail the parse -- they are embedded in the
//! document as `system_message`/`problematic` nodes and rendered along
//! with the content. Those diagnostics are pulled out of the rendering
//! into the returned error string, so the viewer's errors pane shows
//! them next to whatever HTML could be produced.

use once_cell::sync::Lazy;
use regex::Regex;

pub struct RestOutput {
    pub html: String,
    pub errors: String,
}

/// Render rST to an HTML body fragment.
pub fn rest_to_html(text: &str) -> RestOutput {
    // The parser chokes on a missing trailing newline
    // (flying-sheep/rust-rst#30), so one is always appended.
    let mut input = text.trim_end().to_string();
    input.push('\n');

    let document = match rst_parser::parse(&input) {
        Ok(document) => document,
        Err(e) => {
            return RestOutput {
                html: String::new(),
                errors: format!("{}\n", e),
            }
        }
    };

    let mut body = Vec::new();
    // The renderer's Result is not the diagnostic channel; markup
    // diagnostics are system-message nodes inside the document and
    // appear in the rendering itself.
    let render_result = rst_renderer::render_html(&document, &mut body, false);
    let html = String::from_utf8_lossy(&body).into_owned();

    let mut errors = extract_diagnostics(&html);
    if let Err(e) = render_result {
        errors.push_str(&format!("{}\n", e));
    }
    RestOutput { html, errors }
}

/// Collect the text of every rendered `system-message` block, e.g.
/// "Inline emphasis start-string without end-string." for an unclosed
/// `*emphasis*`.
fn extract_diagnostics(html: &str) -> String {
    static BLOCK_MESSAGE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?s)<(?:div|aside)[^>]*class="[^"]*system-message[^"]*"[^>]*>(.*?)</(?:div|aside)>"#)
            .unwrap()
    });
    static INLINE_MESSAGE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?s)<(?:p|span)[^>]*class="[^"]*system-message[^"]*"[^>]*>(.*?)</(?:p|span)>"#)
            .unwrap()
    });

    let mut errors = String::new();
    let mut found_block = false;
    for capture in BLOCK_MESSAGE.captures_iter(html) {
        found_block = true;
        push_message(&mut errors, &capture[1]);
    }
    if !found_block {
        // Some messages render as a bare paragraph or span instead of a
        // wrapping block.
        for capture in INLINE_MESSAGE.captures_iter(html) {
            push_message(&mut errors, &capture[1]);
        }
    }
    errors
}

fn push_message(errors: &mut String, markup: &str) {
    static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
    for line in TAGS.replace_all(markup, " ").lines() {
        let line = line.trim();
        if !line.is_empty() {
            errors.push_str(line);
            errors.push('\n');
        }
    }
}
