//! Markdown to HTML via pulldown-cmark.

use pulldown_cmark::{html, Event, Options, Parser};

/// Render CommonMark plus the extensions editors expect: tables,
/// strike-through, footnotes and task lists. Soft line breaks are
/// promoted to `<br>` so the preview tracks the buffer line-for-line.
pub fn markdown_to_html(text: &str) -> String {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_TABLES);
    opts.insert(Options::ENABLE_STRIKETHROUGH);
    opts.insert(Options::ENABLE_FOOTNOTES);
    opts.insert(Options::ENABLE_TASKLISTS);

    let events = Parser::new_ext(text, opts).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        event => event,
    });

    let mut body = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut body, events);
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_emphasis() {
        assert_eq!(markdown_to_html("*hi*"), "<p><em>hi</em></p>\n");
    }

    #[test]
    fn soft_breaks_become_hard_breaks() {
        let html = markdown_to_html("one\ntwo");
        assert!(html.contains("<br />"), "got: {}", html);
    }

    #[test]
    fn tables_and_strikethrough_are_enabled() {
        let html = markdown_to_html("| a | b |\n|---|---|\n| 1 | 2 |\n");
        assert!(html.contains("<table>"), "got: {}", html);
        assert!(markdown_to_html("~~gone~~").contains("<del>"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let input = "# Title\n\nsome *text* with `code`\n";
        assert_eq!(markdown_to_html(input), markdown_to_html(input));
    }
}
