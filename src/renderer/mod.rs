//! Renderer dispatch: decide how a file is turned into HTML, then do it.
//!
//! A file inside a directory tree carrying a `codechat_config.yaml` is a
//! project render; everything else goes through an ordered glob table
//! whose first match selects an internal converter or an external
//! single-file tool. No match selects the error renderer.

pub use self::external::ExternalTool;
pub use self::rest::RestOutput;

mod external;
mod markdown;
mod rest;
mod source;

use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use log::debug;
use once_cell::sync::Lazy;

use crate::constants::PROJECT_CONFIG_FILE;
use crate::utils::fs::normalize_path;

/// An internal converter or an external tool, as selected by the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Converter {
    Markdown,
    Rest,
    /// Comments as rST, code as literal blocks.
    SourceCode,
    /// `.htm/.html/.xhtml` are returned verbatim.
    PassThrough,
    External(ExternalTool),
}

/// What `select_renderer` decided for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A `codechat_config.yaml` was found; the value is its absolute path.
    Project(PathBuf),
    Converter(Converter),
    /// No converter claims this file.
    NoConverter,
}

fn table_entry(glob: &str, converter: Converter) -> (GlobMatcher, Converter) {
    (
        Glob::new(glob).expect("static glob is valid").compile_matcher(),
        converter,
    )
}

/// The ordered glob-to-converter table; first match wins.
static GLOB_TABLE: Lazy<Vec<(GlobMatcher, Converter)>> = Lazy::new(|| {
    let mut table = vec![
        table_entry("*.md", Converter::Markdown),
        table_entry("*.markdown", Converter::Markdown),
        table_entry("*.rst", Converter::Rest),
        table_entry("*.rest", Converter::Rest),
        table_entry("*.htm", Converter::PassThrough),
        table_entry("*.html", Converter::PassThrough),
        table_entry("*.xhtml", Converter::PassThrough),
        // JSON has no comment syntax; routing it to the source converter
        // yields the "not supported" diagnostic rather than silence.
        table_entry("*.json", Converter::SourceCode),
    ];
    for ext in source::supported_extensions() {
        table.push(table_entry(&format!("*.{}", ext), Converter::SourceCode));
    }
    table
});

/// Walk `file_path` and its ancestors for a project configuration file;
/// fall back to the glob table.
pub fn select_renderer(file_path: &Path) -> Selection {
    for dir in file_path.ancestors().skip(1) {
        let config = dir.join(PROJECT_CONFIG_FILE);
        if config.is_file() {
            debug!("{} renders via project {}", file_path.display(), config.display());
            return Selection::Project(config);
        }
    }

    let name = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    for (matcher, converter) in GLOB_TABLE.iter() {
        if matcher.is_match(&name) {
            return Selection::Converter(converter.clone());
        }
    }
    Selection::NoConverter
}

/// Everything one render produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    /// False only for the dirty-project guard: nothing was done at all.
    pub was_performed: bool,
    /// The project's config-file path, for project renders.
    pub project_path: Option<PathBuf>,
    /// POSIX-slash path of the rendered result. For single-file renders
    /// this equals the input path; for project renders it is the HTML the
    /// builder wrote.
    pub rendered_file_path: String,
    /// In-band HTML; absent for project renders (the HTML is on disk).
    pub html: Option<String>,
    pub errors: String,
}

impl RenderOutcome {
    fn skipped() -> RenderOutcome {
        RenderOutcome {
            was_performed: false,
            project_path: None,
            rendered_file_path: String::new(),
            html: None,
            errors: String::new(),
        }
    }

    fn single_file(file_path: &Path, html: String, errors: String) -> RenderOutcome {
        RenderOutcome {
            was_performed: true,
            project_path: None,
            rendered_file_path: normalize_path(&file_path.to_string_lossy()),
            html: Some(html),
            errors,
        }
    }
}

/// Render `text` as the contents of `file_path`.
///
/// Build output of project renders is streamed through `co_build`.
/// `is_dirty` guards project renders: a project builder reads from disk,
/// so building from an unsaved buffer would render stale content -- in
/// that case nothing is done and `was_performed` is false.
pub async fn render_file(
    text: &str,
    file_path: &Path,
    co_build: &mut (dyn FnMut(String) + Send),
    is_dirty: bool,
) -> RenderOutcome {
    let selection = select_renderer(file_path);

    if let Selection::Project(config_path) = &selection {
        if is_dirty {
            debug!("project source {} is dirty; skipping", file_path.display());
            return RenderOutcome::skipped();
        }
        return match crate::project::render_project(config_path, file_path, co_build).await {
            Ok(render) => RenderOutcome {
                was_performed: true,
                project_path: Some(config_path.clone()),
                rendered_file_path: normalize_path(&render.html_path.to_string_lossy()),
                html: None,
                errors: render.errors,
            },
            Err(e) => RenderOutcome {
                was_performed: true,
                project_path: Some(config_path.clone()),
                rendered_file_path: String::new(),
                html: None,
                errors: format!("{:#}\n", e),
            },
        };
    }

    match selection {
        Selection::Converter(Converter::Markdown) => {
            RenderOutcome::single_file(file_path, markdown::markdown_to_html(text), String::new())
        }
        Selection::Converter(Converter::Rest) => {
            let RestOutput { html, errors } = rest::rest_to_html(text);
            RenderOutcome::single_file(file_path, html, errors)
        }
        Selection::Converter(Converter::SourceCode) => {
            match source::code_to_html(text, file_path) {
                Ok(RestOutput { html, errors }) => {
                    RenderOutcome::single_file(file_path, html, errors)
                }
                Err(errors) => RenderOutcome::single_file(file_path, String::new(), errors),
            }
        }
        Selection::Converter(Converter::PassThrough) => {
            RenderOutcome::single_file(file_path, text.to_string(), String::new())
        }
        Selection::Converter(Converter::External(tool)) => {
            let (html, errors) = external::render_external(&tool, text, file_path).await;
            RenderOutcome::single_file(file_path, html, errors)
        }
        Selection::NoConverter => RenderOutcome::single_file(
            file_path,
            String::new(),
            format!(
                "{}:: ERROR: No converter found for this file.",
                normalize_path(&file_path.to_string_lossy())
            ),
        ),
        Selection::Project(_) => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn no_build(_chunk: String) {}

    #[test]
    fn the_first_matching_glob_wins() {
        assert_eq!(
            select_renderer(Path::new("notes.md")),
            Selection::Converter(Converter::Markdown)
        );
        assert_eq!(
            select_renderer(Path::new("doc.rst")),
            Selection::Converter(Converter::Rest)
        );
        assert_eq!(
            select_renderer(Path::new("page.xhtml")),
            Selection::Converter(Converter::PassThrough)
        );
        assert_eq!(
            select_renderer(Path::new("prog.py")),
            Selection::Converter(Converter::SourceCode)
        );
        assert_eq!(select_renderer(Path::new("nope.xyz")), Selection::NoConverter);
    }

    #[test]
    fn a_config_file_in_an_ancestor_selects_a_project_render() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join(crate::constants::PROJECT_CONFIG_FILE);
        std::fs::write(&config, "output_path: _build\nargs: make\n").unwrap();
        let nested = dir.path().join("deep/nested/file.rst");

        assert_eq!(select_renderer(&nested), Selection::Project(config));
    }

    #[tokio::test]
    async fn markdown_renders_in_band() {
        let mut cb = no_build;
        let outcome = render_file("*hi*", Path::new("x.md"), &mut cb, false).await;
        assert!(outcome.was_performed);
        assert_eq!(outcome.rendered_file_path, "x.md");
        assert_eq!(outcome.html.as_deref(), Some("<p><em>hi</em></p>\n"));
        assert_eq!(outcome.errors, "");
        assert_eq!(outcome.project_path, None);
    }

    #[tokio::test]
    async fn missing_converters_use_the_canonical_error() {
        let mut cb = no_build;
        let outcome = render_file("", Path::new("nope.xyz"), &mut cb, false).await;
        assert_eq!(
            outcome.errors,
            "nope.xyz:: ERROR: No converter found for this file."
        );
        assert_eq!(outcome.html.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn dirty_project_sources_do_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(crate::constants::PROJECT_CONFIG_FILE),
            "output_path: _build\nargs: false\n",
        )
        .unwrap();
        let file = dir.path().join("ch.rst");
        std::fs::write(&file, "text").unwrap();

        let mut cb = |_chunk: String| panic!("no build output expected");
        let outcome = render_file("text", &file, &mut cb, true).await;
        assert!(!outcome.was_performed);
        assert_eq!(outcome.rendered_file_path, "");
        assert_eq!(outcome.errors, "");
    }

    #[tokio::test]
    async fn rendering_twice_is_byte_identical() {
        let mut cb = no_build;
        let first = render_file("# t\n\npara", Path::new("t.md"), &mut cb, false).await;
        let mut cb = no_build;
        let second = render_file("# t\n\npara", Path::new("t.md"), &mut cb, false).await;
        assert_eq!(first, second);
    }
}
