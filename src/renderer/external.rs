//! Single-file external converters: tools that turn one input document
//! into one HTML document.

use std::path::Path;

use log::info;
use tempfile::Builder as TempFileBuilder;

use crate::subprocess::{run_tool, tool_error};

/// One entry of the dispatch table for an external tool.
///
/// `argv` may contain the `{input_file}` and `{output_file}` placeholders;
/// they are substituted before the run. Tools that read stdin / write
/// stdout skip the corresponding temp file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    pub uses_stdin: bool,
    pub uses_stdout: bool,
    pub argv: &'static [&'static str],
}

/// Run the tool over the given editor text. Returns `(html, errors)`;
/// every failure is reported through the error string.
pub async fn render_external(tool: &ExternalTool, text: &str, file_path: &Path) -> (String, String) {
    let mut errors = String::new();

    // Tools that cannot read stdin get the text materialised to a temp
    // file carrying the original extension.
    let input_file = if tool.uses_stdin {
        None
    } else {
        let suffix = file_path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        match TempFileBuilder::new().suffix(&suffix).tempfile() {
            Ok(file) => match std::fs::write(file.path(), text) {
                Ok(()) => Some(file),
                Err(e) => {
                    errors.push_str(&tool_error(format_args!("writing input file: {}", e)));
                    return (String::new(), errors);
                }
            },
            Err(e) => {
                errors.push_str(&tool_error(format_args!("creating input file: {}", e)));
                return (String::new(), errors);
            }
        }
    };

    let output_file = if tool.uses_stdout {
        None
    } else {
        match TempFileBuilder::new().suffix(".html").tempfile() {
            Ok(file) => Some(file),
            Err(e) => {
                errors.push_str(&tool_error(format_args!("creating output file: {}", e)));
                return (String::new(), errors);
            }
        }
    };

    let argv: Vec<String> = tool
        .argv
        .iter()
        .map(|arg| {
            let mut arg = arg.to_string();
            if let Some(input) = &input_file {
                arg = arg.replace("{input_file}", &input.path().to_string_lossy());
            }
            if let Some(output) = &output_file {
                arg = arg.replace("{output_file}", &output.path().to_string_lossy());
            }
            arg
        })
        .collect();

    let cwd = file_path.parent().filter(|p| !p.as_os_str().is_empty());
    let cwd = cwd.unwrap_or_else(|| Path::new("."));
    info!("rendering {} with {:?}", file_path.display(), argv);

    let stdin = tool.uses_stdin.then_some(text);
    let output = run_tool(&argv, cwd, stdin, None).await;
    errors.push_str(&output.error);
    errors.push_str(&output.stderr);

    let html = if tool.uses_stdout {
        output.stdout
    } else {
        match std::fs::read_to_string(output_file.as_ref().expect("reserved above").path()) {
            Ok(html) => html,
            Err(e) => {
                errors.push_str(&tool_error(format_args!("reading output file: {}", e)));
                String::new()
            }
        }
    };

    (html, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdin_stdout_tools_round_trip() {
        let tool = ExternalTool {
            uses_stdin: true,
            uses_stdout: true,
            argv: &["cat"],
        };
        let (html, errors) = render_external(&tool, "<p>hi</p>", Path::new("x.txt")).await;
        assert_eq!(html, "<p>hi</p>");
        assert_eq!(errors, "");
    }

    #[tokio::test]
    async fn file_based_tools_get_placeholders_substituted() {
        let tool = ExternalTool {
            uses_stdin: false,
            uses_stdout: false,
            argv: &["cp", "{input_file}", "{output_file}"],
        };
        let (html, errors) = render_external(&tool, "body", Path::new("doc.txt")).await;
        assert_eq!(html, "body");
        assert_eq!(errors, "");
    }

    #[tokio::test]
    async fn missing_tools_are_reported_not_thrown() {
        let tool = ExternalTool {
            uses_stdin: true,
            uses_stdout: true,
            argv: &["codechat-absent-renderer"],
        };
        let (html, errors) = render_external(&tool, "", Path::new("x.txt")).await;
        assert_eq!(html, "");
        assert!(errors.contains(":: ERROR: CodeChat renderer - "));
    }
}
