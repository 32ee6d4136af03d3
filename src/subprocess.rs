//! Drives external tools: spawn an argv with a given working directory,
//! feed the child's stdin from a string, stream or collect stdout, and
//! always collect stderr. Failures in locating or launching the
//! executable, in decoding, or in the child itself never escape a call;
//! they are folded into the returned error string.

use std::path::Path;
use std::process::Stdio;

use log::trace;
use memchr::memchr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::errors::*;

/// A command as it appears in a project configuration or the renderer
/// table: either pre-split, or a single line tokenised with shell-like
/// quoting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Args(Vec<String>),
}

impl CommandSpec {
    /// Tokenise into an argv. An empty or unparseable command is an error.
    pub fn to_argv(&self) -> Result<Vec<String>> {
        let argv = match self {
            CommandSpec::Args(args) => args.clone(),
            CommandSpec::Line(line) => {
                shlex::split(line).ok_or_else(|| anyhow!("Invalid quoting in command: {}", line))?
            }
        };
        if argv.is_empty() {
            bail!("Command string was empty");
        }
        Ok(argv)
    }
}

/// Everything a tool run produces. `error` is empty on success.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub error: String,
}

/// Canonical error line for anything that goes wrong while driving an
/// external renderer. These lines end up in the viewer's errors pane.
pub fn tool_error(msg: impl std::fmt::Display) -> String {
    format!(":: ERROR: CodeChat renderer - {}\n", msg)
}

/// Incremental UTF-8 decoder. Incomplete trailing sequences are held for
/// the next feed; invalid bytes are replaced by `\xNN` escapes rather
/// than failing, so binary garbage from a tool still reaches the user.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    held: Vec<u8>,
}

impl Utf8Decoder {
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.held);
        data.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest = data.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, invalid) = rest.split_at(e.valid_up_to());
                    // Safe: `valid_up_to` bytes are valid UTF-8.
                    out.push_str(std::str::from_utf8(valid).unwrap());
                    match e.error_len() {
                        Some(n) => {
                            for byte in &invalid[..n] {
                                out.push_str(&format!("\\x{:02x}", byte));
                            }
                            rest = &invalid[n..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk.
                            rest = invalid;
                            break;
                        }
                    }
                }
            }
        }
        self.held = rest.to_vec();
        out
    }

    /// Decode whatever is still held; at EOF an incomplete sequence can
    /// never complete, so it is escaped.
    pub fn flush(&mut self) -> String {
        let held = std::mem::take(&mut self.held);
        held.iter().map(|b| format!("\\x{:02x}", b)).collect()
    }
}

/// Incremental universal-newline decoder: `\r\n` and `\r` become `\n`. A
/// chunk ending in `\r` cannot be classified until the next byte arrives,
/// so the `\r` is held.
#[derive(Debug, Default)]
pub struct NewlineDecoder {
    held_cr: bool,
}

impl NewlineDecoder {
    pub fn feed(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 1);
        let mut rest = text;
        if self.held_cr {
            self.held_cr = false;
            out.push('\n');
            if let Some(stripped) = rest.strip_prefix('\n') {
                rest = stripped;
            }
        }
        let bytes = rest.as_bytes();
        let mut start = 0;
        while let Some(at) = memchr(b'\r', &bytes[start..]) {
            let at = start + at;
            out.push_str(&rest[start..at]);
            match bytes.get(at + 1) {
                Some(b'\n') => {
                    out.push('\n');
                    start = at + 2;
                }
                Some(_) => {
                    out.push('\n');
                    start = at + 1;
                }
                None => {
                    self.held_cr = true;
                    start = at + 1;
                }
            }
        }
        out.push_str(&rest[start..]);
        out
    }

    pub fn flush(&mut self) -> String {
        if std::mem::take(&mut self.held_cr) {
            "\n".to_string()
        } else {
            String::new()
        }
    }
}

/// Run `argv` with `cwd` as the working directory.
///
/// When `co_build` is provided, decoded stdout chunks are forwarded to it
/// as they arrive (with a forced flush at EOF) and `ToolOutput::stdout`
/// stays empty; otherwise stdout is collected in full. Stderr is always
/// collected in full.
pub async fn run_tool(
    argv: &[String],
    cwd: &Path,
    input: Option<&str>,
    mut co_build: Option<&mut (dyn FnMut(String) + Send)>,
) -> ToolOutput {
    let mut output = ToolOutput::default();
    let (exe, args) = match argv.split_first() {
        Some(split) => split,
        None => {
            output.error = tool_error("empty command");
            return output;
        }
    };

    trace!("spawning {:?} {:?} in {}", exe, args, cwd.display());
    let mut command = Command::new(exe);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            output.error = tool_error(format_args!("error starting {}: {}", exe, e));
            return output;
        }
    };

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take().expect("child stdout was piped");
    let mut stderr = child.stderr.take().expect("child stderr was piped");
    let input = input.map(str::to_owned);

    let write_stdin = async {
        if let (Some(mut pipe), Some(text)) = (stdin.take(), input) {
            // A tool that never reads its stdin closes the pipe early;
            // that is its business, not a render failure.
            let _ = pipe.write_all(text.as_bytes()).await;
        }
    };

    let read_stdout = async {
        let mut utf8 = Utf8Decoder::default();
        let mut newlines = NewlineDecoder::default();
        let mut collected = String::new();
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = match co_build {
                        Some(_) => newlines.feed(&utf8.feed(&buf[..n])),
                        None => utf8.feed(&buf[..n]),
                    };
                    match co_build.as_deref_mut() {
                        Some(cb) if !chunk.is_empty() => cb(chunk),
                        Some(_) => {}
                        None => collected.push_str(&chunk),
                    }
                }
                Err(e) => return (collected, tool_error(format_args!("reading stdout: {}", e))),
            }
        }
        let tail = match co_build {
            Some(_) => newlines.feed(&utf8.flush()) + &newlines.flush(),
            None => utf8.flush(),
        };
        match co_build.as_deref_mut() {
            Some(cb) if !tail.is_empty() => cb(tail),
            Some(_) => {}
            None => collected.push_str(&tail),
        }
        (collected, String::new())
    };

    let read_stderr = async {
        let mut utf8 = Utf8Decoder::default();
        let mut collected = String::new();
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => collected.push_str(&utf8.feed(&buf[..n])),
                Err(e) => {
                    collected.push_str(&tool_error(format_args!("reading stderr: {}", e)));
                    break;
                }
            }
        }
        collected + &utf8.flush()
    };

    let (_, (stdout_text, stdout_err), stderr_text) =
        tokio::join!(write_stdin, read_stdout, read_stderr);
    output.stdout = stdout_text;
    output.stderr = stderr_text;
    output.error.push_str(&stdout_err);

    match child.wait().await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            output
                .error
                .push_str(&tool_error(format_args!("{} exited with {}", exe, status)));
        }
        Err(e) => {
            output
                .error
                .push_str(&tool_error(format_args!("error waiting for {}: {}", exe, e)));
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_lines_are_tokenised_with_quoting() {
        let spec = CommandSpec::Line(r#"sphinx-build -b html "my docs" _build"#.to_string());
        assert_eq!(
            spec.to_argv().unwrap(),
            vec!["sphinx-build", "-b", "html", "my docs", "_build"]
        );
    }

    #[test]
    fn empty_commands_are_rejected() {
        assert!(CommandSpec::Line("".to_string()).to_argv().is_err());
        assert!(CommandSpec::Args(vec![]).to_argv().is_err());
    }

    #[test]
    fn utf8_decoder_holds_split_sequences() {
        let mut dec = Utf8Decoder::default();
        // "é" (0xc3 0xa9) split across two feeds.
        assert_eq!(dec.feed(&[b'a', 0xc3]), "a");
        assert_eq!(dec.feed(&[0xa9, b'b']), "éb");
        assert_eq!(dec.flush(), "");
    }

    #[test]
    fn utf8_decoder_escapes_invalid_bytes() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.feed(&[b'a', 0xff, b'b']), "a\\xffb");
        // A dangling lead byte at EOF is escaped by the flush.
        assert_eq!(dec.feed(&[0xc3]), "");
        assert_eq!(dec.flush(), "\\xc3");
    }

    #[test]
    fn newline_decoder_translates_universally() {
        let mut dec = NewlineDecoder::default();
        assert_eq!(dec.feed("a\r\nb\rc\n"), "a\nb\nc\n");
        assert_eq!(dec.flush(), "");
    }

    #[test]
    fn newline_decoder_holds_a_trailing_cr() {
        let mut dec = NewlineDecoder::default();
        assert_eq!(dec.feed("line\r"), "line");
        // The held CR pairs with the \n that starts the next chunk.
        assert_eq!(dec.feed("\nmore"), "\nmore");
        assert_eq!(dec.feed("tail\r"), "tail");
        assert_eq!(dec.flush(), "\n");
    }

    #[tokio::test]
    async fn collects_stdout_and_stderr() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo out; echo err >&2".to_string(),
        ];
        let out = run_tool(&argv, Path::new("."), None, None).await;
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.error, "");
    }

    #[tokio::test]
    async fn streams_stdout_to_the_callback() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf 'a\\r\\nb\\r'".to_string(),
        ];
        let mut chunks = String::new();
        let mut cb = |chunk: String| chunks.push_str(&chunk);
        let out = run_tool(&argv, Path::new("."), None, Some(&mut cb)).await;
        assert_eq!(out.stdout, "");
        assert_eq!(chunks, "a\nb\n");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let argv = vec!["cat".to_string()];
        let out = run_tool(&argv, Path::new("."), Some("hello"), None).await;
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn missing_executables_become_error_strings() {
        let argv = vec!["codechat-no-such-tool".to_string()];
        let out = run_tool(&argv, Path::new("."), None, None).await;
        assert!(out.error.contains(":: ERROR: CodeChat renderer - "));
        assert!(out.error.contains("codechat-no-such-tool"));
    }

    #[tokio::test]
    async fn nonzero_exits_become_error_strings() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let out = run_tool(&argv, Path::new("."), None, None).await;
        assert!(out.error.contains("exited with"));
    }
}
