//! Project renders: a `codechat_config.yaml` in one of the source file's
//! ancestor directories hands the build to an external project builder
//! (Sphinx, PreTeXt, Doxygen, ...) which writes HTML to disk. This module
//! loads and validates the configuration, predicts where the builder will
//! put the HTML for a given source file, and runs the build when the
//! on-disk HTML is stale.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info};
use serde::Deserialize;

use crate::errors::*;
use crate::subprocess::{run_tool, tool_error, CommandSpec};

/// The kind of project builder; PreTeXt and Doxygen need special
/// treatment when locating their output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    #[default]
    General,
    #[serde(alias = "PreTeXt")]
    Pretext,
    #[serde(alias = "Doxygen")]
    Doxygen,
}

/// The schema of `codechat_config.yaml`. Unknown keys are rejected so a
/// typo surfaces as a schema error instead of silently using a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Where the source files live; defaults to the config file's
    /// directory. Relative paths resolve against that directory.
    pub source_path: Option<PathBuf>,
    /// Where the builder writes its HTML.
    pub output_path: PathBuf,
    /// The build command: a single shell-quoted string or an argv.
    pub args: CommandSpec,
    /// Extension of the produced HTML files.
    #[serde(default = "default_html_ext")]
    pub html_ext: String,
    #[serde(default)]
    pub project_type: ProjectType,
}

fn default_html_ext() -> String {
    ".html".to_string()
}

/// A config with its paths resolved against the config file's location.
#[derive(Debug, Clone)]
pub struct Project {
    /// Directory containing `codechat_config.yaml`.
    pub project_path: PathBuf,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub args: CommandSpec,
    pub html_ext: String,
    pub project_type: ProjectType,
}

impl Project {
    /// Read and validate the config file, resolving all paths.
    pub fn load(config_path: &Path) -> Result<Project> {
        let text = std::fs::read_to_string(config_path)
            .with_context(|| format!("Unable to open {}", config_path.display()))?;
        let config: ProjectConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid project configuration {}", config_path.display()))?;

        let project_path = config_path
            .parent()
            .ok_or_else(|| anyhow!("Config file has no parent directory"))?
            .to_path_buf();
        let resolve = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                project_path.join(path)
            }
        };

        Ok(Project {
            source_path: resolve(config.source_path.unwrap_or_default()),
            output_path: resolve(config.output_path),
            args: config.args,
            html_ext: config.html_ext,
            project_type: config.project_type,
            project_path,
        })
    }

    /// Predict the path of the HTML the builder produces for
    /// `file_path`. A source file outside `source_path` is a
    /// configuration error.
    pub fn expected_html_path(&self, file_path: &Path) -> Result<PathBuf> {
        let relative = crate::utils::fs::relative_to(file_path, &self.source_path)
            .ok_or_else(|| {
                anyhow!(
                    "{} is not inside the source path {}",
                    file_path.display(),
                    self.source_path.display()
                )
            })?;

        if self.project_type == ProjectType::Pretext {
            if let Some(target) = self.pretext_mapping_target(file_path) {
                return Ok(self.output_path.join(target));
            }
        }

        let name = match self.project_type {
            ProjectType::Doxygen => doxygen_escape(&relative),
            _ => {
                let stem = relative.with_extension("");
                format!("{}", stem.display())
            }
        };
        Ok(self.output_path.join(format!("{}{}", name, self.html_ext)))
    }

    /// PreTeXt writes `mapping.json` next to its output: canonical source
    /// path to a list of XML ids. Only the first id is used for the
    /// output guess.
    fn pretext_mapping_target(&self, file_path: &Path) -> Option<String> {
        let mapping_path = self.output_path.join("mapping.json");
        let text = std::fs::read(&mapping_path).ok()?;
        let mapping: HashMap<String, Vec<String>> = match serde_json::from_slice(&text) {
            Ok(mapping) => mapping,
            Err(e) => {
                debug!("ignoring malformed {}: {}", mapping_path.display(), e);
                return None;
            }
        };
        let canonical = file_path
            .canonicalize()
            .unwrap_or_else(|_| file_path.to_path_buf());
        let ids = mapping.get(&canonical.to_string_lossy().to_string())?;
        ids.first().map(|id| format!("{}{}", id, self.html_ext))
    }

    /// Substitute the documented placeholders into one build argument.
    fn substitute(&self, arg: &str) -> String {
        arg.replace("{project_path}", &self.project_path.to_string_lossy())
            .replace("{source_path}", &self.source_path.to_string_lossy())
            .replace("{output_path}", &self.output_path.to_string_lossy())
    }
}

/// Doxygen escapes output file names: `_` doubles, `.` becomes `_8` and
/// path separators become `_2`.
fn doxygen_escape(relative: &Path) -> String {
    let mut escaped = String::new();
    for ch in relative.to_string_lossy().chars() {
        match ch {
            '_' => escaped.push_str("__"),
            '.' => escaped.push_str("_8"),
            '/' | '\\' => escaped.push_str("_2"),
            ch => escaped.push(ch),
        }
    }
    escaped
}

/// The result of a project render; `html_path` is the best guess even
/// when diagnostics were produced.
#[derive(Debug)]
pub struct ProjectRender {
    pub html_path: PathBuf,
    pub errors: String,
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Render one file of a project: load the config, skip the build when the
/// on-disk HTML is already newer than the source, otherwise run the
/// builder with its stdout streamed to `co_build`, then recheck. All
/// diagnostics are accumulated into the error string.
pub async fn render_project(
    config_path: &Path,
    file_path: &Path,
    co_build: &mut (dyn FnMut(String) + Send),
) -> Result<ProjectRender> {
    let project = Project::load(config_path)?;
    let html_path = project.expected_html_path(file_path)?;
    let mut errors = String::new();

    let source_time = mtime(file_path);
    let html_time = mtime(&html_path);
    let up_to_date = matches!((source_time, html_time), (Some(src), Some(html)) if html > src);

    if up_to_date {
        info!(
            "{} is newer than {}; skipping the build",
            html_path.display(),
            file_path.display()
        );
        co_build(format!(
            "Skipping the build; {} is up to date.\n",
            html_path.display()
        ));
    } else {
        let argv: Vec<String> = project
            .args
            .to_argv()?
            .iter()
            .map(|arg| project.substitute(arg))
            .collect();
        let output = run_tool(&argv, &project.project_path, None, Some(co_build)).await;
        errors.push_str(&output.error);
        errors.push_str(&output.stderr);

        if !html_path.exists() {
            errors.push_str(&tool_error(format_args!(
                "the build did not produce {}",
                html_path.display()
            )));
        }
    }

    Ok(ProjectRender { html_path, errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(crate::constants::PROJECT_CONFIG_FILE);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_fill_in_source_path_and_html_ext() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), "output_path: _build\nargs: make html\n");
        let project = Project::load(&config).unwrap();
        assert_eq!(project.source_path, dir.path());
        assert_eq!(project.output_path, dir.path().join("_build"));
        assert_eq!(project.html_ext, ".html");
        assert_eq!(project.project_type, ProjectType::General);
    }

    #[test]
    fn unknown_keys_are_a_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), "output_path: _build\nargs: make\ntypo: 1\n");
        assert!(Project::load(&config).is_err());
    }

    #[test]
    fn missing_required_keys_are_a_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), "source_path: src\n");
        assert!(Project::load(&config).is_err());
    }

    #[test]
    fn expected_output_substitutes_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), "output_path: _build\nargs: make\n");
        let project = Project::load(&config).unwrap();
        let html = project
            .expected_html_path(&dir.path().join("docs/intro.rst"))
            .unwrap();
        assert_eq!(html, dir.path().join("_build").join("docs/intro.html"));
    }

    #[test]
    fn files_outside_the_source_path_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), "output_path: _build\nargs: make\n");
        let project = Project::load(&config).unwrap();
        assert!(project.expected_html_path(Path::new("/elsewhere/x.rst")).is_err());
    }

    #[test]
    fn doxygen_names_are_escaped() {
        assert_eq!(doxygen_escape(Path::new("dir/my_file.py")), "dir_2my__file_8py");
    }

    #[test]
    fn pretext_prefers_the_first_mapping_entry() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        let source = dir.path().join("chapter.ptx");
        fs::write(&source, "<section/>").unwrap();
        let canonical = source.canonicalize().unwrap();
        let mapping = serde_json::json!({
            canonical.to_string_lossy(): ["sec-first", "sec-second"]
        });
        fs::write(out.join("mapping.json"), mapping.to_string()).unwrap();

        let config = write_config(
            dir.path(),
            "output_path: out\nargs: pretext build\nproject_type: pretext\n",
        );
        let project = Project::load(&config).unwrap();
        let html = project.expected_html_path(&source).unwrap();
        assert_eq!(html, out.join("sec-first.html"));
    }

    #[tokio::test]
    async fn stale_output_triggers_a_build_and_fresh_output_skips_it() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("index.rst");
        fs::write(&source, "hi").unwrap();
        // Keep the source's mtime strictly older than the build output.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // The "builder" just creates the expected output file.
        let config = write_config(
            dir.path(),
            "output_path: _build\nargs: sh -c 'mkdir -p _build && echo built > _build/index.html'\n",
        );

        let mut build_log = String::new();
        let mut cb = |chunk: String| build_log.push_str(&chunk);
        let render = render_project(&config, &source, &mut cb).await.unwrap();
        assert_eq!(render.errors, "");
        assert!(render.html_path.exists());

        // Second render: the HTML is now newer than the source.
        let mut build_log = String::new();
        let mut cb = |chunk: String| build_log.push_str(&chunk);
        let render = render_project(&config, &source, &mut cb).await.unwrap();
        assert_eq!(render.errors, "");
        assert!(build_log.contains("Skipping the build"), "got: {}", build_log);
    }

    #[tokio::test]
    async fn a_build_that_produces_nothing_is_diagnosed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("index.rst");
        fs::write(&source, "hi").unwrap();
        let config = write_config(dir.path(), "output_path: _build\nargs: \"true\"\n");

        let mut cb = |_chunk: String| {};
        let render = render_project(&config, &source, &mut cb).await.unwrap();
        assert!(render.errors.contains("did not produce"), "got: {}", render.errors);
    }
}
