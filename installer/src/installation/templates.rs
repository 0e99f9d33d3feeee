// Environment materialization
//
// Every `<suffix>` file under the selected template directory is rendered against the binding
// tree and written to the same relative path under the config root, with the suffix stripped.
// Rendering is deterministic, so re-running over an existing tree rewrites identical bytes.

use anyhow::{Context, Result};
use log::{debug, info};
use minijinja::Environment;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::installation::files::{collect_files_recursive, write_file_with_retries};

/// Pure `render(template, bindings) -> text` seam.
pub trait Renderer: Send + Sync {
    fn render(&self, name: &str, template: &str, bindings: &Value) -> Result<String>;
}

/// Jinja-syntax renderer (`{{ db.host }}`, `{% if redis %}…{% endif %}`).
///
/// Nothing is auto-escaped. Templates quote string values with the `toml_str` and
/// `php_str` filters, which emit a complete literal including its quotes.
#[derive(Debug, Default, Clone)]
pub struct JinjaRenderer;

fn plain_text(value: &minijinja::Value) -> String {
    if value.is_undefined() || value.is_none() {
        String::new()
    } else {
        value.to_string()
    }
}

/// TOML string literal for `value`.
pub fn toml_string_literal(value: minijinja::Value) -> String {
    toml::Value::String(plain_text(&value)).to_string()
}

/// Single-quoted PHP string literal for `value`.
pub fn php_string_literal(value: minijinja::Value) -> String {
    let text = plain_text(&value);
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

impl Renderer for JinjaRenderer {
    fn render(&self, name: &str, template: &str, bindings: &Value) -> Result<String> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_filter("toml_str", toml_string_literal);
        env.add_filter("php_str", php_string_literal);
        env.add_template(name, template)
            .with_context(|| format!("parse template {}", name))?;
        let tmpl = env.get_template(name)?;
        let rendered = tmpl
            .render(bindings)
            .with_context(|| format!("render template {}", name))?;
        Ok(rendered)
    }
}

/// Destination of `file` once moved from `template_root` to `config_root` with `suffix`
/// stripped from its name. `None` when the file is outside the template root or stripping
/// the suffix leaves the path unchanged (or empty).
pub fn relocate(
    file: &Path,
    template_root: &Path,
    config_root: &Path,
    suffix: &str,
) -> Option<PathBuf> {
    let relative = file.strip_prefix(template_root).ok()?;
    let name = relative.file_name()?.to_str()?;
    let stripped = name.strip_suffix(suffix)?;
    if stripped.is_empty() || suffix.is_empty() {
        return None;
    }
    Some(config_root.join(relative.with_file_name(stripped)))
}

#[derive(Debug, Clone, Default)]
pub struct MaterializeReport {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Rendered `.toml` files must parse before anything is written.
fn check_rendered(destination: &Path, rendered: &str) -> Result<()> {
    if destination.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str::<toml::Table>(rendered)
            .with_context(|| format!("rendered {:?} is not valid TOML", destination))?;
    }
    Ok(())
}

/// Render and write every template under `template_dir`.
///
/// All templates are rendered and checked before anything is written; any render, check or
/// write failure fails the whole call. Files already written in this call are left in place.
pub async fn materialize(
    renderer: &dyn Renderer,
    template_dir: &Path,
    config_root: &Path,
    suffix: &str,
    bindings: &Value,
) -> Result<MaterializeReport> {
    let started = Instant::now();
    if !template_dir.is_dir() {
        anyhow::bail!("Template directory not found: {:?}", template_dir);
    }

    let files = collect_files_recursive(template_dir, suffix).await?;
    let mut report = MaterializeReport::default();
    let mut pending: Vec<(PathBuf, String)> = Vec::with_capacity(files.len());

    for file in files {
        let Some(destination) = relocate(&file, template_dir, config_root, suffix) else {
            debug!(
                "[PHASE: environment] [STEP: materialize] Skipping template with unchanged path (file={:?})",
                file
            );
            report.skipped.push(file);
            continue;
        };

        let source = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("read template {:?}", file))?;
        let name = file
            .strip_prefix(template_dir)
            .unwrap_or(&file)
            .to_string_lossy()
            .to_string();
        let rendered = renderer.render(&name, &source, bindings)?;
        check_rendered(&destination, &rendered)?;
        pending.push((destination, rendered));
    }

    for (destination, rendered) in pending {
        write_file_with_retries(&destination, rendered.as_bytes(), "materialize")
            .await
            .with_context(|| format!("Unable to write {:?}", destination))?;
        report.written.push(destination);
    }

    info!(
        "[PHASE: environment] [STEP: materialize] Materialized templates (template_dir={:?}, config_root={:?}, written={}, skipped={}, duration_ms={})",
        template_dir,
        config_root,
        report.written.len(),
        report.skipped.len(),
        started.elapsed().as_millis()
    );
    Ok(report)
}
