use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use crate::{
    error::PipelineError,
    history::HistoryEntry,
    pipeline::PipelineTask,
    settings::{AnswererEntry, SettingsError, TemplatePaths},
};

/// Turns a prompt context into the text sent to an interpreter.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, task: PipelineTask, context: &PromptContext) -> Result<String, PipelineError>;
}

/// Answerer as seen by the routing template, numbered from 1.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CatalogEntry {
    pub number: usize,
    pub name: String,
    pub description: String,
}

/// Variables available to templates. Keys that a stage does not provide are
/// left out, so `{{#if rewritten_text}}` works as expected.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct PromptContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answerers: Option<Vec<CatalogEntry>>,
}

impl PromptContext {
    pub fn with_history(history: Vec<HistoryEntry>) -> Self {
        Self { history: Some(history), ..Self::default() }
    }

    pub fn for_routing(rewritten_text: String, answerers: &[AnswererEntry]) -> Self {
        let catalog = answerers
            .iter()
            .enumerate()
            .map(|(i, a)| CatalogEntry {
                number: i + 1,
                name: a.name.clone(),
                description: a.description.clone(),
            })
            .collect();
        Self {
            rewritten_text: Some(rewritten_text),
            answerers: Some(catalog),
            ..Self::default()
        }
    }
}

/// Handlebars templates, one per interpreter task, registered under the task name.
///
/// Output is not HTML-escaped: prompts are plain text.
///
/// A routing template might read:
/// ```handlebars
/// Which bot should answer "{{rewritten_text}}"?
/// {{#each answerers}}
/// {{number}}) {{name}}: {{description}}
/// {{/each}}
/// Reply with the number only.
/// ```
pub struct HandlebarsRenderer {
    registry: Handlebars<'static>,
}

impl HandlebarsRenderer {
    fn empty() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    /// Load every interpreter template from disk. Fails on the first missing
    /// or malformed file.
    pub fn from_files(paths: &TemplatePaths) -> Result<Self, SettingsError> {
        let mut renderer = Self::empty();
        for task in PipelineTask::INTERPRETED {
            let Some(path) = paths.path_for(task) else { continue };
            renderer
                .registry
                .register_template_file(task.as_str(), path)
                .map_err(|e| SettingsError::Template {
                    task,
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            debug!("registered {} template from {}", task, path.display());
        }
        Ok(renderer)
    }

    pub fn from_strings<'a>(
        templates: impl IntoIterator<Item = (PipelineTask, &'a str)>,
    ) -> Result<Self, handlebars::TemplateError> {
        let mut renderer = Self::empty();
        for (task, template) in templates {
            renderer.registry.register_template_string(task.as_str(), template)?;
        }
        Ok(renderer)
    }
}

impl PromptRenderer for HandlebarsRenderer {
    fn render(&self, task: PipelineTask, context: &PromptContext) -> Result<String, PipelineError> {
        if !self.registry.has_template(task.as_str()) {
            return Err(PipelineError::Render {
                task,
                reason: "no template registered".into(),
            });
        }
        self.registry
            .render(task.as_str(), context)
            .map_err(|e| PipelineError::Render { task, reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn entry(text: &str, human: bool) -> HistoryEntry {
        HistoryEntry { sender_id: "p".into(), text: text.into(), sent_by_human: human }
    }

    #[test]
    fn test_history_template_without_escaping() {
        let r = HandlebarsRenderer::from_strings([(
            PipelineTask::Rewrite,
            "{{#each history}}{{#if sent_by_human}}user{{else}}bot{{/if}}: {{text}}\n{{/each}}",
        )])
        .unwrap();
        let ctx = PromptContext::with_history(vec![entry("it's <b>", true), entry("«Paris»", false)]);
        let text = r.render(PipelineTask::Rewrite, &ctx).unwrap();
        assert_eq!(text, "user: it's <b>\nbot: «Paris»\n");
    }

    #[test]
    fn test_routing_catalog_is_numbered_in_order() {
        let r = HandlebarsRenderer::from_strings([(
            PipelineTask::Route,
            "{{rewritten_text}}|{{#each answerers}}{{number}}={{name}};{{/each}}",
        )])
        .unwrap();
        let answerers = vec![
            AnswererEntry { name: "Zeta".into(), description: "z".into() },
            AnswererEntry { name: "Alpha".into(), description: "a".into() },
        ];
        let ctx = PromptContext::for_routing("Q?".into(), &answerers);
        assert_eq!(r.render(PipelineTask::Route, &ctx).unwrap(), "Q?|1=Zeta;2=Alpha;");
    }

    #[test]
    fn test_missing_template_is_render_error() {
        let r = HandlebarsRenderer::from_strings(Vec::<(PipelineTask, &str)>::new()).unwrap();
        let err = r.render(PipelineTask::Answer, &PromptContext::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Render { task: PipelineTask::Answer, .. }));
    }

    #[test]
    fn test_from_files() {
        let dir = tempdir().unwrap();
        for name in ["rewrite", "route", "completion"] {
            fs::write(dir.path().join(format!("{name}.hbs")), format!("{name}: {{{{rewritten_text}}}}")).unwrap();
        }
        let paths = TemplatePaths {
            rewrite: dir.path().join("rewrite.hbs"),
            route: dir.path().join("route.hbs"),
            completion: dir.path().join("completion.hbs"),
        };
        let r = HandlebarsRenderer::from_files(&paths).unwrap();
        let ctx = PromptContext { rewritten_text: Some("x".into()), ..PromptContext::default() };
        assert_eq!(r.render(PipelineTask::Route, &ctx).unwrap(), "route: x");
    }

    #[test]
    fn test_from_files_missing() {
        let paths = TemplatePaths {
            rewrite: PathBuf::from("/nonexistent/rewrite.hbs"),
            route: PathBuf::from("/nonexistent/route.hbs"),
            completion: PathBuf::from("/nonexistent/completion.hbs"),
        };
        match HandlebarsRenderer::from_files(&paths) {
            Err(SettingsError::Template { task, .. }) => assert_eq!(task, PipelineTask::Rewrite),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("missing templates must fail"),
        }
    }
}
