use std::collections::HashMap;
use std::error::Error as StdError;

use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use crate::error::{Error, ErrorDetails};

/// Wraps a `minijinja::Environment` configured as a sandboxed
/// mini-language over JSON values, pure and deterministic given the same template source and
/// arguments. `UndefinedBehavior::Strict` turns a reference to an unset variable into a
/// render error instead of silently rendering nothing, which is what lets us treat "the
/// template needs variables" as a config-validation-time question (`template_needs_variables`
/// below) rather than a request-time surprise.
#[derive(Debug)]
pub struct TemplateConfig<'a> {
    env: Environment<'a>,
    template_paths: HashMap<String, String>,
}

impl Default for TemplateConfig<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> TemplateConfig<'a> {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self {
            env,
            template_paths: HashMap::new(),
        }
    }

    /// Loads every `(name, path)` pair at startup so rendering never touches the filesystem
    /// Template rendering happens once, at request resolution time.
    pub fn initialize(&mut self, templates: HashMap<String, std::path::PathBuf>) -> Result<(), Error> {
        for (name, path) in templates {
            let contents = std::fs::read_to_string(&path).map_err(|e| ErrorDetails::Config {
                message: format!("Failed to read template `{name}` at {}: {e}", path.display()),
            })?;
            self.env
                .add_template_owned(name.clone(), contents)
                .map_err(|e| ErrorDetails::TemplateError {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            self.template_paths
                .insert(name, path.display().to_string());
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn add_template(&mut self, name: &str, contents: &str) -> Result<(), Error> {
        self.env
            .add_template_owned(name.to_string(), contents.to_string())
            .map_err(|e| {
                ErrorDetails::TemplateError {
                    name: name.to_string(),
                    message: e.to_string(),
                }
                .into()
            })
    }

    pub fn template_exists(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    /// Renders template `name` with `context`, walking the full `minijinja` error chain into
    /// a single message so callers get the line/cause information instead of just "invalid
    /// operation".
    pub fn template_message(&self, name: &str, context: &Value) -> Result<String, Error> {
        let template = self
            .env
            .get_template(name)
            .map_err(|e| ErrorDetails::TemplateError {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        template.render(context).map_err(|err| {
            let mut message = err.to_string();
            let mut source = err.source();
            while let Some(err) = source {
                message.push_str(&format!("\ncaused by: {err}"));
                source = err.source();
            }
            ErrorDetails::TemplateError {
                name: name.to_string(),
                message,
            }
            .into()
        })
    }

    /// Whether a template references any variable at all, used at config-validation time to
    /// enforce "if a function declares a system template, every request must supply system
    /// template arguments".
    pub fn template_needs_variables(&self, name: &str) -> Result<bool, Error> {
        let template = self
            .env
            .get_template(name)
            .map_err(|e| ErrorDetails::TemplateError {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(!template.undeclared_variables(true).is_empty())
    }

    pub fn path_for(&self, name: &str) -> Option<&str> {
        self.template_paths.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_with_variables() {
        let mut config = TemplateConfig::new();
        config.add_template("greeting", "Hello, {{ name }}!").unwrap();
        let rendered = config
            .template_message("greeting", &json!({"name": "Ferris"}))
            .unwrap();
        assert_eq!(rendered, "Hello, Ferris!");
    }

    #[test]
    fn strict_undefined_variable_is_an_error() {
        let mut config = TemplateConfig::new();
        config.add_template("greeting", "Hello, {{ name }}!").unwrap();
        let result = config.template_message("greeting", &json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn detects_whether_template_needs_variables() {
        let mut config = TemplateConfig::new();
        config.add_template("static", "Hello!").unwrap();
        config.add_template("dynamic", "Hello, {{ name }}!").unwrap();
        assert!(!config.template_needs_variables("static").unwrap());
        assert!(config.template_needs_variables("dynamic").unwrap());
    }
}
