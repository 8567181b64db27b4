//! Declarative rewrite rules.
//!
//! A [`RuleSet`] is a serializable list of selector/action pairs that turns
//! into element handlers, so rewrites can be configured from JSON instead of
//! code:
//!
//! ```json
//! {
//!   "rules": [
//!     { "selector": "a[href^='http']", "action": "set_attribute", "name": "rel", "value": "noopener" },
//!     { "selector": "script", "action": "remove" },
//!     { "selector": "h1", "action": "append", "content": " (draft)" }
//!   ],
//!   "append_to_end": "<!-- rewritten -->"
//! }
//! ```

use std::path::{Path, PathBuf};

use lol_html::html_content::{ContentType, Element};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::HtmlRewriter;
use crate::handlers::{DocumentHandlers, ElementHandlers};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rules from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid rule set: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Markup appended once the whole document has been parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_to_end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub selector: String,
    #[serde(flatten)]
    pub action: RuleAction,
}

/// What to do with each element a rule's selector matches.
///
/// Content is inserted as escaped text unless `html` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    SetAttribute {
        name: String,
        value: String,
    },
    RemoveAttribute {
        name: String,
    },
    Before {
        content: String,
        #[serde(default)]
        html: bool,
    },
    After {
        content: String,
        #[serde(default)]
        html: bool,
    },
    Prepend {
        content: String,
        #[serde(default)]
        html: bool,
    },
    Append {
        content: String,
        #[serde(default)]
        html: bool,
    },
    SetInnerContent {
        content: String,
        #[serde(default)]
        html: bool,
    },
    Replace {
        content: String,
        #[serde(default)]
        html: bool,
    },
    Remove,
    RemoveAndKeepContent,
}

impl RuleSet {
    pub fn from_json(json: &str) -> Result<Self, RuleError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RuleError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let rules = Self::from_json(&json)?;
        debug!(path = %path.display(), rules = rules.rules.len(), "loaded rule set");
        Ok(rules)
    }

    /// Register every rule on `rewriter`, in order.
    pub fn apply(&self, rewriter: HtmlRewriter) -> HtmlRewriter {
        let rewriter = self.rules.iter().fold(rewriter, |rewriter, rule| {
            let action = rule.action.clone();
            rewriter.on(
                rule.selector.clone(),
                ElementHandlers::new().element(move |el| {
                    action.apply(el)?;
                    Ok(())
                }),
            )
        });

        match &self.append_to_end {
            Some(markup) => {
                let markup = markup.clone();
                rewriter.on_document(DocumentHandlers::new().end(move |end| {
                    end.append(&markup, ContentType::Html);
                    Ok(())
                }))
            }
            None => rewriter,
        }
    }
}

fn content_type(html: bool) -> ContentType {
    if html {
        ContentType::Html
    } else {
        ContentType::Text
    }
}

impl RuleAction {
    fn apply(&self, el: &mut Element<'_, '_>) -> lol_html::HandlerResult {
        match self {
            RuleAction::SetAttribute { name, value } => el.set_attribute(name, value)?,
            RuleAction::RemoveAttribute { name } => el.remove_attribute(name),
            RuleAction::Before { content, html } => el.before(content, content_type(*html)),
            RuleAction::After { content, html } => el.after(content, content_type(*html)),
            RuleAction::Prepend { content, html } => el.prepend(content, content_type(*html)),
            RuleAction::Append { content, html } => el.append(content, content_type(*html)),
            RuleAction::SetInnerContent { content, html } => {
                el.set_inner_content(content, content_type(*html))
            }
            RuleAction::Replace { content, html } => el.replace(content, content_type(*html)),
            RuleAction::Remove => el.remove(),
            RuleAction::RemoveAndKeepContent => el.remove_and_keep_content(),
        }
        Ok(())
    }
}
