//! Template variable expansion for Auto Run task text.

use chrono::Utc;
use std::collections::HashMap;

/// Values available for `{{VAR}}` substitution in a task's text at
/// dispatch time.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub agent_name: String,
    pub agent_path: String,
    pub agent_session_id: String,
    pub agent_group: String,
    pub loop_number: u32,
    pub document_name: String,
}

impl TemplateContext {
    fn values(&self) -> HashMap<&'static str, String> {
        let now = Utc::now();
        HashMap::from([
            ("AGENT_NAME", self.agent_name.clone()),
            ("AGENT_PATH", self.agent_path.clone()),
            ("AGENT_SESSION_ID", self.agent_session_id.clone()),
            ("AGENT_GROUP", self.agent_group.clone()),
            ("DATE", now.format("%Y-%m-%d").to_string()),
            ("TIME", now.format("%H:%M:%S").to_string()),
            ("LOOP_NUMBER", self.loop_number.to_string()),
            ("DOCUMENT_NAME", self.document_name.clone()),
        ])
    }

    /// Expand every recognized `{{VAR}}` occurrence in `text`. Unrecognized
    /// `{{...}}` placeholders are left untouched.
    pub fn expand(&self, text: &str) -> String {
        let values = self.values();
        let mut out = text.to_string();
        for (key, value) in values {
            out = out.replace(&format!("{{{{{key}}}}}"), &value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_variables() {
        let ctx = TemplateContext {
            agent_name: "claude-code".into(),
            document_name: "fix-imports.md".into(),
            loop_number: 2,
            ..Default::default()
        };
        let expanded = ctx.expand("Run on {{AGENT_NAME}} for {{DOCUMENT_NAME}}, iteration {{LOOP_NUMBER}}");
        assert_eq!(expanded, "Run on claude-code for fix-imports.md, iteration 2");
    }

    #[test]
    fn leaves_unknown_placeholders_untouched() {
        let ctx = TemplateContext::default();
        assert_eq!(ctx.expand("keep {{SOMETHING_ELSE}}"), "keep {{SOMETHING_ELSE}}");
    }
}
