use crate::config::Templates;
use crate::model::SubjectType;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing template parameter '{0}'")]
    MissingParam(String),
    #[error("unterminated placeholder in template")]
    Unterminated,
}

/// Message templates per subject type. `{name}` is replaced by `payload.name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplates {
    appointment: String,
    check_in: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self::from(&Templates::default())
    }
}

impl From<&Templates> for MessageTemplates {
    fn from(t: &Templates) -> Self {
        Self {
            appointment: t.appointment.clone(),
            check_in: t.check_in.clone(),
        }
    }
}

impl MessageTemplates {
    pub fn render_for(&self, subject: SubjectType, payload: &Value) -> Result<String, RenderError> {
        let template = match subject {
            SubjectType::Appointment => &self.appointment,
            SubjectType::CheckIn => &self.check_in,
        };
        render(template, payload)
    }
}

pub fn render(template: &str, payload: &Value) -> Result<String, RenderError> {
    let params = payload.as_object().ok_or(RenderError::NotAnObject)?;
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or(RenderError::Unterminated)?;
        let key = after[..end].trim();
        let value = match params.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => return Err(RenderError::MissingParam(key.to_string())),
        };
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
