use std::fmt::Write;

/// Diagnostic breadcrumbs accumulated while loading configuration or
/// executing statements. The context is an explicit value threaded through
/// the call graph; `store`/`recall` bracket nested operations so an inner
/// activity does not clobber the outer one.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    resource: Option<String>,
    activity: Option<String>,
    object: Option<String>,
    message: Option<String>,
    sql: Option<String>,
    stored: Vec<SavedFrame>,
}

#[derive(Debug, Clone, Default)]
struct SavedFrame {
    resource: Option<String>,
    activity: Option<String>,
    object: Option<String>,
    message: Option<String>,
    sql: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(&mut self, resource: impl Into<String>) -> &mut Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn activity(&mut self, activity: impl Into<String>) -> &mut Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn object(&mut self, object: impl Into<String>) -> &mut Self {
        self.object = Some(object.into());
        self
    }

    pub fn message(&mut self, message: impl Into<String>) -> &mut Self {
        self.message = Some(message.into());
        self
    }

    pub fn sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.sql = Some(sql.into());
        self
    }

    /// Pushes the current frame and starts a fresh one for a nested
    /// operation.
    pub fn store(&mut self) {
        let frame = SavedFrame {
            resource: self.resource.take(),
            activity: self.activity.take(),
            object: self.object.take(),
            message: self.message.take(),
            sql: self.sql.take(),
        };
        self.stored.push(frame);
    }

    /// Pops the most recently stored frame, discarding the nested one.
    pub fn recall(&mut self) {
        if let Some(frame) = self.stored.pop() {
            self.resource = frame.resource;
            self.activity = frame.activity;
            self.object = frame.object;
            self.message = frame.message;
            self.sql = frame.sql;
        }
    }

    pub fn reset(&mut self) {
        *self = ErrorContext::default();
    }

    /// Renders the breadcrumb as the stable multi-line diagnostic that gets
    /// attached to error messages.
    pub fn render(&self, cause: &dyn std::fmt::Display) -> String {
        let mut out = String::new();
        if let Some(message) = &self.message {
            let _ = write!(out, "\n### {message}");
        }
        if let Some(resource) = &self.resource {
            let _ = write!(out, "\n### The error may exist in {resource}");
        }
        if let Some(object) = &self.object {
            let _ = write!(out, "\n### The error may involve {object}");
        }
        if let Some(activity) = &self.activity {
            let _ = write!(out, "\n### The error occurred while {activity}");
        }
        if let Some(sql) = &self.sql {
            let flattened = sql.split_whitespace().collect::<Vec<_>>().join(" ");
            let _ = write!(out, "\n### SQL: {flattened}");
        }
        let _ = write!(out, "\n### Cause: {cause}");
        out.trim_start_matches('\n').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_fields() {
        let mut ctx = ErrorContext::new();
        ctx.resource("users.xml")
            .activity("executing a query")
            .object("app.UserMapper.selectUser")
            .sql("SELECT *\n  FROM users");
        let rendered = ctx.render(&"boom");
        assert_eq!(
            rendered,
            "### The error may exist in users.xml\n\
             ### The error may involve app.UserMapper.selectUser\n\
             ### The error occurred while executing a query\n\
             ### SQL: SELECT * FROM users\n\
             ### Cause: boom"
        );
    }

    #[test]
    fn store_and_recall_bracket_nested_operations() {
        let mut ctx = ErrorContext::new();
        ctx.activity("outer");
        ctx.store();
        ctx.activity("inner");
        assert!(ctx.render(&"x").contains("inner"));
        ctx.recall();
        assert!(ctx.render(&"x").contains("outer"));
    }

    #[test]
    fn recall_on_empty_stack_is_a_no_op() {
        let mut ctx = ErrorContext::new();
        ctx.activity("only");
        ctx.recall();
        assert!(ctx.render(&"x").contains("only"));
    }
}
