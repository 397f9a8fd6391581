//! Stub contracts for `browser_*`/`vnc_*`/`vision_*` operations: real
//! argument-schema validation and a structured "missing backend" error,
//! without implementing browser automation, VNC control, or vision model
//! calls. Each operation still reports the output type tag
//! (`browser_content`/`vnc_frame`/`vision_result`) its real implementation
//! would use, since the Context Assembler's large-result collapsing keys
//! off these exact tags.

use serde_json::Value;

/// A named stub operation: its argument schema (for `chat.tools.validate`)
/// and the tag its real backend would emit on success.
pub struct StubOperation {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: fn() -> Value,
    pub output_tag: &'static str,
}

pub const OPERATIONS: &[StubOperation] = &[
    StubOperation {
        name: "browser_open",
        description: "Open a URL in a managed browser session.",
        parameters: browser_open_schema,
        output_tag: "browser_content",
    },
    StubOperation {
        name: "browser_content",
        description: "Read the rendered text content of the current browser page.",
        parameters: browser_content_schema,
        output_tag: "browser_content",
    },
    StubOperation {
        name: "vnc_screenshot",
        description: "Capture a frame from a VNC-connected display.",
        parameters: vnc_screenshot_schema,
        output_tag: "vnc_frame",
    },
    StubOperation {
        name: "vision_describe",
        description: "Describe the contents of an image using a vision model.",
        parameters: vision_describe_schema,
        output_tag: "vision_result",
    },
];

fn browser_open_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": { "url": { "type": "string" } },
        "required": ["url"]
    })
}

fn browser_content_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn vnc_screenshot_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": { "host": { "type": "string" }, "display": { "type": "integer" } },
        "required": ["host"]
    })
}

fn vision_describe_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": { "image_url": { "type": "string" } },
        "required": ["image_url"]
    })
}

pub fn find(name: &str) -> Option<&'static StubOperation> {
    OPERATIONS.iter().find(|op| op.name == name)
}

/// Validate `arguments` against the operation's JSON Schema `required` list,
/// then return the structured "backend not configured" error every stub
/// operation produces on a valid call.
pub fn dispatch(op: &StubOperation, arguments: &Value) -> (String, bool) {
    if let Some(missing) = first_missing_required(&(op.parameters)(), arguments) {
        return (
            serde_json::json!({
                "type": op.output_tag,
                "error": format!("missing required argument '{missing}'"),
            })
            .to_string(),
            true,
        );
    }

    (
        serde_json::json!({
            "type": op.output_tag,
            "error": format!("'{}' has no backend configured", op.name),
            "message": format!(
                "{} is a registered operation but no {} backend is wired up in this deployment.",
                op.name, op.output_tag
            ),
        })
        .to_string(),
        true,
    )
}

fn first_missing_required(schema: &Value, arguments: &Value) -> Option<String> {
    let required = schema.get("required")?.as_array()?;
    required
        .iter()
        .filter_map(|r| r.as_str())
        .find(|name| arguments.get(name).is_none())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_argument_is_reported_before_backend_error() {
        let op = find("browser_open").unwrap();
        let (content, is_error) = dispatch(op, &serde_json::json!({}));
        assert!(is_error);
        assert!(content.contains("missing required argument 'url'"));
    }

    #[test]
    fn valid_call_reports_missing_backend_tagged_for_collapsing() {
        let op = find("vnc_screenshot").unwrap();
        let (content, is_error) = dispatch(op, &serde_json::json!({"host": "10.0.0.5"}));
        assert!(is_error);
        let parsed: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["type"], "vnc_frame");
    }
}
